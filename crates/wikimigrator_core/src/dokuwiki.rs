use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::config::DokuWikiConfig;
use crate::error::MigrateError;
use crate::http::{HttpSession, HttpSettings, join_url};
use crate::migrator::{ContentFormat, Destination, DestinationKind, MediaUpload, NewPage, PageLayout};
use crate::page_path::PagePath;
use crate::progress::{MigrationProgress, PageRef};
use crate::rewrite::UrlStyle;

const JSONRPC_PATH: &str = "/lib/exe/jsonrpc.php";
const SERVICE: &str = "DokuWiki";
const MIRROR_SUMMARY: &str = "migrated by wikimigrator";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PageInfo {
    pub id: String,
    #[serde(default, alias = "rev")]
    pub revision: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PageHistoryInfo {
    pub id: String,
    #[serde(default, alias = "rev")]
    pub revision: i64,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Identity {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Read side of a DokuWiki instance.
pub trait SourceApi {
    fn base_url(&self) -> &str;
    fn url_style(&self) -> UrlStyle;
    fn who_am_i(&mut self) -> Result<Identity>;
    fn list_pages(&mut self) -> Result<Vec<PageInfo>>;
    fn get_page_history(&mut self, page_id: &str) -> Result<Vec<PageHistoryInfo>>;
    /// Raw wiki text. Revision `0` means the current one.
    fn get_page(&mut self, page_id: &str, revision: i64) -> Result<String>;
    fn get_page_html(&mut self, page_id: &str, revision: i64) -> Result<String>;
    fn acl_check(&mut self, page_id: &str, user: &str, groups: &[&str]) -> Result<i64>;
    /// Fetches a reference found in rendered HTML, relative to the base URL.
    fn download(&mut self, reference: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

pub trait DokuWikiWriteApi: SourceApi {
    fn save_page(&mut self, page_id: &str, text: &str, summary: &str) -> Result<()>;
    fn save_media(&mut self, media_id: &str, bytes: &[u8], overwrite: bool) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

pub struct DokuWikiClient {
    base_url: String,
    auth_token: Option<String>,
    url_style: UrlStyle,
    session: HttpSession,
}

impl DokuWikiClient {
    pub fn new(config: &DokuWikiConfig, settings: HttpSettings) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
            url_style: UrlStyle::from_pretty_flag(config.pretty_urls),
            session: HttpSession::new(SERVICE, settings)?,
        })
    }

    fn call_optional<T: DeserializeOwned>(&mut self, method: &str, args: Value) -> Result<Option<T>> {
        let url = join_url(&self.base_url, &format!("{JSONRPC_PATH}/{method}"));
        let mut request = self.session.client().post(url).json(&args);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response: RpcResponse<T> = self.session.send_json(method, request)?;
        if let Some(error) = response.error
            && error.code != 0
        {
            return Err(MigrateError::Remote {
                service: SERVICE,
                operation: method.to_string(),
                code: error.code,
                message: error.message,
            }
            .into());
        }
        Ok(response.result)
    }

    fn call<T: DeserializeOwned>(&mut self, method: &str, args: Value) -> Result<T> {
        self.call_optional(method, args)?
            .ok_or_else(|| anyhow!("{SERVICE} call {method} returned no result"))
    }
}

impl SourceApi for DokuWikiClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_style(&self) -> UrlStyle {
        self.url_style
    }

    fn who_am_i(&mut self) -> Result<Identity> {
        self.call("core.whoAmI", json!({}))
    }

    fn list_pages(&mut self) -> Result<Vec<PageInfo>> {
        let pages = self.call_optional("core.listPages", json!({"namespace": "", "depth": 0}))?;
        Ok(pages.unwrap_or_default())
    }

    fn get_page_history(&mut self, page_id: &str) -> Result<Vec<PageHistoryInfo>> {
        let history =
            self.call_optional("core.getPageHistory", json!({"page": page_id, "first": 0}))?;
        Ok(history.unwrap_or_default())
    }

    fn get_page(&mut self, page_id: &str, revision: i64) -> Result<String> {
        self.call("core.getPage", json!({"page": page_id, "rev": revision}))
    }

    fn get_page_html(&mut self, page_id: &str, revision: i64) -> Result<String> {
        self.call("core.getPageHTML", json!({"page": page_id, "rev": revision}))
    }

    fn acl_check(&mut self, page_id: &str, user: &str, groups: &[&str]) -> Result<i64> {
        self.call(
            "core.aclCheck",
            json!({"page": page_id, "user": user, "groups": groups}),
        )
    }

    fn download(&mut self, reference: &str) -> Result<Vec<u8>> {
        let url = join_url(&self.base_url, reference);
        let mut request = self.session.client().get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        self.session
            .send_bytes("download", request)
            .with_context(|| format!("failed to download {url}"))
    }

    fn request_count(&self) -> usize {
        self.session.request_count()
    }
}

impl DokuWikiWriteApi for DokuWikiClient {
    fn save_page(&mut self, page_id: &str, text: &str, summary: &str) -> Result<()> {
        let _: Value = self.call(
            "core.savePage",
            json!({"page": page_id, "text": text, "summary": summary, "isminor": false}),
        )?;
        Ok(())
    }

    fn save_media(&mut self, media_id: &str, bytes: &[u8], overwrite: bool) -> Result<()> {
        let _: Value = self.call(
            "core.saveMedia",
            json!({"media": media_id, "base64": STANDARD.encode(bytes), "overwrite": overwrite}),
        )?;
        Ok(())
    }
}

/// A second DokuWiki receiving the source's wiki text under the same ids.
pub struct DokuWikiMirror<W> {
    target: W,
}

impl<W: DokuWikiWriteApi> DokuWikiMirror<W> {
    pub fn new(target: W) -> Self {
        Self { target }
    }

    pub fn into_inner(self) -> W {
        self.target
    }
}

impl<W: DokuWikiWriteApi> Destination for DokuWikiMirror<W> {
    fn kind(&self) -> DestinationKind {
        DestinationKind::DokuWiki
    }

    fn layout(&self) -> PageLayout {
        PageLayout::Flat
    }

    fn content_format(&self) -> ContentFormat {
        ContentFormat::WikiText
    }

    fn page_key(&self, page_id: &str, _path: &PagePath) -> String {
        page_id.to_string()
    }

    fn create_page(&mut self, page: &NewPage<'_>) -> Result<PageRef> {
        self.target
            .save_page(page.page_id, page.content, MIRROR_SUMMARY)
            .with_context(|| format!("failed to save page {}", page.page_id))?;
        Ok(PageRef {
            id: page.page_id.to_string(),
            slug: None,
        })
    }

    fn update_page(&mut self, page: &PageRef, content: &str) -> Result<()> {
        self.target
            .save_page(&page.id, content, MIRROR_SUMMARY)
            .with_context(|| format!("failed to save page {}", page.id))
    }

    fn upload_media(
        &mut self,
        upload: MediaUpload<'_>,
        _page: Option<&PageRef>,
        _progress: &mut MigrationProgress,
    ) -> Result<String> {
        info!(media_id = %upload.media.id, "saving media on mirror");
        self.target.save_media(&upload.media.id, &upload.bytes, true)?;
        Ok(upload.media.reference.clone())
    }

    fn address_for(&self, _page_id: &str, _progress: &MigrationProgress) -> Option<String> {
        None
    }

    fn request_count(&self) -> usize {
        self.target.request_count()
    }
}
