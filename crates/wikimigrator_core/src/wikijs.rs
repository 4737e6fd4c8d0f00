use anyhow::{Context, Result, anyhow};
use reqwest::blocking::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::WikiJsConfig;
use crate::error::MigrateError;
use crate::http::{HttpSession, HttpSettings, join_url};
use crate::migrator::{Destination, DestinationKind, MediaUpload, NewPage, PageLayout};
use crate::page_path::{PagePath, flat_path, leaf_title};
use crate::progress::{MigrationProgress, PageRef};

const SERVICE: &str = "Wiki.js";
/// Asset folder id of the storage root.
pub const ROOT_FOLDER_ID: i64 = 0;

const RESPONSE_RESULT: &str = "responseResult { succeeded errorCode slug message }";

const CREATE_PAGE: &str = r#"
mutation ($content: String!, $description: String!, $editor: String!, $isPublished: Boolean!,
          $isPrivate: Boolean!, $locale: String!, $path: String!, $tags: [String]!, $title: String!) {
  pages {
    create(content: $content, description: $description, editor: $editor,
           isPublished: $isPublished, isPrivate: $isPrivate, locale: $locale,
           path: $path, tags: $tags, title: $title) {
      RESPONSE_RESULT
      page { id path title }
    }
  }
}"#;

const UPDATE_PAGE: &str = r#"
mutation ($id: Int!, $content: String!, $editor: String!, $tags: [String]!) {
  pages {
    update(id: $id, content: $content, editor: $editor, tags: $tags) {
      RESPONSE_RESULT
    }
  }
}"#;

const LIST_PAGES: &str = "query { pages { list { id path title } } }";

const DELETE_PAGE: &str = r#"
mutation ($id: Int!) {
  pages {
    delete(id: $id) {
      RESPONSE_RESULT
    }
  }
}"#;

const CREATE_FOLDER: &str = r#"
mutation ($parentFolderId: Int!, $slug: String!, $name: String) {
  assets {
    createFolder(parentFolderId: $parentFolderId, slug: $slug, name: $name) {
      RESPONSE_RESULT
    }
  }
}"#;

const LIST_FOLDERS: &str = r#"
query ($parentFolderId: Int!) {
  assets {
    folders(parentFolderId: $parentFolderId) { id slug name }
  }
}"#;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WikiJsPage {
    pub id: i64,
    pub path: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AssetFolder {
    pub id: i64,
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWikiJsPage<'a> {
    pub path: &'a str,
    pub title: &'a str,
    pub content: &'a str,
    pub editor: &'a str,
    pub locale: &'a str,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<GraphQlData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct GraphQlData {
    pages: Option<PagesData>,
    assets: Option<AssetsData>,
}

#[derive(Debug, Default, Deserialize)]
struct PagesData {
    create: Option<MutationResult>,
    update: Option<MutationResult>,
    delete: Option<MutationResult>,
    list: Option<Vec<WikiJsPage>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetsData {
    create_folder: Option<MutationResult>,
    folders: Option<Vec<AssetFolder>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationResult {
    response_result: ResponseResult,
    #[serde(default)]
    page: Option<WikiJsPage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseResult {
    succeeded: bool,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    slug: String,
    message: Option<String>,
}

impl MutationResult {
    fn ensure_succeeded(self, operation: &str) -> Result<Self> {
        if self.response_result.succeeded {
            return Ok(self);
        }
        let result = self.response_result;
        Err(MigrateError::Remote {
            service: SERVICE,
            operation: operation.to_string(),
            code: result.error_code,
            message: result.message.unwrap_or(result.slug),
        }
        .into())
    }
}

pub trait WikiJsApi {
    fn create_page(&mut self, page: &NewWikiJsPage<'_>) -> Result<WikiJsPage>;
    fn update_page(&mut self, page_id: i64, content: &str, editor: &str) -> Result<()>;
    fn list_pages(&mut self) -> Result<Vec<WikiJsPage>>;
    fn delete_page(&mut self, page_id: i64) -> Result<()>;
    fn list_folders(&mut self, parent_id: i64) -> Result<Vec<AssetFolder>>;
    /// Creates a folder and looks it up again to learn its id.
    fn create_folder(&mut self, parent_id: i64, slug: &str) -> Result<AssetFolder>;
    fn upload_file(&mut self, folder_id: i64, file_name: &str, bytes: Vec<u8>) -> Result<()>;
    fn request_count(&self) -> usize;
}

pub struct WikiJsClient {
    base_url: String,
    auth_token: String,
    session: HttpSession,
}

impl WikiJsClient {
    pub fn new(config: &WikiJsConfig, settings: HttpSettings) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
            session: HttpSession::new(SERVICE, settings)?,
        })
    }

    fn graphql(&mut self, operation: &str, query: &str, variables: Value) -> Result<GraphQlData> {
        let query = query.replace("RESPONSE_RESULT", RESPONSE_RESULT);
        let request = self
            .session
            .client()
            .post(join_url(&self.base_url, "/graphql"))
            .bearer_auth(&self.auth_token)
            .json(&json!({"query": query, "variables": variables}));
        let response: GraphQlResponse = self.session.send_json(operation, request)?;
        if !response.errors.is_empty() {
            let message = response
                .errors
                .into_iter()
                .map(|error| error.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(MigrateError::Remote {
                service: SERVICE,
                operation: operation.to_string(),
                code: 0,
                message,
            }
            .into());
        }
        response
            .data
            .ok_or_else(|| anyhow!("{SERVICE} {operation} returned no data"))
    }
}

fn missing(operation: &str) -> anyhow::Error {
    anyhow!("{SERVICE} {operation} response is missing its payload")
}

impl WikiJsApi for WikiJsClient {
    fn create_page(&mut self, page: &NewWikiJsPage<'_>) -> Result<WikiJsPage> {
        let operation = "pages.create";
        let data = self.graphql(
            operation,
            CREATE_PAGE,
            json!({
                "content": page.content,
                "description": "",
                "editor": page.editor,
                "isPublished": true,
                "isPrivate": false,
                "locale": page.locale,
                "path": page.path,
                "tags": [],
                "title": page.title,
            }),
        )?;
        data.pages
            .and_then(|pages| pages.create)
            .ok_or_else(|| missing(operation))?
            .ensure_succeeded(operation)?
            .page
            .ok_or_else(|| missing(operation))
    }

    fn update_page(&mut self, page_id: i64, content: &str, editor: &str) -> Result<()> {
        let operation = "pages.update";
        let data = self.graphql(
            operation,
            UPDATE_PAGE,
            json!({"id": page_id, "content": content, "editor": editor, "tags": []}),
        )?;
        data.pages
            .and_then(|pages| pages.update)
            .ok_or_else(|| missing(operation))?
            .ensure_succeeded(operation)?;
        Ok(())
    }

    fn list_pages(&mut self) -> Result<Vec<WikiJsPage>> {
        let operation = "pages.list";
        let data = self.graphql(operation, LIST_PAGES, json!({}))?;
        data.pages
            .and_then(|pages| pages.list)
            .ok_or_else(|| missing(operation))
    }

    fn delete_page(&mut self, page_id: i64) -> Result<()> {
        let operation = "pages.delete";
        let data = self.graphql(operation, DELETE_PAGE, json!({"id": page_id}))?;
        data.pages
            .and_then(|pages| pages.delete)
            .ok_or_else(|| missing(operation))?
            .ensure_succeeded(operation)?;
        Ok(())
    }

    fn list_folders(&mut self, parent_id: i64) -> Result<Vec<AssetFolder>> {
        let operation = "assets.folders";
        let data = self.graphql(operation, LIST_FOLDERS, json!({"parentFolderId": parent_id}))?;
        data.assets
            .and_then(|assets| assets.folders)
            .ok_or_else(|| missing(operation))
    }

    fn create_folder(&mut self, parent_id: i64, slug: &str) -> Result<AssetFolder> {
        let operation = "assets.createFolder";
        let data = self.graphql(
            operation,
            CREATE_FOLDER,
            json!({"parentFolderId": parent_id, "slug": slug, "name": slug}),
        )?;
        data.assets
            .and_then(|assets| assets.create_folder)
            .ok_or_else(|| missing(operation))?
            .ensure_succeeded(operation)?;
        self.list_folders(parent_id)?
            .into_iter()
            .find(|folder| folder.slug == slug)
            .ok_or_else(|| anyhow!("{SERVICE} folder {slug} not found after creating it"))
    }

    fn upload_file(&mut self, folder_id: i64, file_name: &str, bytes: Vec<u8>) -> Result<()> {
        let form = Form::new()
            .text("mediaUpload", json!({"folderId": folder_id}).to_string())
            .part(
                "mediaUpload",
                Part::bytes(bytes).file_name(file_name.to_string()),
            );
        let request = self
            .session
            .client()
            .post(join_url(&self.base_url, "/u"))
            .bearer_auth(&self.auth_token)
            .multipart(form);
        self.session.send("upload", request)?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.session.request_count()
    }
}

/// Path-addressed pages and folder-based asset storage.
pub struct WikiJsDestination<A> {
    api: A,
    locale: String,
    editor: String,
}

impl<A: WikiJsApi> WikiJsDestination<A> {
    pub fn new(api: A, locale: &str, editor: &str) -> Self {
        Self {
            api,
            locale: locale.to_string(),
            editor: editor.to_string(),
        }
    }

    pub fn into_inner(self) -> A {
        self.api
    }

    /// Makes sure every folder of `segments` exists and returns the id of the
    /// deepest one.
    fn ensure_folders(&mut self, segments: &[&str], progress: &mut MigrationProgress) -> Result<i64> {
        let mut parent_id = ROOT_FOLDER_ID;
        let mut key = String::new();
        for segment in segments {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(segment);
            if let Some(id) = progress.folders.get(&key) {
                parent_id = *id;
                continue;
            }
            let existing = self
                .api
                .list_folders(parent_id)?
                .into_iter()
                .find(|folder| folder.slug == *segment);
            let folder = match existing {
                Some(folder) => folder,
                None => {
                    info!(folder = %key, "creating asset folder");
                    self.api.create_folder(parent_id, segment)?
                }
            };
            debug!(folder = %key, id = folder.id, "asset folder resolved");
            progress.folders.insert(key.clone(), folder.id);
            parent_id = folder.id;
        }
        Ok(parent_id)
    }
}

impl<A: WikiJsApi> Destination for WikiJsDestination<A> {
    fn kind(&self) -> DestinationKind {
        DestinationKind::WikiJs
    }

    fn layout(&self) -> PageLayout {
        PageLayout::Flat
    }

    fn page_key(&self, page_id: &str, _path: &PagePath) -> String {
        page_id.to_string()
    }

    fn create_page(&mut self, page: &NewPage<'_>) -> Result<PageRef> {
        let path = flat_path(page.page_id);
        let title = leaf_title(page.page_id);
        let created = self.api.create_page(&NewWikiJsPage {
            path: &path,
            title: &title,
            content: page.content,
            editor: &self.editor,
            locale: &self.locale,
        })?;
        Ok(PageRef {
            id: created.id.to_string(),
            slug: Some(created.path),
        })
    }

    fn update_page(&mut self, page: &PageRef, content: &str) -> Result<()> {
        let page_id = page
            .id
            .parse()
            .with_context(|| format!("invalid {SERVICE} page id {:?} in migration progress", page.id))?;
        self.api.update_page(page_id, content, &self.editor)
    }

    fn upload_media(
        &mut self,
        upload: MediaUpload<'_>,
        _page: Option<&PageRef>,
        progress: &mut MigrationProgress,
    ) -> Result<String> {
        let folders = upload.media.namespaces();
        let folder_id = self.ensure_folders(&folders, progress)?;
        let file_name = upload.media.file_name();
        self.api.upload_file(folder_id, file_name, upload.bytes)?;
        let mut segments = folders;
        segments.push(file_name);
        Ok(format!("/{}", segments.join("/")))
    }

    fn address_for(&self, page_id: &str, progress: &MigrationProgress) -> Option<String> {
        progress
            .page(page_id)
            .map(|_| format!("/{}", flat_path(page_id)))
    }

    fn request_count(&self) -> usize {
        self.api.request_count()
    }
}

/// Deletes every page of the wiki.
pub fn delete_all_pages<A: WikiJsApi + ?Sized>(api: &mut A) -> Result<usize> {
    let pages = api.list_pages()?;
    for page in &pages {
        info!(page_id = page.id, path = %page.path, "deleting page");
        api.delete_page(page.id)
            .with_context(|| format!("failed to delete page {}", page.path))?;
    }
    Ok(pages.len())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::dokuwiki::tests::MockWiki;
    use crate::migrator::Migrator;
    use crate::rewrite::MediaRef;
    use crate::sequencer::SequencerOptions;

    #[derive(Default)]
    struct MockWikiJs {
        pages: Vec<WikiJsPage>,
        locales: Vec<String>,
        updates: Vec<(i64, String)>,
        folders: BTreeMap<i64, Vec<AssetFolder>>,
        created_folders: Vec<(i64, String)>,
        uploads: Vec<(i64, String)>,
        deleted: Vec<i64>,
        next_id: i64,
        request_count: usize,
    }

    impl WikiJsApi for MockWikiJs {
        fn create_page(&mut self, page: &NewWikiJsPage<'_>) -> Result<WikiJsPage> {
            self.request_count += 1;
            self.next_id += 1;
            let created = WikiJsPage {
                id: self.next_id,
                path: page.path.to_string(),
                title: page.title.to_string(),
            };
            self.pages.push(created.clone());
            self.locales.push(page.locale.to_string());
            Ok(created)
        }

        fn update_page(&mut self, page_id: i64, content: &str, _editor: &str) -> Result<()> {
            self.request_count += 1;
            self.updates.push((page_id, content.to_string()));
            Ok(())
        }

        fn list_pages(&mut self) -> Result<Vec<WikiJsPage>> {
            self.request_count += 1;
            Ok(self.pages.clone())
        }

        fn delete_page(&mut self, page_id: i64) -> Result<()> {
            self.request_count += 1;
            self.deleted.push(page_id);
            Ok(())
        }

        fn list_folders(&mut self, parent_id: i64) -> Result<Vec<AssetFolder>> {
            self.request_count += 1;
            Ok(self.folders.get(&parent_id).cloned().unwrap_or_default())
        }

        fn create_folder(&mut self, parent_id: i64, slug: &str) -> Result<AssetFolder> {
            self.request_count += 1;
            self.next_id += 1;
            let folder = AssetFolder {
                id: self.next_id,
                slug: slug.to_string(),
                name: slug.to_string(),
            };
            self.folders.entry(parent_id).or_default().push(folder.clone());
            self.created_folders.push((parent_id, slug.to_string()));
            Ok(folder)
        }

        fn upload_file(&mut self, folder_id: i64, file_name: &str, _bytes: Vec<u8>) -> Result<()> {
            self.request_count += 1;
            self.uploads.push((folder_id, file_name.to_string()));
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    fn media(id: &str) -> MediaRef {
        MediaRef {
            id: id.to_string(),
            reference: format!("/_media/{id}"),
        }
    }

    fn upload(
        destination: &mut WikiJsDestination<MockWikiJs>,
        progress: &mut MigrationProgress,
        id: &str,
    ) -> String {
        let media = media(id);
        destination
            .upload_media(
                MediaUpload {
                    media: &media,
                    bytes: vec![1],
                },
                None,
                progress,
            )
            .expect("upload")
    }

    #[test]
    fn media_folders_are_created_once_and_memoized() {
        let mut destination = WikiJsDestination::new(MockWikiJs::default(), "en", "ckeditor");
        let mut progress = MigrationProgress::default();

        let first = upload(&mut destination, &mut progress, "team:img:logo.png");
        let second = upload(&mut destination, &mut progress, "team:img:banner.png");
        let third = upload(&mut destination, &mut progress, "team:doc.pdf");

        assert_eq!(first, "/team/img/logo.png");
        assert_eq!(second, "/team/img/banner.png");
        assert_eq!(third, "/team/doc.pdf");

        let api = destination.into_inner();
        assert_eq!(
            api.created_folders,
            vec![(0, "team".to_string()), (1, "img".to_string())]
        );
        assert_eq!(progress.folders.get("team"), Some(&1));
        assert_eq!(progress.folders.get("team/img"), Some(&2));
        assert_eq!(
            api.uploads,
            vec![
                (2, "logo.png".to_string()),
                (2, "banner.png".to_string()),
                (1, "doc.pdf".to_string()),
            ]
        );
    }

    #[test]
    fn existing_remote_folders_are_reused() {
        let mut api = MockWikiJs::default();
        api.folders.insert(
            ROOT_FOLDER_ID,
            vec![AssetFolder {
                id: 40,
                slug: "wiki".to_string(),
                name: "wiki".to_string(),
            }],
        );
        let mut destination = WikiJsDestination::new(api, "en", "ckeditor");
        let mut progress = MigrationProgress::default();

        assert_eq!(upload(&mut destination, &mut progress, "wiki:logo.png"), "/wiki/logo.png");
        let api = destination.into_inner();
        assert!(api.created_folders.is_empty());
        assert_eq!(api.uploads, vec![(40, "logo.png".to_string())]);
    }

    #[test]
    fn root_media_needs_no_folder() {
        let mut destination = WikiJsDestination::new(MockWikiJs::default(), "en", "ckeditor");
        let mut progress = MigrationProgress::default();
        assert_eq!(upload(&mut destination, &mut progress, "logo.png"), "/logo.png");
        assert!(progress.folders.is_empty());
        assert_eq!(destination.into_inner().uploads, vec![(ROOT_FOLDER_ID, "logo.png".to_string())]);
    }

    #[test]
    fn pages_are_created_by_path_and_linked_by_path() {
        let mut source = MockWiki::default()
            .with_page("docs:getting_started", 1, &[1])
            .with_page("docs:faq", 2, &[2])
            .with_html(
                "docs:faq",
                2,
                r#"<a href="/doku.php?id=docs:getting_started">start</a><img src="/lib/exe/fetch.php?media=docs:faq.png">"#,
            );
        let mut destination = WikiJsDestination::new(MockWikiJs::default(), "de", "ckeditor");
        let mut progress = MigrationProgress::default();

        Migrator::new(
            &mut source,
            &mut destination,
            &mut progress,
            SequencerOptions::default(),
        )
        .migrate()
        .expect("migrate");

        assert_eq!(
            destination.address_for("docs:faq", &progress).as_deref(),
            Some("/docs/faq")
        );
        let api = destination.into_inner();
        assert_eq!(api.pages[0].path, "docs/getting_started");
        assert_eq!(api.pages[0].title, "Getting_Started");
        assert_eq!(api.locales, vec!["de", "de"]);
        assert!(api.updates.is_empty());
        assert!(progress.page("docs:faq").is_some());
        assert_eq!(api.uploads.len(), 1);
    }

    #[test]
    fn delete_all_pages_removes_every_listed_page() {
        let mut api = MockWikiJs::default();
        for path in ["a", "b/c"] {
            api.create_page(&NewWikiJsPage {
                path,
                title: path,
                content: "",
                editor: "ckeditor",
                locale: "en",
            })
            .expect("page");
        }
        assert_eq!(delete_all_pages(&mut api).expect("reset"), 2);
        assert_eq!(api.deleted, vec![1, 2]);
    }

    #[test]
    fn failed_response_results_become_remote_errors() {
        let result: MutationResult = serde_json::from_value(json!({
            "responseResult": {
                "succeeded": false,
                "errorCode": 6002,
                "slug": "PageDuplicateCreate",
                "message": "Cannot create this page because an entry already exists at the same path."
            }
        }))
        .expect("decode");
        let error = result.ensure_succeeded("pages.create").expect_err("must fail");
        assert!(error.to_string().contains("6002"));
    }

    #[test]
    fn queries_embed_the_response_result_fields() {
        for query in [CREATE_PAGE, UPDATE_PAGE, DELETE_PAGE, CREATE_FOLDER] {
            let rendered = query.replace("RESPONSE_RESULT", RESPONSE_RESULT);
            assert!(rendered.contains("responseResult { succeeded errorCode slug message }"));
        }
    }
}
