use anyhow::{Context, Result, bail};
use reqwest::blocking::RequestBuilder;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::config::BookStackConfig;
use crate::error::MigrateError;
use crate::http::{HttpSession, HttpSettings, join_url};
use crate::migrator::{Destination, DestinationKind, MediaUpload, NewPage, PageLayout};
use crate::page_path::{PagePath, map_page_id, title_case};
use crate::progress::{ContainerRef, MigrationProgress, PageRef};

const SERVICE: &str = "BookStack";
const LIST_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Book {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Chapter {
    pub id: i64,
    pub book_id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Page {
    pub id: i64,
    pub book_id: i64,
    #[serde(default)]
    pub chapter_id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub path: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NewBookPage<'a> {
    pub name: &'a str,
    pub html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: Vec<T>,
    #[serde(default)]
    total: usize,
}

pub trait BookStackApi {
    fn create_book(&mut self, name: &str) -> Result<Book>;
    fn create_chapter(&mut self, book_id: i64, name: &str) -> Result<Chapter>;
    fn create_page(&mut self, page: &NewBookPage<'_>) -> Result<Page>;
    fn update_page(&mut self, page_id: i64, html: &str) -> Result<()>;
    /// Uploads a gallery image attached to a page.
    fn create_image(&mut self, page_id: i64, file_name: &str, bytes: Vec<u8>) -> Result<Image>;
    fn list_books(&mut self) -> Result<Vec<Book>>;
    fn delete_book(&mut self, book_id: i64) -> Result<()>;
    fn request_count(&self) -> usize;
}

pub struct BookStackClient {
    base_url: String,
    authorization: String,
    session: HttpSession,
}

impl BookStackClient {
    pub fn new(config: &BookStackConfig, settings: HttpSettings) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.clone(),
            authorization: format!("Token {}:{}", config.token.id, config.token.secret),
            session: HttpSession::new(SERVICE, settings)?,
        })
    }

    fn api_url(&self, path: &str) -> String {
        join_url(&self.base_url, &format!("/api{path}"))
    }

    fn request_json<T: DeserializeOwned>(
        &mut self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let request = request.header(AUTHORIZATION, &self.authorization);
        let payload: Value = self.session.send_json(operation, request)?;
        check_error(operation, &payload)?;
        serde_json::from_value(payload)
            .with_context(|| format!("failed to decode {SERVICE} {operation} response"))
    }
}

/// BookStack reports failures as `{"error": {"code": .., "message": ..}}`.
fn check_error(operation: &str, payload: &Value) -> Result<()> {
    let Some(error) = payload.get("error") else {
        return Ok(());
    };
    Err(MigrateError::Remote {
        service: SERVICE,
        operation: operation.to_string(),
        code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    }
    .into())
}

impl BookStackApi for BookStackClient {
    fn create_book(&mut self, name: &str) -> Result<Book> {
        let request = self
            .session
            .client()
            .post(self.api_url("/books"))
            .json(&json!({"name": name}));
        self.request_json("books.create", request)
    }

    fn create_chapter(&mut self, book_id: i64, name: &str) -> Result<Chapter> {
        let request = self
            .session
            .client()
            .post(self.api_url("/chapters"))
            .json(&json!({"name": name, "book_id": book_id}));
        self.request_json("chapters.create", request)
    }

    fn create_page(&mut self, page: &NewBookPage<'_>) -> Result<Page> {
        let request = self
            .session
            .client()
            .post(self.api_url("/pages"))
            .json(page);
        self.request_json("pages.create", request)
    }

    fn update_page(&mut self, page_id: i64, html: &str) -> Result<()> {
        let request = self
            .session
            .client()
            .put(self.api_url(&format!("/pages/{page_id}")))
            .json(&json!({"html": html}));
        let _: Value = self.request_json("pages.update", request)?;
        Ok(())
    }

    fn create_image(&mut self, page_id: i64, file_name: &str, bytes: Vec<u8>) -> Result<Image> {
        let form = Form::new()
            .text("uploaded_to", page_id.to_string())
            .text("type", "gallery")
            .text("name", file_name.to_string())
            .part("image", Part::bytes(bytes).file_name(file_name.to_string()));
        let request = self
            .session
            .client()
            .post(self.api_url("/image-gallery"))
            .multipart(form);
        self.request_json("image-gallery.create", request)
    }

    fn list_books(&mut self) -> Result<Vec<Book>> {
        let mut books = Vec::new();
        loop {
            let request = self
                .session
                .client()
                .get(self.api_url("/books"))
                .query(&[("count", LIST_PAGE_SIZE), ("offset", books.len())]);
            let listing: Listing<Book> = self.request_json("books.list", request)?;
            let received = listing.data.len();
            books.extend(listing.data);
            if received == 0 || books.len() >= listing.total {
                break;
            }
        }
        Ok(books)
    }

    fn delete_book(&mut self, book_id: i64) -> Result<()> {
        let request = self
            .session
            .client()
            .delete(self.api_url(&format!("/books/{book_id}")))
            .header(AUTHORIZATION, &self.authorization);
        self.session.send("books.delete", request)?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.session.request_count()
    }
}

/// Books, chapters and pages. Namespaces become books and chapters, media
/// become gallery images of the page that first references them.
pub struct BookStackDestination<A> {
    api: A,
}

impl<A: BookStackApi> BookStackDestination<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn into_inner(self) -> A {
        self.api
    }
}

impl<A: BookStackApi> Destination for BookStackDestination<A> {
    fn kind(&self) -> DestinationKind {
        DestinationKind::BookStack
    }

    fn layout(&self) -> PageLayout {
        PageLayout::Hierarchical
    }

    fn page_key(&self, _page_id: &str, path: &PagePath) -> String {
        path.to_string()
    }

    fn create_container(&mut self, slug: &str) -> Result<ContainerRef> {
        let book = self.api.create_book(&title_case(slug))?;
        Ok(ContainerRef {
            id: book.id.to_string(),
            slug: book.slug,
            name: book.name,
        })
    }

    fn create_subcontainer(&mut self, container: &ContainerRef, slug: &str) -> Result<ContainerRef> {
        let chapter = self
            .api
            .create_chapter(parse_id(&container.id)?, &title_case(slug))?;
        Ok(ContainerRef {
            id: chapter.id.to_string(),
            slug: chapter.slug,
            name: chapter.name,
        })
    }

    fn create_page(&mut self, page: &NewPage<'_>) -> Result<PageRef> {
        let name = title_case(&page.path.leaf);
        let book_id = page.container.map(|book| parse_id(&book.id)).transpose()?;
        let chapter_id = page
            .subcontainer
            .map(|chapter| parse_id(&chapter.id))
            .transpose()?;
        let created = self.api.create_page(&NewBookPage {
            name: &name,
            html: page.content,
            book_id,
            chapter_id,
        })?;
        Ok(PageRef {
            id: created.id.to_string(),
            slug: Some(created.slug),
        })
    }

    fn update_page(&mut self, page: &PageRef, content: &str) -> Result<()> {
        self.api.update_page(parse_id(&page.id)?, content)
    }

    fn media_needs_page(&self) -> bool {
        true
    }

    fn upload_media(
        &mut self,
        upload: MediaUpload<'_>,
        page: Option<&PageRef>,
        _progress: &mut MigrationProgress,
    ) -> Result<String> {
        let Some(page) = page else {
            bail!("{SERVICE} images must be attached to a page ({})", upload.media.id);
        };
        let image = self
            .api
            .create_image(parse_id(&page.id)?, upload.media.file_name(), upload.bytes)?;
        Ok(image.path)
    }

    fn address_for(&self, page_id: &str, progress: &MigrationProgress) -> Option<String> {
        let path = map_page_id(page_id).ok()?;
        let book = progress.containers.get(&path.container)?;
        let page = progress.page(&path.to_string())?;
        let slug = page.page.slug.as_ref()?;
        Some(format!("/books/{}/page/{slug}", book.slug))
    }

    fn request_count(&self) -> usize {
        self.api.request_count()
    }
}

/// Deletes every book, which takes chapters, pages and images with it.
pub fn delete_all_books<A: BookStackApi + ?Sized>(api: &mut A) -> Result<usize> {
    let books = api.list_books()?;
    for book in &books {
        info!(book_id = book.id, name = %book.name, "deleting book");
        api.delete_book(book.id)
            .with_context(|| format!("failed to delete book {}", book.slug))?;
    }
    Ok(books.len())
}

fn parse_id(value: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("invalid {SERVICE} id {value:?} in migration progress"))
}
