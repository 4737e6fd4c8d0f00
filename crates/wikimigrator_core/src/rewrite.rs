//! Rewrites source wiki references inside rendered HTML.
//!
//! The source renders links and media in one of two URL conventions. Pretty
//! URLs put the identifier in the path (`/_media/ns:file.png`, `/ns:page`);
//! canonical URLs go through the PHP entry points
//! (`/lib/exe/fetch.php?media=ns:file.png`, `/doku.php?id=ns:page`).
//! The convention is fixed per wiki and selected once through [`UrlStyle`].

use std::convert::Infallible;
use std::sync::LazyLock;

use regex::Regex;
use scraper::node::{Element, Node};
use scraper::{Html, Selector};
use tracing::{debug, warn};

static PRETTY_MEDIA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/_media/([^?#]+)").expect("pretty media pattern"));
static CANONICAL_MEDIA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/lib/exe/fetch\.php\?([^#]*)").expect("canonical media pattern")
});
static PRETTY_PAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/([^?#]*)(?:\?[^#]*)?(#.*)?$").expect("pretty page pattern"));
static CANONICAL_PAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/doku\.php\?([^#]*)(#.*)?$").expect("canonical page pattern")
});

static IMG_SRC: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img[src]").expect("img selector"));
static A_HREF: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

/// Paths served by the source that never name a page.
const NON_PAGE_PREFIXES: &[&str] = &["_media/", "_detail/", "_export/", "lib/", "doku.php"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStyle {
    Pretty,
    Canonical,
}

impl UrlStyle {
    pub fn from_pretty_flag(pretty_urls: bool) -> Self {
        if pretty_urls {
            Self::Pretty
        } else {
            Self::Canonical
        }
    }

    /// Extracts the bare media id from a `src`/`href` value.
    pub fn media_id(self, value: &str) -> Option<String> {
        match self {
            Self::Pretty => PRETTY_MEDIA
                .captures(value)
                .map(|captures| captures[1].to_string()),
            Self::Canonical => {
                let captures = CANONICAL_MEDIA.captures(value)?;
                query_param(&captures[1], "media")
            }
        }
    }

    /// Extracts the referenced page id (and fragment) from an `href` value.
    pub fn page_target(self, value: &str) -> Option<PageTarget> {
        match self {
            Self::Pretty => {
                let captures = PRETTY_PAGE.captures(value)?;
                let path = &captures[1];
                if path.is_empty()
                    || NON_PAGE_PREFIXES
                        .iter()
                        .any(|prefix| path.starts_with(prefix))
                {
                    return None;
                }
                Some(PageTarget {
                    id: path.replace('/', ":"),
                    fragment: captures.get(2).map(|m| m.as_str().to_string()),
                })
            }
            Self::Canonical => {
                let captures = CANONICAL_PAGE.captures(value)?;
                let id = query_param(&captures[1], "id")?;
                Some(PageTarget {
                    id,
                    fragment: captures.get(2).map(|m| m.as_str().to_string()),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTarget {
    pub id: String,
    pub fragment: Option<String>,
}

/// A media reference found in the HTML: the bare id and the attribute value
/// it was found in (relative to the source base URL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub id: String,
    pub reference: String,
}

impl MediaRef {
    /// Last namespace segment, used as the uploaded file name.
    pub fn file_name(&self) -> &str {
        self.id.rsplit(':').next().unwrap_or(&self.id)
    }

    /// Namespace segments in front of the file name.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut segments = self.id.split(':').collect::<Vec<_>>();
        segments.pop();
        segments.retain(|segment| !segment.is_empty());
        segments
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub html: String,
    pub changed: bool,
}

impl Rewritten {
    fn unchanged(html: &str) -> Self {
        Self {
            html: html.to_string(),
            changed: false,
        }
    }
}

/// Rewrites `img[src]` and file links that point at source media.
///
/// `resolve` returns the destination reference for a media item, or `None`
/// to leave the element untouched. Its errors abort the pass.
pub fn rewrite_media<F, E>(html: &str, style: UrlStyle, mut resolve: F) -> Result<Rewritten, E>
where
    F: FnMut(&MediaRef) -> Result<Option<String>, E>,
{
    rewrite_attributes(
        html,
        &[(&*IMG_SRC, "src"), (&*A_HREF, "href")],
        |attribute, value| {
            let Some(id) = style.media_id(value) else {
                if attribute == "src" {
                    debug!(value, "image source does not point at source media");
                }
                return Ok(None);
            };
            resolve(&MediaRef {
                id,
                reference: value.to_string(),
            })
        },
    )
}

/// Rewrites internal page links to the address `resolve` computes.
///
/// Hrefs for which `is_destination_media` holds were produced by the media
/// pass and are left alone. Targets `resolve` cannot place are left pointing
/// at the source.
pub fn rewrite_links<M, F>(
    html: &str,
    style: UrlStyle,
    is_destination_media: M,
    mut resolve: F,
) -> Rewritten
where
    M: Fn(&str) -> bool,
    F: FnMut(&str) -> Option<String>,
{
    let Ok(rewritten) = rewrite_attributes::<_, Infallible>(
        html,
        &[(&*A_HREF, "href")],
        |_, value| {
            if style.media_id(value).is_some() || is_destination_media(value) {
                return Ok(None);
            }
            let Some(target) = style.page_target(value) else {
                debug!(href = value, "link does not point at a source page");
                return Ok(None);
            };
            match resolve(&target.id) {
                Some(address) => Ok(Some(match target.fragment {
                    Some(fragment) => format!("{address}{fragment}"),
                    None => address,
                })),
                None => {
                    warn!(
                        page_id = %target.id,
                        "leaving link unchanged, target page is not migrated yet"
                    );
                    Ok(None)
                }
            }
        },
    );
    rewritten
}

fn rewrite_attributes<F, E>(
    html: &str,
    targets: &[(&Selector, &'static str)],
    mut rewrite: F,
) -> Result<Rewritten, E>
where
    F: FnMut(&'static str, &str) -> Result<Option<String>, E>,
{
    let mut document = Html::parse_fragment(html);
    let mut replacements = Vec::new();
    for &(selector, attribute) in targets {
        for element in document.select(selector) {
            let Some(value) = element.value().attr(attribute) else {
                continue;
            };
            if let Some(replacement) = rewrite(attribute, value)?
                && replacement != value
            {
                replacements.push((element.id(), attribute, replacement));
            }
        }
    }
    if replacements.is_empty() {
        return Ok(Rewritten::unchanged(html));
    }

    for (node_id, attribute, replacement) in replacements {
        if let Some(mut node) = document.tree.get_mut(node_id)
            && let Node::Element(element) = node.value()
        {
            set_attribute(element, attribute, &replacement);
        }
    }
    Ok(Rewritten {
        html: document.root_element().inner_html(),
        changed: true,
    })
}

fn set_attribute(element: &mut Element, attribute: &str, value: &str) {
    for (name, current) in element.attrs.iter_mut() {
        if &*name.local == attribute {
            *current = value.into();
            return;
        }
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
