use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::dokuwiki::SourceApi;

/// User and group the source uses for anonymous visitors.
pub const ANONYMOUS_USER: &str = "!!notset!!";
pub const ALL_USERS_GROUP: &str = "@ALL";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencerOptions {
    /// Restrict the run to these page ids. Empty means every page.
    pub only_ids: Vec<String>,
    /// Drop pages anonymous visitors cannot read.
    pub only_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUnit {
    pub page_id: String,
    pub revision: i64,
    /// `false` for the single unit synthesized for a page without history.
    pub from_history: bool,
}

impl PageUnit {
    /// Revision to request from the source. Pages without history only
    /// accept the current revision, addressed as `0`.
    pub fn fetch_revision(&self) -> i64 {
        if self.from_history { self.revision } else { 0 }
    }
}

/// Lists every revision of every selected page, oldest first.
pub fn enumerate<S>(source: &mut S, options: &SequencerOptions) -> Result<Vec<PageUnit>>
where
    S: SourceApi + ?Sized,
{
    let pages = source.list_pages().context("failed to list source pages")?;
    let mut units = Vec::new();
    for page in pages {
        if !options.only_ids.is_empty() && !options.only_ids.contains(&page.id) {
            continue;
        }
        if options.only_public && !is_public(source, &page.id)? {
            info!(page_id = %page.id, "skipping non-public page");
            continue;
        }
        let history = source
            .get_page_history(&page.id)
            .with_context(|| format!("failed to load history of {}", page.id))?;
        if history.is_empty() {
            debug!(page_id = %page.id, revision = page.revision, "page has no history");
            units.push(PageUnit {
                page_id: page.id,
                revision: page.revision,
                from_history: false,
            });
            continue;
        }
        units.extend(history.into_iter().map(|entry| PageUnit {
            page_id: page.id.clone(),
            revision: entry.revision,
            from_history: true,
        }));
    }
    units.sort_by_key(|unit| unit.revision);
    Ok(units)
}

pub fn public_permission<S>(source: &mut S, page_id: &str) -> Result<i64>
where
    S: SourceApi + ?Sized,
{
    source
        .acl_check(page_id, ANONYMOUS_USER, &[ALL_USERS_GROUP])
        .with_context(|| format!("failed to check permissions of {page_id}"))
}

pub fn is_public<S>(source: &mut S, page_id: &str) -> Result<bool>
where
    S: SourceApi + ?Sized,
{
    Ok(public_permission(source, page_id)? != 0)
}
