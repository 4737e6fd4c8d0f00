use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::dokuwiki::SourceApi;
use crate::migrator::{Destination, MediaUpload};
use crate::progress::{MigrationProgress, PageRef};
use crate::rewrite::MediaRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaResolution {
    /// Already uploaded by an earlier unit or run.
    Cached(String),
    Uploaded(String),
    /// The destination attaches media to pages and there is no page yet.
    Deferred,
}

impl MediaResolution {
    pub fn into_reference(self) -> Option<String> {
        match self {
            Self::Cached(reference) | Self::Uploaded(reference) => Some(reference),
            Self::Deferred => None,
        }
    }
}

/// Looks a media item up in the ledger and uploads it when it is unknown.
pub fn resolve<S, D>(
    source: &mut S,
    destination: &mut D,
    progress: &mut MigrationProgress,
    media: &MediaRef,
    page: Option<&PageRef>,
) -> Result<MediaResolution>
where
    S: SourceApi + ?Sized,
    D: Destination + ?Sized,
{
    if let Some(reference) = progress.media.get(&media.id) {
        debug!(media_id = %media.id, reference, "media already migrated");
        return Ok(MediaResolution::Cached(reference.clone()));
    }
    if page.is_none() && destination.media_needs_page() {
        debug!(media_id = %media.id, "deferring media until the page exists");
        return Ok(MediaResolution::Deferred);
    }
    let reference = upload(source, destination, progress, media, page)?;
    progress.media.insert(media.id.clone(), reference.clone());
    Ok(MediaResolution::Uploaded(reference))
}

/// Copies one media item from the source to the destination.
pub fn upload<S, D>(
    source: &mut S,
    destination: &mut D,
    progress: &mut MigrationProgress,
    media: &MediaRef,
    page: Option<&PageRef>,
) -> Result<String>
where
    S: SourceApi + ?Sized,
    D: Destination + ?Sized,
{
    let bytes = source
        .download(&media.reference)
        .with_context(|| format!("failed to download media {}", media.id))?;
    info!(
        media_id = %media.id,
        bytes = bytes.len(),
        destination = destination.kind().as_str(),
        "uploading media"
    );
    destination
        .upload_media(MediaUpload { media, bytes }, page, progress)
        .with_context(|| format!("failed to upload media {}", media.id))
}
