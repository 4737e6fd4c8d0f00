use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A book, chapter or folder created on the destination.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PageRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MigratedPage {
    pub page: PageRef,
    pub latest_revision: i64,
}

/// Durable record correlating source identifiers with destination resources.
///
/// Entries are only added after the matching destination call succeeded, so a
/// ledger saved after a failed run describes exactly what exists remotely.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MigrationProgress {
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerRef>,
    #[serde(default)]
    pub subcontainers: BTreeMap<String, ContainerRef>,
    #[serde(default)]
    pub pages: BTreeMap<String, MigratedPage>,
    /// Source media id to destination reference.
    #[serde(default)]
    pub media: BTreeMap<String, String>,
    /// Asset folder path to destination folder id.
    #[serde(default)]
    pub folders: BTreeMap<String, i64>,
}

impl MigrationProgress {
    pub fn page(&self, key: &str) -> Option<&MigratedPage> {
        self.pages.get(key)
    }

    pub fn is_migrated(&self, key: &str, revision: i64) -> bool {
        self.pages
            .get(key)
            .is_some_and(|page| page.latest_revision >= revision)
    }

    pub fn insert_page(&mut self, key: &str, page: PageRef, revision: i64) {
        self.pages.insert(
            key.to_string(),
            MigratedPage {
                page,
                latest_revision: revision,
            },
        );
    }

    /// Bumps the recorded revision of a page. Lower revisions are ignored.
    pub fn record_revision(&mut self, key: &str, revision: i64) {
        if let Some(page) = self.pages.get_mut(key)
            && revision > page.latest_revision
        {
            page.latest_revision = revision;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
            && self.subcontainers.is_empty()
            && self.pages.is_empty()
            && self.media.is_empty()
            && self.folders.is_empty()
    }
}

/// Load a ledger from TOML. A missing file yields an empty ledger.
pub fn load_progress(path: &Path) -> Result<MigrationProgress> {
    if !path.exists() {
        return Ok(MigrationProgress::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(MigrationProgress::default());
    }
    toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write the whole ledger back, replacing the previous file content.
pub fn save_progress(path: &Path, progress: &MigrationProgress) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered =
        toml::to_string_pretty(progress).context("failed to serialize migration progress")?;
    let staging = path.with_extension("toml.partial");
    fs::write(&staging, rendered)
        .with_context(|| format!("failed to write {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("failed to replace {}", path.display()))
}
