use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;
use crate::http::HttpSettings;
use crate::sequencer::SequencerOptions;

pub const DEFAULT_WIKIJS_LOCALE: &str = "de";
pub const DEFAULT_WIKIJS_EDITOR: &str = "ckeditor";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationConfig {
    #[serde(default)]
    pub migration: MigrationSection,
    pub dokuwiki: Option<DokuWikiConfig>,
    pub bookstack: Option<BookStackConfig>,
    pub wikijs: Option<WikiJsConfig>,
    /// Target of `dokuwiki migrate`.
    pub mirror: Option<DokuWikiConfig>,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationSection {
    pub only_public: Option<bool>,
    #[serde(default)]
    pub only_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DokuWikiConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    /// The wiki renders `/_media/...` and `/ns/page` style URLs.
    #[serde(default)]
    pub pretty_urls: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BookStackConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: BookStackToken,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BookStackToken {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WikiJsConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_wikijs_locale")]
    pub locale: String,
    #[serde(default = "default_wikijs_editor")]
    pub editor: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
}

fn default_wikijs_locale() -> String {
    DEFAULT_WIKIJS_LOCALE.to_string()
}

fn default_wikijs_editor() -> String {
    DEFAULT_WIKIJS_EDITOR.to_string()
}

impl MigrationConfig {
    /// Only pages readable by anonymous visitors are migrated unless disabled.
    pub fn only_public(&self) -> bool {
        self.migration.only_public.unwrap_or(true)
    }

    pub fn sequencer_options(&self) -> SequencerOptions {
        SequencerOptions {
            only_ids: self.migration.only_ids.clone(),
            only_public: self.only_public(),
        }
    }

    /// Resolve the source wiki: env DOKUWIKI_AUTH_TOKEN > config.
    pub fn source(&self) -> Result<DokuWikiConfig> {
        let mut config = self
            .dokuwiki
            .clone()
            .ok_or(MigrateError::MissingConfig("dokuwiki"))?;
        if let Some(token) = env_value("DOKUWIKI_AUTH_TOKEN") {
            config.auth_token = Some(token);
        }
        Ok(config)
    }

    /// Resolve the mirror target: env DOKUWIKI_MIRROR_AUTH_TOKEN > config.
    pub fn mirror(&self) -> Result<DokuWikiConfig> {
        let mut config = self
            .mirror
            .clone()
            .ok_or(MigrateError::MissingConfig("mirror"))?;
        if let Some(token) = env_value("DOKUWIKI_MIRROR_AUTH_TOKEN") {
            config.auth_token = Some(token);
        }
        Ok(config)
    }

    /// Resolve BookStack: env BOOKSTACK_TOKEN_ID / BOOKSTACK_TOKEN_SECRET > config.
    pub fn bookstack(&self) -> Result<BookStackConfig> {
        let mut config = self
            .bookstack
            .clone()
            .ok_or(MigrateError::MissingConfig("bookstack"))?;
        if let Some(id) = env_value("BOOKSTACK_TOKEN_ID") {
            config.token.id = id;
        }
        if let Some(secret) = env_value("BOOKSTACK_TOKEN_SECRET") {
            config.token.secret = secret;
        }
        Ok(config)
    }

    /// Resolve Wiki.js: env WIKIJS_AUTH_TOKEN > config.
    pub fn wikijs(&self) -> Result<WikiJsConfig> {
        let mut config = self
            .wikijs
            .clone()
            .ok_or(MigrateError::MissingConfig("wikijs"))?;
        if let Some(token) = env_value("WIKIJS_AUTH_TOKEN") {
            config.auth_token = token;
        }
        Ok(config)
    }

    /// HTTP tuning: env WIKIMIGRATOR_* > config > defaults.
    pub fn http_settings(&self) -> HttpSettings {
        let defaults = HttpSettings::default();
        HttpSettings {
            user_agent: self.http.user_agent.clone().unwrap_or(defaults.user_agent),
            timeout_ms: self.http.timeout_ms.unwrap_or(defaults.timeout_ms),
            rate_limit_ms: self.http.rate_limit_ms.unwrap_or(defaults.rate_limit_ms),
        }
        .with_env_overrides()
    }
}

/// Load and parse a MigrationConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrationConfig> {
    if !config_path.exists() {
        return Ok(MigrationConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrationConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
