use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::MigrateError;

pub const DEFAULT_USER_AGENT: &str = "wikimigrator/0.2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    /// Minimum delay between two requests issued by the same session.
    pub rate_limit_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 30_000,
            rate_limit_ms: 0,
        }
    }
}

impl HttpSettings {
    /// Environment overrides on top of the given baseline.
    pub fn with_env_overrides(self) -> Self {
        Self {
            user_agent: env_value("WIKIMIGRATOR_USER_AGENT", &self.user_agent),
            timeout_ms: env_value_u64("WIKIMIGRATOR_HTTP_TIMEOUT_MS", self.timeout_ms),
            rate_limit_ms: env_value_u64("WIKIMIGRATOR_RATE_LIMIT_MS", self.rate_limit_ms),
        }
    }
}

/// Blocking HTTP session shared by the wiki clients.
pub struct HttpSession {
    service: &'static str,
    client: Client,
    settings: HttpSettings,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl HttpSession {
    pub fn new(service: &'static str, settings: HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.clone())
            .cookie_store(true)
            .build()
            .with_context(|| format!("failed to build {service} HTTP client"))?;
        Ok(Self {
            service,
            client,
            settings,
            last_request_at: None,
            request_count: 0,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    /// Sends a request and fails on transport errors and non-success statuses.
    pub fn send(&mut self, operation: &str, request: RequestBuilder) -> Result<Response> {
        self.apply_rate_limit();
        debug!(service = self.service, operation, "sending request");
        let response = request
            .send()
            .with_context(|| format!("failed to call {} {operation}", self.service))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(MigrateError::Http {
                service: self.service,
                operation: operation.to_string(),
                status: status.as_u16(),
                body: truncate(&body, 512),
            }
            .into());
        }
        Ok(response)
    }

    pub fn send_json<T: DeserializeOwned>(
        &mut self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(operation, request)?;
        response
            .json()
            .with_context(|| format!("failed to decode {} {operation} response", self.service))
    }

    pub fn send_bytes(&mut self, operation: &str, request: RequestBuilder) -> Result<Vec<u8>> {
        let response = self.send(operation, request)?;
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read {} {operation} body", self.service))?;
        Ok(bytes.to_vec())
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.settings.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

/// Joins a base URL and an absolute path without doubling the slash.
pub fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut output = value.chars().take(max_chars).collect::<String>();
    output.push_str("...");
    output
}

fn env_value(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
