//! HTTP mainshock lookup.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::MainshockSource;
use crate::domain::Mainshock;

/// Event service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Base URL; the event id is appended as a path segment
    #[serde(default)]
    pub base_url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    20
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Fetches `GET {base_url}/{event_id}` and parses the JSON body
pub struct HttpMainshockSource {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpMainshockSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_settings(settings: &SourceSettings) -> Result<Self> {
        let base_url = settings
            .base_url
            .clone()
            .context("source.base_url is not configured")?;
        Ok(Self::new(base_url, Duration::from_secs(settings.timeout_secs)))
    }

    fn event_url(&self, event_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), event_id)
    }
}

#[async_trait]
impl MainshockSource for HttpMainshockSource {
    async fn fetch(&self, event_id: &str) -> Result<Mainshock> {
        let url = self.event_url(event_id);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("Failed to fetch mainshock {}", event_id))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Event service returned {} for {}", status, event_id);
        }

        response
            .json::<Mainshock>()
            .await
            .with_context(|| format!("Failed to parse mainshock {}", event_id))
    }
}
