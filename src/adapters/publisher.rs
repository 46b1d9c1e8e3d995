//! HTTP publisher for the product distribution service.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Product, ProductRequest, Publisher};

/// Publisher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSettings {
    /// Distribution service endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Network code written on products
    #[serde(default = "default_network")]
    pub network: String,

    /// Prefix prepended to the event id to form the product code
    #[serde(default)]
    pub code_prefix: String,

    #[serde(default = "default_reviewed")]
    pub reviewed: bool,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Signing key; normally supplied via AFTERSHOCK_PUBLISH_KEY
    #[serde(default, skip_serializing)]
    pub signing_key: Option<String>,
}

fn default_network() -> String {
    "us".to_string()
}
fn default_reviewed() -> bool {
    true
}
fn default_timeout() -> u64 {
    30
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            network: default_network(),
            code_prefix: String::new(),
            reviewed: default_reviewed(),
            timeout_secs: default_timeout(),
            signing_key: None,
        }
    }
}

/// Sends signed JSON products over HTTP
pub struct HttpPublisher {
    endpoint: String,
    signing_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(endpoint: impl Into<String>, signing_key: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            signing_key,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    /// Build from settings; fails if no endpoint is configured
    pub fn from_settings(settings: &PublishSettings) -> Result<Self> {
        let endpoint = settings
            .endpoint
            .clone()
            .context("publish.endpoint is not configured")?;
        Ok(Self::new(
            endpoint,
            settings.signing_key.clone(),
            Duration::from_secs(settings.timeout_secs),
        ))
    }
}

/// Hex SHA-256 over key followed by the unsigned product body
pub fn signature(key: &str, product: &Product) -> Result<String> {
    let body = serde_json::to_vec(&product.request).context("Failed to serialize product")?;

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl Publisher for HttpPublisher {
    fn build(&self, request: ProductRequest) -> Result<Product> {
        if request.event_id.is_empty() || request.network.is_empty() || request.code.is_empty() {
            bail!(
                "Product needs an event id, network and code (got {:?}/{:?}/{:?})",
                request.event_id,
                request.network,
                request.code
            );
        }

        Ok(Product {
            request,
            signature: None,
        })
    }

    fn sign(&self, product: &mut Product) -> Result<()> {
        let key = self
            .signing_key
            .as_deref()
            .context("No publish signing key configured")?;
        product.signature = Some(signature(key, product)?);
        Ok(())
    }

    async fn send(&self, product: &Product, is_text: bool) -> Result<()> {
        let url = format!("{}/products", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "product": product,
                "is_text": is_text,
            }))
            .send()
            .await
            .with_context(|| format!("Failed to send product {}", product.request.code))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Distribution service returned {}: {}", status, body.trim());
        }

        debug!(code = %product.request.code, "Product accepted");
        Ok(())
    }
}
