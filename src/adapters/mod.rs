//! Adapter interfaces for external systems.
//!
//! The engine talks to three collaborators: the distribution service
//! that receives published products, the event service that resolves
//! mainshocks, and the forecast model. Failures surface only as errors;
//! executors decide whether and when to retry.

pub mod model;
pub mod publisher;
pub mod source;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Mainshock;

pub use model::CommandForecastModel;
pub use publisher::HttpPublisher;
pub use source::HttpMainshockSource;

/// File attached to a published product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub content: String,
}

/// Everything needed to build a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRequest {
    pub event_id: String,
    pub network: String,
    pub code: String,
    pub reviewed: bool,

    /// Product body, already serialized
    pub payload: String,

    /// Product modification time (epoch ms)
    pub modified_time: i64,

    pub attachments: Vec<Attachment>,
}

/// Built product, ready to sign and send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(flatten)]
    pub request: ProductRequest,

    /// Hex signature, set by `Publisher::sign`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Distribution service client
#[async_trait]
pub trait Publisher: Send + Sync {
    fn build(&self, request: ProductRequest) -> Result<Product>;
    fn sign(&self, product: &mut Product) -> Result<()>;
    async fn send(&self, product: &Product, is_text: bool) -> Result<()>;
}

/// Resolves an event id to its mainshock parameters
#[async_trait]
pub trait MainshockSource: Send + Sync {
    async fn fetch(&self, event_id: &str) -> Result<Mainshock>;
}

/// Input to one forecast computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub event_id: String,
    pub mainshock: Mainshock,

    /// Lag after origin (ms)
    pub lag: i64,

    pub analyst_params: Option<Value>,
}

/// Statistical forecast model, treated as opaque
#[async_trait]
pub trait ForecastModel: Send + Sync {
    async fn compute(&self, request: &ForecastRequest) -> Result<Value>;
}
