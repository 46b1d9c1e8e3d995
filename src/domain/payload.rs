//! Versioned payload envelope stored in `TaskRecord::details`.
//!
//! Every payload is wrapped as `{"kind": ..., "v": ..., "body": ...}` so a
//! reader can tell which command it holds and which schema revision wrote
//! it. Decode failures are permanent: a payload that does not parse today
//! will not parse on retry either.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A command body that can travel inside a task record
pub trait Payload: Serialize + DeserializeOwned {
    /// Stable tag written to the envelope
    const KIND: &'static str;

    /// Current schema revision
    const VERSION: u32;
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Task has no payload, expected {expected}")]
    Missing { expected: &'static str },

    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Payload kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: &'static str, found: String },

    #[error("Unsupported {kind} payload version {found} (newest known: {supported})")]
    UnsupportedVersion {
        kind: &'static str,
        found: u32,
        supported: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    v: u32,
    body: Value,
}

/// Wrap a payload in its envelope
pub fn encode<P: Payload>(payload: &P) -> Result<String, PayloadError> {
    let envelope = Envelope {
        kind: P::KIND.to_string(),
        v: P::VERSION,
        body: serde_json::to_value(payload)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Unwrap and parse a payload; a missing payload is an error
pub fn decode<P: Payload>(details: Option<&str>) -> Result<P, PayloadError> {
    let raw = details.ok_or(PayloadError::Missing { expected: P::KIND })?;
    decode_str(raw)
}

/// Like `decode`, but a missing payload yields `P::default()`
pub fn decode_or_default<P: Payload + Default>(details: Option<&str>) -> Result<P, PayloadError> {
    match details {
        Some(raw) => decode_str(raw),
        None => Ok(P::default()),
    }
}

fn decode_str<P: Payload>(raw: &str) -> Result<P, PayloadError> {
    let envelope: Envelope = serde_json::from_str(raw)?;

    if envelope.kind != P::KIND {
        return Err(PayloadError::KindMismatch {
            expected: P::KIND,
            found: envelope.kind,
        });
    }

    // Older revisions must stay readable; newer ones are rejected.
    if envelope.v == 0 || envelope.v > P::VERSION {
        return Err(PayloadError::UnsupportedVersion {
            kind: P::KIND,
            found: envelope.v,
            supported: P::VERSION,
        });
    }

    Ok(serde_json::from_value(envelope.body)?)
}
