//! Continuation tokens as produced by the monitored data source.
//!
//! The processor treats a lease's continuation as opaque when reading and
//! checkpointing. Only the remaining-work estimator needs to look inside one,
//! to learn the log position it points at. Tokens come in three shapes:
//!
//! ```text
//! 42                                         legacy, bare position
//! "42"                                       legacy, quoted position (etag style)
//! {"v":1,"position":42}                      version 1
//! {"v":2,"position":42,"min":"","max":"FF"}  version 2, carries the key range
//! ```
//!
//! A version newer than [`CURRENT_VERSION`] is rejected instead of being
//! half-understood.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub const CURRENT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedContinuation {
    Legacy {
        position: i64,
    },
    V1 {
        position: i64,
    },
    V2 {
        position: i64,
        min_key: String,
        max_key: String,
    },
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    #[serde(flatten)]
    payload: Value,
}

#[derive(Serialize, Deserialize)]
struct V1Payload {
    position: i64,
}

#[derive(Serialize, Deserialize)]
struct V2Payload {
    position: i64,
    min: String,
    max: String,
}

impl FeedContinuation {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if let Ok(position) = trimmed.trim_matches('"').parse::<i64>() {
            return Ok(Self::Legacy { position });
        }

        let envelope: Envelope = serde_json::from_str(trimmed)
            .map_err(|e| Error::MalformedContinuation(format!("{trimmed}: {e}")))?;

        match envelope.v {
            0 => Err(Error::MalformedContinuation(format!(
                "{trimmed}: version 0 is not valid"
            ))),
            1 => {
                let p: V1Payload = serde_json::from_value(envelope.payload)
                    .map_err(|e| Error::MalformedContinuation(format!("{trimmed}: {e}")))?;
                Ok(Self::V1 {
                    position: p.position,
                })
            }
            2 => {
                let p: V2Payload = serde_json::from_value(envelope.payload)
                    .map_err(|e| Error::MalformedContinuation(format!("{trimmed}: {e}")))?;
                Ok(Self::V2 {
                    position: p.position,
                    min_key: p.min,
                    max_key: p.max,
                })
            }
            v => Err(Error::TokenFromTheFuture(v)),
        }
    }

    /// Log position of the last change the token covers.
    pub fn position(&self) -> i64 {
        match self {
            Self::Legacy { position } | Self::V1 { position } | Self::V2 { position, .. } => {
                *position
            }
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            Self::Legacy { .. } => 0,
            Self::V1 { .. } => 1,
            Self::V2 { .. } => 2,
        }
    }
}

impl fmt::Display for FeedContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match self {
            Self::Legacy { position } => return write!(f, "{position}"),
            Self::V1 { position } => serde_json::json!({ "v": 1, "position": position }),
            Self::V2 {
                position,
                min_key,
                max_key,
            } => serde_json::json!({ "v": 2, "position": position, "min": min_key, "max": max_key }),
        };
        write!(f, "{body}")
    }
}
