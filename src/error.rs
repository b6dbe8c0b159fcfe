//! Failure kinds for a single emission attempt
//!
//! None of these ever reach the caller of [`crate::Emitter::emit`]; they are
//! turned into log lines (and observer outcomes) at the emitter boundary.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitError {
    /// Input or output could not be encoded as JSON; no record was built
    #[error("failed to serialize {field}: {source}")]
    Serialization {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The sidecar could not be reached or the exchange failed mid-flight
    #[error("failed to send to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: ureq::Error,
    },

    /// The background send outlived the advisory deadline
    #[error("send still running after {deadline:?}")]
    TimeoutObserved { deadline: Duration },

    /// Anything else during build or dispatch
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl EmitError {
    /// Stable short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            EmitError::Serialization { .. } => "serialization",
            EmitError::Connection { .. } => "connection",
            EmitError::TimeoutObserved { .. } => "timeout",
            EmitError::Unexpected(_) => "unexpected",
        }
    }
}
