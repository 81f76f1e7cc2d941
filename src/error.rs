use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable(s): {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failures raised by the probe runners and transport adapters.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("stream ended before the test deadline")]
    StreamEnded,

    #[error("connection closed by server: {0}")]
    ClosedByServer(String),

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("keepalive ping failed: {0}")]
    KeepaliveFailed(String),

    #[error("failed to decode inbound message: {0}")]
    Decode(String),
}
