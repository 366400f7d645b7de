//! Diagnostics raised inside the fetch chain
//!
//! None of these reach callers of the service; they are logged and the
//! chain moves on to the next source.

#[derive(Debug, thiserror::Error)]
pub enum EpgError {
    #[error("malformed schedule document: {0}")]
    Parse(String),
    #[error("channel '{channel}' not found in document")]
    NotFoundInDocument { channel: String },
    #[error("request to {url} timed out")]
    NetworkTimeout { url: String },
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },
}

impl EpgError {
    pub(crate) fn network(url: &str, reason: impl std::fmt::Display) -> Self {
        EpgError::Network {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
