use thiserror::Error;

/// Failures surfaced by the link to its caller.
///
/// None of these are fatal: every one is mirrored by a status change or a
/// log message on the event channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Adapter missing or permission denied
    #[error("scan failed: {0}")]
    Scan(String),

    /// Link, service or characteristic resolution failed, or the attempt was cancelled
    #[error("connect failed: {reason}")]
    Connect { reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("link lost")]
    LinkLost,

    #[error("write failed: {0}")]
    Write(String),
}

impl LinkError {
    pub fn connect(reason: impl Into<String>) -> Self {
        Self::Connect {
            reason: reason.into(),
        }
    }
}
