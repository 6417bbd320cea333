use notify_core::GatewayError;
use thiserror::Error;

/// Failure writing to or closing one live connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("payload is not valid UTF-8 text")]
    NotText,
    #[error("write failed: {0}")]
    Write(String),
}

/// Why a session could not be started.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("server is shutting down")]
    Cancelled,
    #[error("start consumer: {0}")]
    Consumer(#[source] GatewayError),
}

impl SessionError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Consumer(e) => e.error_kind(),
        }
    }
}
