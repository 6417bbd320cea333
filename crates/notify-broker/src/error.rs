use thiserror::Error;

/// Failures talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connect to broker: {0}")]
    Connect(String),
    #[error("broker channel: {0}")]
    Channel(String),
    #[error("declare {what}: {reason}")]
    Declare { what: String, reason: String },
    #[error("consume: {0}")]
    Consume(String),
    #[error("settle delivery {tag}: {reason}")]
    Settle { tag: u64, reason: String },
    #[error("publish: {0}")]
    Publish(String),
    #[error("subscription is already running")]
    AlreadyRunning,
}

impl BrokerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Channel(_) => "channel",
            Self::Declare { .. } => "declare",
            Self::Consume(_) => "consume",
            Self::Settle { .. } => "settle",
            Self::Publish(_) => "publish",
            Self::AlreadyRunning => "already_running",
        }
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        Self::Channel(e.to_string())
    }
}
