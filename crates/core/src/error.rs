use crate::ChannelId;

/// Result alias that carries the custom [`EngineError`] type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Channel or engine parameters were rejected while applying
    /// configuration. Never produced once the scheduler is running.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A sample pull failed or timed out. Scoped to one channel and one tick.
    #[error("source for channel {channel} unavailable: {reason}")]
    SourceUnavailable { channel: ChannelId, reason: String },
    /// No tick has completed yet, so there is nothing to read.
    #[error("no snapshot has been published yet")]
    SnapshotUnavailable,
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn invalid<T: Into<String>>(reason: T) -> Self {
        Self::InvalidConfiguration(reason.into())
    }

    pub fn source_unavailable<T: Into<String>>(channel: ChannelId, reason: T) -> Self {
        Self::SourceUnavailable {
            channel,
            reason: reason.into(),
        }
    }
}
