//! Library error types.
//!
//! Channel call failures have their own [`ChannelError`] and never surface
//! here; the dispatcher turns them into retries or a `Failed` status.
//!
//! [`ChannelError`]: crate::notification::channels::ChannelError

use thiserror::Error;

use crate::notification::NotificationType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The type is switched off; nothing was queued.
    #[error("Notifications of type {0} are disabled")]
    GateClosed(NotificationType),

    #[error("Invalid state transition: cannot move from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn logging(msg: impl Into<String>) -> Self {
        Self::Logging(msg.into())
    }
}
