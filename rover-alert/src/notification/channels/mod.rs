//! Delivery channels.
//!
//! This module provides the channels a dispatcher can deliver through:
//! - Email (SMTP)
//! - Telegram Bot API
//!
//! A [`ChannelAdapter`] owns the channel-specific formatting and knows
//! whether its configuration is complete. The outbound call itself goes
//! through a [`MessageSender`], which tests replace with in-memory fakes.

mod email;
mod telegram;

pub use email::{EmailChannel, EmailConfig, SmtpSender};
pub use telegram::{TelegramChannel, TelegramConfig, TelegramSender};

use std::sync::Arc;
use std::time::Duration;

use alert_template::Payload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::events::{Notification, NotificationPriority, NotificationType};
use super::templates::TemplateSet;
use crate::config::ConfigStore;
use crate::{Error, Result};

/// Email body in both flavours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// A single formatted chat text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    /// Bot API parse mode (`HTML`, `Markdown`, `MarkdownV2`).
    pub parse_mode: String,
}

/// Channel-shaped message produced by [`ChannelAdapter::compose`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Email(EmailMessage),
    Chat(ChatMessage),
}

impl Message {
    /// Short description for logs.
    pub fn summary(&self) -> &str {
        match self {
            Self::Email(m) => &m.subject,
            Self::Chat(m) => m.text.lines().next().unwrap_or_default(),
        }
    }
}

/// Acknowledgement of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub channel: String,
    /// Provider-side identifier or response line, when one is returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

impl Ack {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message_id: None,
            delivered_at: Utc::now(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Failure of an outbound call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Send failed: {0}")]
    Unknown(String),
}

impl ChannelError {
    /// Missing configuration will not fix itself; everything else may.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotConfigured(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "not_configured",
            Self::Timeout => "timeout",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unknown(_) => "unknown",
        }
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }
}

/// Outbound transport for composed messages.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn deliver(&self, message: &Message) -> std::result::Result<Ack, ChannelError>;
}

/// A delivery channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Get the channel type name.
    fn channel_type(&self) -> &'static str;

    /// True only when every required credential is present.
    fn is_configured(&self) -> bool;

    /// Render `notification` into this channel's message shape.
    fn compose(&self, notification: &Notification, templates: &TemplateSet) -> Message;

    /// Perform the outbound call.
    async fn send(&self, message: &Message) -> std::result::Result<Ack, ChannelError>;

    /// Compose and send a test message, bypassing any queue.
    async fn test(&self, templates: &TemplateSet) -> std::result::Result<Ack, ChannelError> {
        if !self.is_configured() {
            return Err(ChannelError::NotConfigured(format!(
                "{} channel is missing required settings",
                self.channel_type()
            )));
        }
        let notification = test_notification(self.channel_type());
        let message = self.compose(&notification, templates);
        self.send(&message).await
    }
}

fn test_notification(channel: &str) -> Notification {
    let mut payload = Payload::new();
    payload.insert(
        "message".to_string(),
        Value::String(format!("Test message from the rover {} channel.", channel)),
    );
    Notification::new(
        NotificationType::StatusUpdate,
        payload,
        NotificationPriority::Low,
        1,
    )
}

/// Emoji marker used by chat-style channels.
pub(crate) fn priority_emoji(priority: NotificationPriority) -> &'static str {
    match priority {
        NotificationPriority::Low => "\u{2139}\u{fe0f}",     // ℹ️
        NotificationPriority::Medium => "\u{1f514}",         // 🔔
        NotificationPriority::High => "\u{26a0}\u{fe0f}",    // ⚠️
        NotificationPriority::Critical => "\u{1f6a8}",       // 🚨
    }
}

/// Supported channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Telegram,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [Self::Email, Self::Telegram];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Telegram => "telegram",
        }
    }

    /// Prefix of this channel's keys in the config store.
    pub fn config_prefix(&self) -> &'static str {
        match self {
            Self::Email => "email.",
            Self::Telegram => "telegram.",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" | "smtp" => Some(Self::Email),
            "telegram" | "chat" | "chatbot" => Some(Self::Telegram),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::validation(format!("Unknown channel kind: {s}")))
    }
}

/// Build a channel of `kind` from its `<kind>.*` settings.
///
/// An incomplete configuration still yields a channel; it reports
/// `is_configured() == false` and fails every send immediately.
pub fn build_channel(kind: ChannelKind, store: &dyn ConfigStore) -> Result<Arc<dyn ChannelAdapter>> {
    let channel: Arc<dyn ChannelAdapter> = match kind {
        ChannelKind::Email => Arc::new(EmailChannel::new(EmailConfig::from_store(store)?)),
        ChannelKind::Telegram => Arc::new(TelegramChannel::new(TelegramConfig::from_store(store)?)),
    };
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;

    #[test]
    fn test_only_missing_config_is_fatal() {
        assert!(!ChannelError::NotConfigured("x".into()).is_retryable());
        assert!(ChannelError::Timeout.is_retryable());
        assert!(ChannelError::Auth("bad".into()).is_retryable());
        assert!(ChannelError::RateLimited { retry_after: None }.is_retryable());
        assert!(ChannelError::unknown("boom").is_retryable());
    }

    #[test]
    fn test_channel_kind_parse() {
        assert_eq!(ChannelKind::parse("SMTP"), Some(ChannelKind::Email));
        assert_eq!(ChannelKind::parse("chatbot"), Some(ChannelKind::Telegram));
        assert!("pager".parse::<ChannelKind>().is_err());
        assert_eq!(ChannelKind::Telegram.to_string(), "telegram");
    }

    #[test]
    fn test_message_summary() {
        let chat = Message::Chat(ChatMessage {
            text: "first\nsecond".to_string(),
            parse_mode: "HTML".to_string(),
        });
        assert_eq!(chat.summary(), "first");
    }

    #[test]
    fn test_build_channel_from_empty_store() {
        let store = MemoryConfigStore::new();
        for kind in ChannelKind::ALL {
            let channel = build_channel(kind, &store).unwrap();
            assert_eq!(channel.channel_type(), kind.as_str());
            assert!(!channel.is_configured());
        }
    }

    #[tokio::test]
    async fn test_unconfigured_channel_test_fails_fast() {
        let store = MemoryConfigStore::new();
        let channel = build_channel(ChannelKind::Telegram, &store).unwrap();
        let err = channel.test(&TemplateSet::default()).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured(_)));
    }
}
