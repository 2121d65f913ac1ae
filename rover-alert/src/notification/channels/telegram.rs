//! Telegram Bot API channel.
//!
//! Sends messages via the Telegram Bot API (`POST /bot<token>/sendMessage`).
//! A 429 response is reported as [`ChannelError::RateLimited`] carrying the
//! `parameters.retry_after` hint from the JSON body.

use std::sync::Arc;
use std::time::Duration;

use alert_template::escape_html;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{Ack, ChannelAdapter, ChannelError, ChatMessage, Message, MessageSender, priority_emoji};
use crate::config::{ConfigStore, ConfigStoreExt};
use crate::error::{Error, Result};
use crate::notification::events::Notification;
use crate::notification::templates::TemplateSet;
use crate::utils::http_client;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Subjects are clipped before escaping so the header never eats the body.
const SUBJECT_CHAR_LIMIT: usize = 256;

const TRUNCATION_MARKER: &str = "[truncated]";

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram Bot API token.
    pub bot_token: String,
    /// Target chat ID (user, group, or channel).
    pub chat_id: String,
    /// Parse mode for message formatting (HTML, Markdown, MarkdownV2).
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Explicit proxy URL (`none` disables proxies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

fn default_parse_mode() -> String {
    "HTML".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            parse_mode: default_parse_mode(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
            proxy_url: None,
        }
    }
}

impl TelegramConfig {
    /// Read `telegram.*` settings.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self> {
        let config = Self {
            bot_token: store.get_string("telegram.bot_token").unwrap_or_default(),
            chat_id: store.get_string("telegram.chat_id").unwrap_or_default(),
            parse_mode: store
                .get_string("telegram.parse_mode")
                .unwrap_or_else(default_parse_mode),
            api_base: store
                .get_string("telegram.api_base")
                .unwrap_or_else(default_api_base),
            timeout_secs: store
                .get_u64("telegram.timeout_secs")?
                .unwrap_or_else(default_timeout_secs),
            proxy_url: store.get("telegram.proxy_url"),
        };
        if config.timeout_secs == 0 {
            return Err(Error::config("telegram.timeout_secs must be at least 1"));
        }
        Ok(config)
    }

    pub fn is_complete(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    /// Request timeout, never zero.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        )
    }
}

/// Bot API transport over reqwest.
pub struct TelegramSender {
    client: Client,
    url: String,
    chat_id: String,
}

impl TelegramSender {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            client: http_client::build_client(config.timeout(), config.proxy_url.as_deref()),
            url: config.send_message_url(),
            chat_id: config.chat_id.clone(),
        }
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn deliver(&self, message: &Message) -> std::result::Result<Ack, ChannelError> {
        let Message::Chat(chat) = message else {
            return Err(ChannelError::unknown("Telegram sender only delivers chat messages"));
        };

        let payload = json!({
            "chat_id": self.chat_id,
            "text": chat.text,
            "parse_mode": chat.parse_mode,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::Timeout
                } else {
                    ChannelError::unknown(format!("Telegram request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            let mut ack = Ack::new("telegram");
            if let Some(id) = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.pointer("/result/message_id").cloned())
            {
                ack = ack.with_message_id(id.to_string());
            }
            return Ok(ack);
        }

        warn!("Telegram sendMessage failed: {} - {}", status, body);
        Err(classify_http_status(status.as_u16(), &body))
    }
}

/// Map a non-success Bot API response to a [`ChannelError`].
fn classify_http_status(status: u16, body: &str) -> ChannelError {
    match status {
        429 => {
            let retry_after = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.pointer("/parameters/retry_after").and_then(|r| r.as_u64()))
                .map(Duration::from_secs);
            ChannelError::RateLimited { retry_after }
        }
        401 | 403 => ChannelError::Auth(format!("{} - {}", status, body)),
        _ => ChannelError::unknown(format!("Telegram sendMessage failed: {} - {}", status, body)),
    }
}

/// Telegram channel.
pub struct TelegramChannel {
    config: TelegramConfig,
    sender: Arc<dyn MessageSender>,
}

impl TelegramChannel {
    /// Create a Telegram channel backed by the Bot API.
    pub fn new(config: TelegramConfig) -> Self {
        let sender = Arc::new(TelegramSender::new(&config));
        Self { config, sender }
    }

    /// Create a Telegram channel with a custom transport.
    pub fn with_sender(config: TelegramConfig, sender: Arc<dyn MessageSender>) -> Self {
        Self { config, sender }
    }

    pub fn config(&self) -> &TelegramConfig {
        &self.config
    }

    /// Build the message text for a notification.
    ///
    /// Only the escaped body is shortened, so the bold header and italic
    /// footer always arrive intact.
    fn build_message(&self, notification: &Notification, templates: &TemplateSet) -> String {
        let rendered = templates.render(notification);
        let format = TextFormat::from_parse_mode(&self.config.parse_mode);
        let emoji = priority_emoji(notification.priority);

        let subject: String = rendered.subject.chars().take(SUBJECT_CHAR_LIMIT).collect();
        let header = format!("{emoji} {}", format.bold(&format.escape(&subject)));
        let footer = format.italic(&format.escape(&format!(
            "Priority: {} | Type: {}",
            notification.priority,
            notification.notification_type.label()
        )));

        // Two "\n\n" separators.
        let fixed = header.chars().count() + footer.chars().count() + 4;
        let body = truncate_escaped(
            &format.escape(&rendered.plain_body),
            TELEGRAM_MESSAGE_LIMIT.saturating_sub(fixed),
            format,
        );

        format!("{header}\n\n{body}\n\n{footer}")
    }
}

/// Markup flavour selected by `parse_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextFormat {
    Html,
    Markdown,
    MarkdownV2,
}

impl TextFormat {
    fn from_parse_mode(parse_mode: &str) -> Self {
        if parse_mode.eq_ignore_ascii_case("HTML") {
            Self::Html
        } else if parse_mode.eq_ignore_ascii_case("MarkdownV2") {
            Self::MarkdownV2
        } else {
            Self::Markdown
        }
    }

    fn escape(self, text: &str) -> String {
        match self {
            Self::Html => escape_html(text),
            Self::Markdown => escape_markdown(text, false),
            Self::MarkdownV2 => escape_markdown(text, true),
        }
    }

    fn bold(self, text: &str) -> String {
        match self {
            Self::Html => format!("<b>{text}</b>"),
            Self::Markdown | Self::MarkdownV2 => format!("*{text}*"),
        }
    }

    fn italic(self, text: &str) -> String {
        match self {
            Self::Html => format!("<i>{text}</i>"),
            Self::Markdown | Self::MarkdownV2 => format!("_{text}_"),
        }
    }
}

/// Escape Bot API Markdown. Legacy Markdown reserves fewer characters than V2.
fn escape_markdown(text: &str, v2: bool) -> String {
    let reserved: &[char] = if v2 {
        &[
            '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.',
            '!',
        ]
    } else {
        &['_', '*', '`', '[']
    };

    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if reserved.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl ChannelAdapter for TelegramChannel {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    fn is_configured(&self) -> bool {
        self.config.is_complete()
    }

    fn compose(&self, notification: &Notification, templates: &TemplateSet) -> Message {
        Message::Chat(ChatMessage {
            text: self.build_message(notification, templates),
            parse_mode: self.config.parse_mode.clone(),
        })
    }

    async fn send(&self, message: &Message) -> std::result::Result<Ack, ChannelError> {
        if !self.is_configured() {
            return Err(ChannelError::NotConfigured(
                "telegram requires bot_token and chat_id".to_string(),
            ));
        }

        let ack = self.sender.deliver(message).await?;
        debug!(summary = message.summary(), "Telegram message sent");
        Ok(ack)
    }
}

/// Shorten already-escaped text to `limit` characters, marker included.
///
/// The cut never lands inside an HTML entity or a Markdown escape pair.
fn truncate_escaped(text: &str, limit: usize, format: TextFormat) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let marker = format!("\n\n{}", format.escape(TRUNCATION_MARKER));
    let budget = limit.saturating_sub(marker.chars().count());
    let mut cut: String = text.chars().take(budget).collect();

    match format {
        TextFormat::Html => {
            if let Some(amp) = cut.rfind('&') {
                if !cut[amp..].contains(';') {
                    cut.truncate(amp);
                }
            }
        }
        TextFormat::Markdown | TextFormat::MarkdownV2 => {
            let trailing = cut.chars().rev().take_while(|&c| c == '\\').count();
            if trailing % 2 == 1 {
                cut.pop();
            }
        }
    }

    format!("{cut}{marker}")
}
