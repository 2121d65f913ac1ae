//! Email channel using SMTP.

use std::sync::Arc;
use std::time::Duration;

use alert_template::escape_html;
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Ack, ChannelAdapter, ChannelError, EmailMessage, Message, MessageSender};
use crate::config::{ConfigStore, ConfigStoreExt};
use crate::error::{Error, Result};
use crate::notification::events::{Notification, NotificationPriority};
use crate::notification::templates::TemplateSet;

/// Email channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfig {
    /// SMTP server host.
    pub smtp_host: String,
    /// SMTP server port.
    pub smtp_port: u16,
    /// SMTP username.
    pub smtp_username: Option<String>,
    /// SMTP password.
    pub smtp_password: Option<String>,
    /// Use TLS (implicit on port 465, STARTTLS otherwise).
    pub use_tls: bool,
    /// Sender email address.
    pub from_address: String,
    /// Recipient email addresses.
    pub to_addresses: Vec<String>,
    /// Prefix put in front of every subject.
    pub subject_prefix: String,
    /// Per-send timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            use_tls: true,
            from_address: String::new(),
            to_addresses: Vec::new(),
            subject_prefix: "[rover]".to_string(),
            timeout_secs: 30,
        }
    }
}

impl EmailConfig {
    /// Read `email.*` settings.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            smtp_host: store.get_string("email.smtp_host").unwrap_or_default(),
            smtp_port: store.get_u16("email.smtp_port")?.unwrap_or(defaults.smtp_port),
            smtp_username: store.get_string("email.smtp_username"),
            smtp_password: store.get_string("email.smtp_password"),
            use_tls: store.get_bool("email.use_tls")?.unwrap_or(defaults.use_tls),
            from_address: store.get_string("email.from_address").unwrap_or_default(),
            to_addresses: store.get_list("email.to_addresses"),
            subject_prefix: store
                .get_string("email.subject_prefix")
                .unwrap_or(defaults.subject_prefix),
            timeout_secs: store
                .get_u64("email.timeout_secs")?
                .unwrap_or(defaults.timeout_secs),
        };
        if config.timeout_secs == 0 {
            return Err(Error::config("email.timeout_secs must be at least 1"));
        }
        Ok(config)
    }

    /// Every required field is present. A username needs a password.
    pub fn is_complete(&self) -> bool {
        !self.smtp_host.is_empty()
            && !self.from_address.is_empty()
            && !self.to_addresses.is_empty()
            && (self.smtp_username.is_none() || self.smtp_password.is_some())
    }

    /// Send timeout, never zero.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// SMTP transport over tokio + rustls.
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpSender {
    pub fn new(config: &EmailConfig) -> std::result::Result<Self, ChannelError> {
        let host = config.smtp_host.as_str();
        let builder = if config.use_tls && config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        } else {
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
        }
        .map_err(|e| ChannelError::NotConfigured(format!("Invalid SMTP host {}: {}", host, e)))?;

        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(config.timeout()));
        if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = parse_mailbox(&config.from_address)?;
        let to = config
            .to_addresses
            .iter()
            .map(|a| parse_mailbox(a))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }
}

fn parse_mailbox(address: &str) -> std::result::Result<Mailbox, ChannelError> {
    address
        .parse()
        .map_err(|e| ChannelError::NotConfigured(format!("Invalid email address {}: {}", address, e)))
}

#[async_trait]
impl MessageSender for SmtpSender {
    async fn deliver(&self, message: &Message) -> std::result::Result<Ack, ChannelError> {
        let Message::Email(email) = message else {
            return Err(ChannelError::unknown("SMTP sender only delivers email messages"));
        };

        let mut builder = lettre::Message::builder()
            .from(self.from.clone())
            .subject(email.subject.as_str());
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        let mail = builder
            .multipart(MultiPart::alternative_plain_html(
                email.text_body.clone(),
                email.html_body.clone(),
            ))
            .map_err(|e| ChannelError::unknown(format!("Failed to build email: {}", e)))?;

        match self.transport.send(mail).await {
            Ok(response) => {
                let mut ack = Ack::new("email");
                if let Some(line) = response.message().next() {
                    ack = ack.with_message_id(line.to_string());
                }
                Ok(ack)
            }
            Err(e) => {
                let code = e.status().and_then(|c| c.to_string().parse::<u16>().ok());
                Err(classify_smtp_error(code, e.is_timeout(), &e.to_string()))
            }
        }
    }
}

/// Map an SMTP failure to a [`ChannelError`].
fn classify_smtp_error(code: Option<u16>, timed_out: bool, detail: &str) -> ChannelError {
    if timed_out {
        return ChannelError::Timeout;
    }
    match code {
        Some(530 | 534 | 535) => ChannelError::Auth(detail.to_string()),
        Some(421 | 450 | 451 | 452) => ChannelError::RateLimited { retry_after: None },
        _ => ChannelError::unknown(detail),
    }
}

/// Email channel.
pub struct EmailChannel {
    config: EmailConfig,
    sender: Option<Arc<dyn MessageSender>>,
}

impl EmailChannel {
    /// Create an email channel backed by SMTP.
    pub fn new(config: EmailConfig) -> Self {
        let sender = if config.is_complete() {
            match SmtpSender::new(&config) {
                Ok(sender) => Some(Arc::new(sender) as Arc<dyn MessageSender>),
                Err(e) => {
                    warn!(error = %e, "Email channel disabled");
                    None
                }
            }
        } else {
            None
        };
        Self { config, sender }
    }

    /// Create an email channel with a custom transport.
    pub fn with_sender(config: EmailConfig, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            config,
            sender: Some(sender),
        }
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    fn build_subject(&self, subject: &str) -> String {
        if self.config.subject_prefix.is_empty() {
            subject.to_string()
        } else {
            format!("{} {}", self.config.subject_prefix, subject)
        }
    }

    fn build_body_text(&self, subject: &str, plain_body: &str, notification: &Notification) -> String {
        format!(
            "{}\n\n{}\n\nPriority: {}\nType: {}\nTime: {}",
            subject,
            plain_body,
            notification.priority,
            notification.notification_type.label(),
            notification.created_at.to_rfc3339()
        )
    }

    /// `body` is trusted HTML: template markup with escaped values.
    fn build_body_html(&self, subject: &str, body: &str, notification: &Notification) -> String {
        let priority_color = match notification.priority {
            NotificationPriority::Low => "#808080",
            NotificationPriority::Medium => "#3498db",
            NotificationPriority::High => "#f39c12",
            NotificationPriority::Critical => "#e74c3c",
        };

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 20px; }}
        .header {{ background-color: {}; color: white; padding: 15px; border-radius: 5px; }}
        .content {{ padding: 20px; background-color: #f9f9f9; border-radius: 5px; margin-top: 10px; }}
        .footer {{ color: #666; font-size: 12px; margin-top: 20px; }}
    </style>
</head>
<body>
    <div class="header">
        <h2>{}</h2>
    </div>
    <div class="content">
        <p>{}</p>
    </div>
    <div class="footer">
        <p>Priority: {} | Type: {} | Time: {}</p>
    </div>
</body>
</html>"#,
            priority_color,
            escape_html(subject),
            body,
            notification.priority,
            notification.notification_type.label(),
            notification.created_at.to_rfc3339()
        )
    }
}

#[async_trait]
impl ChannelAdapter for EmailChannel {
    fn channel_type(&self) -> &'static str {
        "email"
    }

    fn is_configured(&self) -> bool {
        self.config.is_complete() && self.sender.is_some()
    }

    fn compose(&self, notification: &Notification, templates: &TemplateSet) -> Message {
        let rendered = templates.render(notification);
        Message::Email(EmailMessage {
            subject: self.build_subject(&rendered.subject),
            html_body: self.build_body_html(&rendered.subject, &rendered.body, notification),
            text_body: self.build_body_text(&rendered.subject, &rendered.plain_body, notification),
        })
    }

    async fn send(&self, message: &Message) -> std::result::Result<Ack, ChannelError> {
        let Some(sender) = self.sender.as_ref().filter(|_| self.config.is_complete()) else {
            return Err(ChannelError::NotConfigured(
                "email requires smtp_host, from_address and to_addresses".to_string(),
            ));
        };

        let ack = sender.deliver(message).await?;
        debug!(subject = message.summary(), "Email sent");
        Ok(ack)
    }
}
