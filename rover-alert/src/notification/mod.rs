//! Notification system module.
//!
//! Delivers rover events to operators over email and a Telegram bot.
//!
//! # Features
//!
//! - Per-type enable switches checked before anything is queued
//! - Editable subject/body templates with `{{placeholder}}` substitution
//! - FIFO queue drained by a single-flight dispatcher per channel
//! - Bounded retries with a growing delay
//! - Event adapter mapping detection and health events to notifications
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rover_alert::notification::{
//!     EventAdapter, NotificationDispatcher, NotificationGate, NotificationSettings,
//! };
//! use rover_alert::notification::channels::{TelegramChannel, TelegramConfig};
//!
//! let gate = Arc::new(NotificationGate::new(NotificationSettings::all_enabled()));
//! let channel = Arc::new(TelegramChannel::new(TelegramConfig::default()));
//! let dispatcher = Arc::new(NotificationDispatcher::new(channel, gate));
//! dispatcher.start()?;
//!
//! let adapter = EventAdapter::new(dispatcher);
//! adapter.battery_low(15.0, 11.2);
//! ```

pub mod adapter;
pub mod channels;
pub mod diagnostics;
pub mod events;
pub mod gate;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod templates;

pub use adapter::{DomainEvent, EventAdapter};
pub use channels::{ChannelAdapter, ChannelError, ChannelKind, Message, MessageSender};
pub use diagnostics::{DiagnosticLevel, DiagnosticRecord, DiagnosticsSink, MemorySink, TracingSink};
pub use events::{
    Notification, NotificationId, NotificationPriority, NotificationStatus, NotificationType,
};
pub use gate::{NotificationGate, NotificationSettings};
pub use retry::RetryPolicy;
pub use scheduler::{DeliveryFailure, DispatcherConfig, DispatcherStats, NotificationDispatcher, PassSummary};
pub use templates::TemplateSet;
