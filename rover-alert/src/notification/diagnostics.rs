//! Diagnostics sink for delivery outcomes.
//!
//! Every terminal outcome (sent / failed) and every gate rejection is
//! reported here with the notification id attached. The dispatcher never
//! returns delivery errors to its caller, so this is the only place they
//! can be observed.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::events::{NotificationId, NotificationType};

/// Broadcast channel capacity for diagnostic records.
const DIAGNOSTICS_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One diagnostic entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub timestamp: DateTime<Utc>,
    pub level: DiagnosticLevel,
    pub message: String,
    pub notification_id: Option<NotificationId>,
    pub notification_type: Option<NotificationType>,
    pub channel: Option<String>,
}

impl DiagnosticRecord {
    pub fn new(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            notification_id: None,
            notification_type: None,
            channel: None,
        }
    }

    pub fn with_notification(mut self, id: NotificationId, notification_type: NotificationType) -> Self {
        self.notification_id = Some(id);
        self.notification_type = Some(notification_type);
        self
    }

    pub fn with_type(mut self, notification_type: NotificationType) -> Self {
        self.notification_type = Some(notification_type);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// Receiver of delivery diagnostics.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, record: DiagnosticRecord);
}

/// Forwards records to `tracing` and re-broadcasts them to subscribers.
pub struct TracingSink {
    tx: broadcast::Sender<DiagnosticRecord>,
}

impl TracingSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DIAGNOSTICS_BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to records as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticRecord> {
        self.tx.subscribe()
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsSink for TracingSink {
    fn record(&self, record: DiagnosticRecord) {
        let id = record
            .notification_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        let notification_type = record
            .notification_type
            .map(|t| t.key())
            .unwrap_or_default();
        let channel = record.channel.as_deref().unwrap_or_default();

        match record.level {
            DiagnosticLevel::Debug => debug!(
                notification_id = %id,
                notification_type,
                channel,
                "{}",
                record.message
            ),
            DiagnosticLevel::Info => info!(
                notification_id = %id,
                notification_type,
                channel,
                "{}",
                record.message
            ),
            DiagnosticLevel::Warn => warn!(
                notification_id = %id,
                notification_type,
                channel,
                "{}",
                record.message
            ),
            DiagnosticLevel::Error => error!(
                notification_id = %id,
                notification_type,
                channel,
                "{}",
                record.message
            ),
        }

        // Ignore errors - just means no subscribers currently
        let _ = self.tx.send(record);
    }
}

/// Keeps the most recent records in memory.
pub struct MemorySink {
    capacity: usize,
    records: Mutex<VecDeque<DiagnosticRecord>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Records about one notification, oldest first.
    pub fn for_notification(&self, id: NotificationId) -> Vec<DiagnosticRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.notification_id == Some(id))
            .cloned()
            .collect()
    }

    pub fn count_level(&self, level: DiagnosticLevel) -> usize {
        self.records.lock().iter().filter(|r| r.level == level).count()
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, record: DiagnosticRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }
}
