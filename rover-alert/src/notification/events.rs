//! Notification records.
//!
//! Defines the closed set of notification types, their priority levels, and
//! the [`Notification`] record the dispatcher moves through its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use alert_template::Payload;

use crate::{Error, Result};

/// Opaque notification identifier.
pub type NotificationId = Uuid;

/// Default bound on delivery attempts per notification.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Static metadata about a supported notification type.
#[derive(Debug, Clone, Copy)]
struct NotificationTypeInfo {
    notification_type: NotificationType,
    /// Canonical settings key (snake_case).
    key: &'static str,
    /// Human-friendly label.
    label: &'static str,
    /// Additional accepted spellings.
    aliases: &'static [&'static str],
}

const NOTIFICATION_TYPES: &[NotificationTypeInfo] = &[
    NotificationTypeInfo {
        notification_type: NotificationType::HumanDetection,
        key: "human_detection",
        label: "Human Detection",
        aliases: &["human", "human_detected", "humanDetection"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::AnimalDetection,
        key: "animal_detection",
        label: "Animal Detection",
        aliases: &["animal", "animal_detected", "animalDetection"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::SystemAlert,
        key: "system_alert",
        label: "System Alert",
        aliases: &["system", "systemAlert"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::BatteryLow,
        key: "battery_low",
        label: "Battery Low",
        aliases: &["battery", "low_battery", "batteryLow"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::ConnectionLost,
        key: "connection_lost",
        label: "Connection Lost",
        aliases: &["connection", "disconnected", "connectionLost"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::PatrolStatus,
        key: "patrol_status",
        label: "Patrol Status",
        aliases: &["patrol", "patrolStatus"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::ErrorAlert,
        key: "error_alert",
        label: "Error Alert",
        aliases: &["error", "errorAlert"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::StatusUpdate,
        key: "status_update",
        label: "Status Update",
        aliases: &["status", "statusUpdate"],
    },
];

/// Kinds of notification the dispatcher knows how to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    HumanDetection,
    AnimalDetection,
    SystemAlert,
    BatteryLow,
    ConnectionLost,
    PatrolStatus,
    ErrorAlert,
    StatusUpdate,
}

impl NotificationType {
    /// Every notification type, in declaration order.
    pub const ALL: [NotificationType; 8] = [
        Self::HumanDetection,
        Self::AnimalDetection,
        Self::SystemAlert,
        Self::BatteryLow,
        Self::ConnectionLost,
        Self::PatrolStatus,
        Self::ErrorAlert,
        Self::StatusUpdate,
    ];

    fn info(&self) -> &'static NotificationTypeInfo {
        // The table is declared in the same order as `ALL`.
        &NOTIFICATION_TYPES[*self as usize]
    }

    /// Canonical snake_case key used in settings and logs.
    pub fn key(&self) -> &'static str {
        self.info().key
    }

    /// Human-friendly label.
    pub fn label(&self) -> &'static str {
        self.info().label
    }

    /// Resolve a key, label, or alias to a type.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = normalize_key(input);
        if normalized.is_empty() {
            return None;
        }

        NOTIFICATION_TYPES
            .iter()
            .find(|info| {
                normalize_key(info.key) == normalized
                    || normalize_key(info.label) == normalized
                    || info.aliases.iter().any(|a| normalize_key(a) == normalized)
            })
            .map(|info| info.notification_type)
    }
}

fn normalize_key(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | '.' | ' '))
        .collect()
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for NotificationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::validation(format!("Unknown notification type: {s}")))
    }
}

/// Priority level for notifications.
///
/// Informational only: the queue is FIFO regardless of priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for NotificationPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl NotificationPriority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Delivery status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One alert to be delivered through one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub payload: Payload,
    pub priority: NotificationPriority,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: NotificationStatus,
    /// Error from the most recent failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the next retry is due, while one is scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Create a pending notification with a fresh id.
    pub fn new(
        notification_type: NotificationType,
        payload: Payload,
        priority: NotificationPriority,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_type,
            payload,
            priority,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
            status: NotificationStatus::Pending,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Whether another attempt is allowed after the ones already made.
    pub fn can_retry(&self) -> bool {
        self.status == NotificationStatus::Pending && self.attempts < self.max_attempts
    }

    /// Count one delivery attempt. Never exceeds `max_attempts`.
    pub fn record_attempt(&mut self) -> Result<()> {
        self.ensure_pending(NotificationStatus::Pending)?;
        if self.attempts >= self.max_attempts {
            return Err(Error::validation(format!(
                "Notification {} already used all {} attempts",
                self.id, self.max_attempts
            )));
        }
        self.attempts += 1;
        Ok(())
    }

    /// Transition Pending → Sent.
    pub fn mark_sent(&mut self) -> Result<()> {
        self.ensure_pending(NotificationStatus::Sent)?;
        self.status = NotificationStatus::Sent;
        self.last_error = None;
        self.next_attempt_at = None;
        Ok(())
    }

    /// Transition Pending → Failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_pending(NotificationStatus::Failed)?;
        self.status = NotificationStatus::Failed;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
        Ok(())
    }

    fn ensure_pending(&self, to: NotificationStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }
}
