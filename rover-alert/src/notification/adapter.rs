//! Domain events to notifications.
//!
//! Detection, health and patrol events from the rest of the system are
//! mapped to a notification type, a flat payload and a priority, then handed
//! to a dispatcher. The dispatcher's gate decides whether anything is queued.

use std::sync::Arc;

use alert_template::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{NotificationId, NotificationPriority, NotificationType};
use super::scheduler::NotificationDispatcher;

/// Battery percentage below which the battery is reported low.
pub const BATTERY_LOW_PERCENT: f64 = 20.0;

/// Battery percentage below which a low-battery alert is critical.
pub const BATTERY_CRITICAL_PERCENT: f64 = 10.0;

/// Detection confidence at which a human sighting becomes critical.
pub const HUMAN_CRITICAL_CONFIDENCE: f64 = 0.9;

/// Events produced by the detection pipeline and the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    HumanDetected {
        confidence: f64,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        camera: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    AnimalDetected {
        species: String,
        confidence: f64,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    VehicleDetected {
        confidence: f64,
        #[serde(default)]
        vehicle_type: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    SystemAlert {
        title: String,
        message: String,
        #[serde(default)]
        severity: NotificationPriority,
    },
    BatteryLow {
        /// Charge in percent.
        battery: f64,
        voltage: f64,
    },
    ConnectionLost {
        #[serde(default)]
        last_seen: Option<DateTime<Utc>>,
        #[serde(default)]
        duration_secs: Option<u64>,
        #[serde(default)]
        reason: Option<String>,
    },
    PatrolStatus {
        status: String,
        #[serde(default)]
        waypoint: Option<String>,
        #[serde(default)]
        progress: Option<f64>,
    },
    Error {
        component: String,
        error: String,
    },
    StatusUpdate {
        message: String,
    },
}

impl DomainEvent {
    /// Get the event kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HumanDetected { .. } => "human_detected",
            Self::AnimalDetected { .. } => "animal_detected",
            Self::VehicleDetected { .. } => "vehicle_detected",
            Self::SystemAlert { .. } => "system_alert",
            Self::BatteryLow { .. } => "battery_low",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::PatrolStatus { .. } => "patrol_status",
            Self::Error { .. } => "error",
            Self::StatusUpdate { .. } => "status_update",
        }
    }

    /// Notification type this event is delivered as.
    pub fn notification_type(&self) -> NotificationType {
        match self {
            Self::HumanDetected { .. } => NotificationType::HumanDetection,
            Self::AnimalDetected { .. } => NotificationType::AnimalDetection,
            Self::VehicleDetected { .. } | Self::SystemAlert { .. } => NotificationType::SystemAlert,
            Self::BatteryLow { .. } => NotificationType::BatteryLow,
            Self::ConnectionLost { .. } => NotificationType::ConnectionLost,
            Self::PatrolStatus { .. } => NotificationType::PatrolStatus,
            Self::Error { .. } => NotificationType::ErrorAlert,
            Self::StatusUpdate { .. } => NotificationType::StatusUpdate,
        }
    }

    pub fn priority(&self) -> NotificationPriority {
        match self {
            Self::HumanDetected { confidence, .. } if *confidence >= HUMAN_CRITICAL_CONFIDENCE => {
                NotificationPriority::Critical
            }
            Self::HumanDetected { .. } => NotificationPriority::High,
            Self::AnimalDetected { .. } => NotificationPriority::Medium,
            Self::VehicleDetected { .. } => NotificationPriority::High,
            Self::SystemAlert { severity, .. } => *severity,
            Self::BatteryLow { battery, .. } if *battery < BATTERY_CRITICAL_PERCENT => {
                NotificationPriority::Critical
            }
            Self::BatteryLow { .. } => NotificationPriority::High,
            Self::ConnectionLost { .. } => NotificationPriority::Critical,
            Self::PatrolStatus { .. } => NotificationPriority::Low,
            Self::Error { .. } => NotificationPriority::High,
            Self::StatusUpdate { .. } => NotificationPriority::Low,
        }
    }

    /// Flat payload for the type's template.
    pub fn payload(&self) -> Payload {
        let mut payload = Payload::new();
        let mut put = |key: &str, value: Value| {
            payload.insert(key.to_string(), value);
        };

        match self {
            Self::HumanDetected {
                confidence,
                location,
                camera,
                timestamp,
            } => {
                put("confidence", number(*confidence));
                put("location", text_or(location, "unknown"));
                put("camera", text_or(camera, "main"));
                if let Some(ts) = timestamp {
                    put("timestamp", Value::String(ts.to_rfc3339()));
                }
            }
            Self::AnimalDetected {
                species,
                confidence,
                location,
                timestamp,
            } => {
                put("species", Value::String(species.clone()));
                put("confidence", number(*confidence));
                put("location", text_or(location, "unknown"));
                if let Some(ts) = timestamp {
                    put("timestamp", Value::String(ts.to_rfc3339()));
                }
            }
            Self::VehicleDetected {
                confidence,
                vehicle_type,
                location,
                timestamp,
            } => {
                let vehicle = vehicle_type.as_deref().unwrap_or("vehicle");
                let location = location.as_deref().unwrap_or("unknown");
                put("detection", Value::String("vehicle".to_string()));
                put("title", Value::String("Vehicle Detected".to_string()));
                put(
                    "message",
                    Value::String(format!(
                        "A {} was detected at {} (confidence {}).",
                        vehicle,
                        location,
                        alert_template::stringify(&number(*confidence))
                    )),
                );
                put("severity", Value::String(self.priority().to_string()));
                put("confidence", number(*confidence));
                put("location", Value::String(location.to_string()));
                if let Some(ts) = timestamp {
                    put("timestamp", Value::String(ts.to_rfc3339()));
                }
            }
            Self::SystemAlert {
                title,
                message,
                severity,
            } => {
                put("title", Value::String(title.clone()));
                put("message", Value::String(message.clone()));
                put("severity", Value::String(severity.to_string()));
            }
            Self::BatteryLow { battery, voltage } => {
                put("battery", number(*battery));
                put("voltage", number(*voltage));
                put("critical", Value::Bool(*battery < BATTERY_CRITICAL_PERCENT));
            }
            Self::ConnectionLost {
                last_seen,
                duration_secs,
                reason,
            } => {
                put(
                    "last_seen",
                    last_seen
                        .map(|t| Value::String(t.to_rfc3339()))
                        .unwrap_or_else(|| Value::String("unknown".to_string())),
                );
                if let Some(secs) = duration_secs {
                    put("duration", json!(secs));
                }
                put("reason", text_or(reason, "no heartbeat"));
            }
            Self::PatrolStatus {
                status,
                waypoint,
                progress,
            } => {
                put("status", Value::String(status.clone()));
                put("waypoint", text_or(waypoint, "-"));
                if let Some(progress) = progress {
                    put("progress", number(*progress));
                }
            }
            Self::Error { component, error } => {
                put("component", Value::String(component.clone()));
                put("error", Value::String(error.clone()));
                put("message", Value::String(format!("{}: {}", component, error)));
            }
            Self::StatusUpdate { message } => {
                put("message", Value::String(message.clone()));
            }
        }
        payload
    }
}

/// Whole numbers render without a trailing `.0`.
fn number(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn text_or(value: &Option<String>, default: &str) -> Value {
    Value::String(
        value
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(default)
            .to_string(),
    )
}

/// Feeds domain events into one dispatcher.
pub struct EventAdapter {
    dispatcher: Arc<NotificationDispatcher>,
}

impl EventAdapter {
    pub fn new(dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Map and submit one event. Returns `None` when the type is disabled.
    pub fn handle(&self, event: &DomainEvent) -> Option<NotificationId> {
        let notification_type = event.notification_type();
        let id = self
            .dispatcher
            .notify(notification_type, event.payload(), Some(event.priority()));

        match id {
            Some(id) => debug!(
                notification_id = %id,
                event = event.kind(),
                channel = self.dispatcher.channel().channel_type(),
                "Event queued for delivery"
            ),
            None => debug!(
                event = event.kind(),
                notification_type = %notification_type,
                "Event not delivered, notification type disabled"
            ),
        }
        id
    }

    pub fn human_detected(&self, confidence: f64, location: Option<String>) -> Option<NotificationId> {
        self.handle(&DomainEvent::HumanDetected {
            confidence,
            location,
            camera: None,
            timestamp: Some(Utc::now()),
        })
    }

    pub fn animal_detected(
        &self,
        species: impl Into<String>,
        confidence: f64,
        location: Option<String>,
    ) -> Option<NotificationId> {
        self.handle(&DomainEvent::AnimalDetected {
            species: species.into(),
            confidence,
            location,
            timestamp: Some(Utc::now()),
        })
    }

    pub fn system_alert(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        severity: NotificationPriority,
    ) -> Option<NotificationId> {
        self.handle(&DomainEvent::SystemAlert {
            title: title.into(),
            message: message.into(),
            severity,
        })
    }

    pub fn battery_low(&self, battery: f64, voltage: f64) -> Option<NotificationId> {
        self.handle(&DomainEvent::BatteryLow { battery, voltage })
    }

    pub fn connection_lost(
        &self,
        last_seen: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Option<NotificationId> {
        let duration_secs = last_seen.map(|t| (Utc::now() - t).num_seconds().max(0) as u64);
        self.handle(&DomainEvent::ConnectionLost {
            last_seen,
            duration_secs,
            reason,
        })
    }

    pub fn patrol_status(
        &self,
        status: impl Into<String>,
        waypoint: Option<String>,
        progress: Option<f64>,
    ) -> Option<NotificationId> {
        self.handle(&DomainEvent::PatrolStatus {
            status: status.into(),
            waypoint,
            progress,
        })
    }

    /// Consume events from a broadcast channel until it closes or the token
    /// is cancelled.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<DomainEvent>,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let adapter = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Domain event listener shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(event) => {
                                adapter.handle(&event);
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Domain event listener lagged by {} events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Domain event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}
