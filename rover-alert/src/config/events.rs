//! Configuration update events.
//!
//! Writes to the configuration store are broadcast so that long-lived
//! components (the notification gate, channel adapters) can pick up
//! settings changes without a restart.

use tokio::sync::broadcast;

/// Events broadcast when configuration changes occur.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfigUpdateEvent {
    /// A key was created or overwritten.
    KeyChanged { key: String },
    /// A key was removed.
    KeyRemoved { key: String },
    /// The whole store was reloaded from its source.
    Reloaded,
}

impl ConfigUpdateEvent {
    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::KeyChanged { key } => format!("Config key changed: {}", key),
            Self::KeyRemoved { key } => format!("Config key removed: {}", key),
            Self::Reloaded => "Config reloaded".to_string(),
        }
    }

    /// Whether the event touches a key under `prefix` (a reload touches all).
    pub fn affects_prefix(&self, prefix: &str) -> bool {
        match self {
            Self::KeyChanged { key } | Self::KeyRemoved { key } => key.starts_with(prefix),
            Self::Reloaded => true,
        }
    }
}

/// Default channel capacity for config update events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcaster for configuration update events.
///
/// Uses tokio's broadcast channel to distribute events to multiple subscribers.
#[derive(Clone)]
pub struct ConfigEventBroadcaster {
    sender: broadcast::Sender<ConfigUpdateEvent>,
}

impl ConfigEventBroadcaster {
    /// Create a new broadcaster with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new broadcaster with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to configuration update events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdateEvent> {
        self.sender.subscribe()
    }

    /// Publish a configuration update event.
    ///
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: ConfigUpdateEvent) -> usize {
        tracing::debug!("Publishing config event: {}", event.description());
        // send() returns Err if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ConfigEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_description() {
        assert_eq!(
            ConfigUpdateEvent::KeyChanged {
                key: "email.smtp_host".to_string()
            }
            .description(),
            "Config key changed: email.smtp_host"
        );
        assert_eq!(ConfigUpdateEvent::Reloaded.description(), "Config reloaded");
    }

    #[test]
    fn test_affects_prefix() {
        let event = ConfigUpdateEvent::KeyChanged {
            key: "notifications.battery_low".to_string(),
        };
        assert!(event.affects_prefix("notifications."));
        assert!(!event.affects_prefix("email."));
        assert!(ConfigUpdateEvent::Reloaded.affects_prefix("email."));
    }

    #[tokio::test]
    async fn test_broadcaster_multiple_subscribers() {
        let broadcaster = ConfigEventBroadcaster::new();
        let mut receiver1 = broadcaster.subscribe();
        let mut receiver2 = broadcaster.subscribe();

        assert_eq!(broadcaster.subscriber_count(), 2);

        let event = ConfigUpdateEvent::KeyRemoved {
            key: "telegram.chat_id".to_string(),
        };
        assert_eq!(broadcaster.publish(event.clone()), 2);

        assert_eq!(receiver1.recv().await.unwrap(), event);
        assert_eq!(receiver2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_broadcaster_no_subscribers() {
        let broadcaster = ConfigEventBroadcaster::new();
        assert_eq!(broadcaster.publish(ConfigUpdateEvent::Reloaded), 0);
    }
}
