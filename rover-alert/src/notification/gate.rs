//! Per-type enable switch applied before a notification is queued.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::NotificationType;
use crate::Result;
use crate::config::{ConfigStore, ConfigStoreExt, ConfigUpdateEvent};

/// Prefix of the per-type switches in the config store.
pub const SETTINGS_PREFIX: &str = "notifications.";

/// Enabled flag per notification type. Absent types are disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationSettings {
    enabled: HashMap<NotificationType, bool>,
}

impl NotificationSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings with every type enabled.
    pub fn all_enabled() -> Self {
        Self {
            enabled: NotificationType::ALL.iter().map(|t| (*t, true)).collect(),
        }
    }

    pub fn with(mut self, notification_type: NotificationType, enabled: bool) -> Self {
        self.set(notification_type, enabled);
        self
    }

    pub fn set(&mut self, notification_type: NotificationType, enabled: bool) {
        self.enabled.insert(notification_type, enabled);
    }

    pub fn is_enabled(&self, notification_type: NotificationType) -> bool {
        self.enabled.get(&notification_type).copied().unwrap_or(false)
    }

    /// Enabled types in declaration order.
    pub fn enabled_types(&self) -> Vec<NotificationType> {
        NotificationType::ALL
            .iter()
            .copied()
            .filter(|t| self.is_enabled(*t))
            .collect()
    }

    /// Read `notifications.<type>` switches from the store.
    ///
    /// Keys may use any accepted spelling of the type; unknown keys are
    /// skipped with a warning.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self> {
        let mut settings = Self::new();
        for key in store.keys_with_prefix(SETTINGS_PREFIX) {
            let name = &key[SETTINGS_PREFIX.len()..];
            let Some(notification_type) = NotificationType::parse(name) else {
                warn!(key = %key, "Ignoring setting for unknown notification type");
                continue;
            };
            if let Some(enabled) = store.get_bool(&key)? {
                settings.set(notification_type, enabled);
            }
        }
        Ok(settings)
    }
}

/// Answers "should this type be queued at all?".
#[derive(Debug, Default)]
pub struct NotificationGate {
    settings: RwLock<NotificationSettings>,
}

impl NotificationGate {
    pub fn new(settings: NotificationSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn is_enabled(&self, notification_type: NotificationType) -> bool {
        self.settings.read().is_enabled(notification_type)
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> NotificationSettings {
        self.settings.read().clone()
    }

    /// Swap in a new settings table.
    pub fn replace(&self, settings: NotificationSettings) {
        *self.settings.write() = settings;
    }

    pub fn set(&self, notification_type: NotificationType, enabled: bool) {
        self.settings.write().set(notification_type, enabled);
    }

    /// Reload the settings from `store` whenever a `notifications.*` key
    /// changes. Invalid values keep the previous settings.
    pub fn spawn_settings_watcher(
        self: &Arc<Self>,
        store: Arc<dyn ConfigStore>,
        mut rx: broadcast::Receiver<ConfigUpdateEvent>,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let gate = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Notification settings watcher shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(event) => {
                                if !event.affects_prefix(SETTINGS_PREFIX) {
                                    continue;
                                }
                                match NotificationSettings::from_store(store.as_ref()) {
                                    Ok(settings) => {
                                        info!(
                                            enabled = ?settings.enabled_types(),
                                            "Notification settings reloaded"
                                        );
                                        gate.replace(settings);
                                    }
                                    Err(e) => warn!("Keeping previous notification settings: {}", e),
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Settings watcher lagged by {} events, reloading", n);
                                if let Ok(settings) = NotificationSettings::from_store(store.as_ref()) {
                                    gate.replace(settings);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Config event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use std::time::Duration;

    #[test]
    fn test_absent_types_are_disabled() {
        let gate = NotificationGate::new(NotificationSettings::new());
        for t in NotificationType::ALL {
            assert!(!gate.is_enabled(t));
        }
    }

    #[test]
    fn test_explicit_settings() {
        let settings = NotificationSettings::new()
            .with(NotificationType::BatteryLow, true)
            .with(NotificationType::HumanDetection, false);
        let gate = NotificationGate::new(settings);

        assert!(gate.is_enabled(NotificationType::BatteryLow));
        assert!(!gate.is_enabled(NotificationType::HumanDetection));
        assert!(!gate.is_enabled(NotificationType::PatrolStatus));

        gate.set(NotificationType::PatrolStatus, true);
        assert!(gate.is_enabled(NotificationType::PatrolStatus));
    }

    #[test]
    fn test_from_store() {
        let store = MemoryConfigStore::from_pairs([
            ("notifications.battery_low", "true"),
            ("notifications.humanDetection", "on"),
            ("notifications.animal_detection", "false"),
            ("notifications.teleport", "true"),
        ]);
        let settings = NotificationSettings::from_store(&store).unwrap();
        assert_eq!(
            settings.enabled_types(),
            vec![NotificationType::HumanDetection, NotificationType::BatteryLow]
        );
    }

    #[test]
    fn test_from_store_rejects_bad_bool() {
        let store = MemoryConfigStore::from_pairs([("notifications.battery_low", "sometimes")]);
        assert!(NotificationSettings::from_store(&store).is_err());
    }

    #[test]
    fn test_settings_serde() {
        let settings = NotificationSettings::new().with(NotificationType::ConnectionLost, true);
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(json, r#"{"connection_lost":true}"#);
        let parsed: NotificationSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[tokio::test]
    async fn test_watcher_reloads_on_change() {
        let store = Arc::new(MemoryConfigStore::new());
        let gate = Arc::new(NotificationGate::default());
        let token = CancellationToken::new();

        let handle = gate.spawn_settings_watcher(store.clone(), store.subscribe(), token.clone());

        store.set("notifications.battery_low", "true".to_string());

        let mut enabled = false;
        for _ in 0..50 {
            if gate.is_enabled(NotificationType::BatteryLow) {
                enabled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(enabled);

        token.cancel();
        handle.await.unwrap();
    }
}
