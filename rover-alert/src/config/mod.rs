//! Configuration module.
//!
//! Settings live in a key-value [`ConfigStore`]; every write is broadcast as a
//! [`ConfigUpdateEvent`] so long-lived components can reload. [`AppConfig`]
//! is the typed snapshot the binary starts from.

pub mod events;
pub mod store;

pub use events::{ConfigEventBroadcaster, ConfigUpdateEvent};
pub use store::{ConfigStore, ConfigStoreExt, ENV_PREFIX, MemoryConfigStore};

use crate::Result;
use crate::logging::LoggingSettings;
use crate::notification::channels::{ChannelKind, EmailConfig, TelegramConfig};
use crate::notification::gate::NotificationSettings;
use crate::notification::scheduler::DispatcherConfig;
use crate::notification::templates::TemplateSet;

/// Typed view of every section of the store.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub logging: LoggingSettings,
    pub dispatcher: DispatcherConfig,
    pub notifications: NotificationSettings,
    pub email: EmailConfig,
    pub telegram: TelegramConfig,
    pub templates: TemplateSet,
    /// Channels with at least one non-blank setting, complete or not.
    pub declared_channels: Vec<ChannelKind>,
}

impl AppConfig {
    /// Read all sections. The first unparseable value aborts the load.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self> {
        Ok(Self {
            logging: LoggingSettings::from_store(store)?,
            dispatcher: DispatcherConfig::from_store(store)?,
            notifications: NotificationSettings::from_store(store)?,
            email: EmailConfig::from_store(store)?,
            telegram: TelegramConfig::from_store(store)?,
            templates: TemplateSet::default().with_overrides_from(store),
            declared_channels: declared_channels(store),
        })
    }

    /// Channel kinds whose required settings are all present.
    pub fn configured_channels(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                ChannelKind::Email => self.email.is_complete(),
                ChannelKind::Telegram => self.telegram.is_complete(),
            })
            .collect()
    }

    /// Declared channels missing a required setting.
    pub fn incomplete_channels(&self) -> Vec<ChannelKind> {
        let configured = self.configured_channels();
        self.declared_channels
            .iter()
            .copied()
            .filter(|kind| !configured.contains(kind))
            .collect()
    }
}

fn declared_channels(store: &dyn ConfigStore) -> Vec<ChannelKind> {
    ChannelKind::ALL
        .into_iter()
        .filter(|kind| {
            store
                .keys_with_prefix(kind.config_prefix())
                .iter()
                .any(|key| store.get_string(key).is_some())
        })
        .collect()
}
