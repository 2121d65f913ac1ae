//! Default subject/body templates per notification type.

use std::collections::HashMap;
use std::sync::LazyLock;

use alert_template::{Payload, Rendered, Template};
use serde_json::Value;
use tracing::{debug, warn};

use super::events::{Notification, NotificationType};
use crate::config::{ConfigStore, ConfigStoreExt};

/// Prefix of template overrides in the config store.
pub const TEMPLATES_PREFIX: &str = "templates.";

static FALLBACK_TEMPLATE: LazyLock<Template> =
    LazyLock::new(|| Template::new("{{type_label}}", "{{message}}<br>Time: {{timestamp}}"));

fn default_template(notification_type: NotificationType) -> Template {
    match notification_type {
        NotificationType::HumanDetection => Template::new(
            "Human Detected at {{location}}",
            "<b>A person was detected by the rover.</b><br>\
             Confidence: {{confidence}}<br>\
             Location: {{location}}<br>\
             Camera: {{camera}}<br>\
             Time: {{timestamp}}",
        ),
        NotificationType::AnimalDetection => Template::new(
            "Animal Detected: {{species}}",
            "<b>An animal ({{species}}) was detected.</b><br>\
             Confidence: {{confidence}}<br>\
             Location: {{location}}<br>\
             Time: {{timestamp}}",
        ),
        NotificationType::SystemAlert => Template::new(
            "System Alert: {{title}}",
            "<b>{{title}}</b><br>\
             {{message}}<br>\
             Severity: {{severity}}<br>\
             Time: {{timestamp}}",
        ),
        NotificationType::BatteryLow => Template::new(
            "Battery Low: {{battery}}%",
            "<b>Battery level is {{battery}}%</b> ({{voltage}} V).<br>\
             Return the rover to its charging dock.<br>\
             Time: {{timestamp}}",
        ),
        NotificationType::ConnectionLost => Template::new(
            "Connection Lost",
            "<b>The rover stopped responding.</b><br>\
             Last seen: {{last_seen}}<br>\
             Offline for: {{duration}} s<br>\
             Reason: {{reason}}",
        ),
        NotificationType::PatrolStatus => Template::new(
            "Patrol {{status}}",
            "Patrol is <b>{{status}}</b>.<br>\
             Waypoint: {{waypoint}}<br>\
             Progress: {{progress}}%<br>\
             Time: {{timestamp}}",
        ),
        NotificationType::ErrorAlert => Template::new(
            "Error in {{component}}",
            "<b>{{component}} reported an error.</b><br>\
             {{error}}<br>\
             Time: {{timestamp}}",
        ),
        NotificationType::StatusUpdate => Template::new(
            "Status Update",
            "{{message}}<br>\
             Time: {{timestamp}}",
        ),
    }
}

/// Template per notification type, seeded with defaults.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<NotificationType, Template>,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            templates: NotificationType::ALL
                .iter()
                .map(|t| (*t, default_template(*t)))
                .collect(),
        }
    }
}

impl TemplateSet {
    /// An empty set; every lookup falls back to the generic template.
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn get(&self, notification_type: NotificationType) -> &Template {
        self.templates
            .get(&notification_type)
            .unwrap_or(&*FALLBACK_TEMPLATE)
    }

    pub fn set(&mut self, notification_type: NotificationType, template: Template) {
        self.templates.insert(notification_type, template);
    }

    /// Apply `templates.<type>.subject` / `templates.<type>.body` overrides.
    pub fn with_overrides_from(mut self, store: &dyn ConfigStore) -> Self {
        for key in store.keys_with_prefix(TEMPLATES_PREFIX) {
            let rest = &key[TEMPLATES_PREFIX.len()..];
            let Some((type_name, field)) = rest.rsplit_once('.') else {
                warn!(key = %key, "Ignoring malformed template key");
                continue;
            };
            let Some(notification_type) = NotificationType::parse(type_name) else {
                warn!(key = %key, "Ignoring template for unknown notification type");
                continue;
            };
            let Some(value) = store.get_string(&key) else {
                continue;
            };

            let template = self
                .templates
                .entry(notification_type)
                .or_insert_with(|| default_template(notification_type));
            match field {
                "subject" => template.subject = value,
                "body" => template.body = value,
                other => {
                    warn!(key = %key, field = other, "Ignoring unknown template field");
                    continue;
                }
            }
            debug!(notification_type = %notification_type, field, "Template overridden");
        }
        self
    }

    /// Render the template for `notification`.
    ///
    /// The payload is extended with `notification_id`, `type`, `type_label`,
    /// `priority` and `timestamp` unless it already carries those keys.
    pub fn render(&self, notification: &Notification) -> Rendered {
        let payload = render_context(notification);
        let template = self.get(notification.notification_type);
        let missing = template.missing_keys(&payload);
        if !missing.is_empty() {
            debug!(
                notification_id = %notification.id,
                notification_type = %notification.notification_type,
                missing = ?missing,
                "Template placeholders left unresolved"
            );
        }
        template.render(&payload)
    }
}

fn render_context(notification: &Notification) -> Payload {
    let mut payload = notification.payload.clone();
    let defaults = [
        ("notification_id", notification.id.to_string()),
        ("type", notification.notification_type.key().to_string()),
        ("type_label", notification.notification_type.label().to_string()),
        ("priority", notification.priority.to_string()),
        ("timestamp", notification.created_at.to_rfc3339()),
    ];
    for (key, value) in defaults {
        payload
            .entry(key.to_string())
            .or_insert(Value::String(value));
    }
    payload
}
