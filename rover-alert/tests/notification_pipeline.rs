//! Integration tests for the notification pipeline.
//!
//! These tests drive the public API end to end: events go through the
//! adapter and gate, are rendered by the real channels and delivered to
//! recording transports instead of SMTP or the Bot API.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rover_alert::Error;
use rover_alert::config::{AppConfig, MemoryConfigStore};
use rover_alert::notification::channels::{
    Ack, ChannelAdapter, ChannelError, ChannelKind, EmailChannel, EmailConfig, Message,
    MessageSender, TelegramChannel, TelegramConfig, build_channel,
};
use rover_alert::notification::{
    DiagnosticLevel, DiagnosticsSink, DispatcherConfig, EventAdapter, MemorySink,
    NotificationDispatcher, NotificationGate, NotificationPriority, NotificationSettings,
    NotificationStatus, NotificationType, RetryPolicy, TemplateSet,
};
use serde_json::json;

/// Transport that records every message and replays scripted failures.
#[derive(Default)]
struct RecordingSender {
    sent: tokio::sync::Mutex<Vec<Message>>,
    failures: parking_lot::Mutex<VecDeque<ChannelError>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingSender {
    fn failing(failures: Vec<ChannelError>) -> Self {
        Self {
            failures: parking_lot::Mutex::new(failures.into()),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn messages(&self) -> Vec<Message> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn deliver(&self, message: &Message) -> Result<Ack, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        if let Some(e) = failure {
            return Err(e);
        }
        self.sent.lock().await.push(message.clone());
        Ok(Ack::new("recording"))
    }
}

fn email_config() -> EmailConfig {
    EmailConfig {
        smtp_host: "smtp.example.com".to_string(),
        from_address: "rover@example.com".to_string(),
        to_addresses: vec!["ops@example.com".to_string()],
        ..Default::default()
    }
}

fn telegram_config() -> TelegramConfig {
    TelegramConfig {
        bot_token: "123:ABC".to_string(),
        chat_id: "42".to_string(),
        ..Default::default()
    }
}

fn fast_config(max_attempts: u32) -> DispatcherConfig {
    DispatcherConfig {
        retry: RetryPolicy {
            max_attempts,
            base_delay_ms: 5,
            max_delay_ms: 20,
            use_jitter: false,
        },
        process_interval: Duration::from_millis(50),
        history_capacity: 32,
    }
}

fn dispatcher(
    channel: Arc<dyn ChannelAdapter>,
    settings: NotificationSettings,
    max_attempts: u32,
) -> Arc<NotificationDispatcher> {
    let gate = Arc::new(NotificationGate::new(settings));
    Arc::new(NotificationDispatcher::new(channel, gate).with_config(fast_config(max_attempts)))
}

/// Poll `condition` every 5ms for up to two seconds.
async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

mod gate_tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_type_is_never_queued() {
        let sender = Arc::new(RecordingSender::default());
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender.clone()));
        let settings = NotificationSettings::all_enabled().with(NotificationType::HumanDetection, false);
        let dispatcher = dispatcher(channel, settings, 3);
        let adapter = EventAdapter::new(dispatcher.clone());

        assert_eq!(adapter.human_detected(0.95, Some("north gate".into())), None);
        assert_eq!(dispatcher.queue_len(), 0);

        dispatcher.process_queue().await;
        assert_eq!(sender.calls(), 0);
        assert_eq!(dispatcher.stats().gated, 1);
    }

    #[tokio::test]
    async fn test_enqueue_reports_gate_closed() {
        let sender = Arc::new(RecordingSender::default());
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender));
        let dispatcher = dispatcher(channel, NotificationSettings::new(), 3);

        let err = dispatcher
            .enqueue(
                NotificationType::PatrolStatus,
                Default::default(),
                NotificationPriority::Low,
            )
            .unwrap_err();
        assert!(matches!(err, Error::GateClosed(NotificationType::PatrolStatus)));
        assert!(dispatcher.is_idle());
    }

    #[tokio::test]
    async fn test_default_settings_reject_every_type() {
        let sender = Arc::new(RecordingSender::default());
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender.clone()));
        let dispatcher = dispatcher(channel, NotificationSettings::new(), 3);

        let mut payload = alert_template::Payload::new();
        payload.insert("message".to_string(), json!("hello"));
        for notification_type in NotificationType::ALL {
            assert_eq!(
                dispatcher.notify(notification_type, payload.clone(), None),
                None,
                "{notification_type} should be disabled by default"
            );
            assert_eq!(dispatcher.queue_len(), 0);
        }

        dispatcher.process_queue().await;
        assert_eq!(sender.calls(), 0);
        assert_eq!(dispatcher.stats().gated, NotificationType::ALL.len() as u64);
    }

    #[tokio::test]
    async fn test_gate_change_applies_to_next_notify() {
        let sender = Arc::new(RecordingSender::default());
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender));
        let dispatcher = dispatcher(channel, NotificationSettings::new(), 3);
        let adapter = EventAdapter::new(dispatcher.clone());

        assert!(adapter.battery_low(15.0, 11.2).is_none());
        dispatcher.gate().set(NotificationType::BatteryLow, true);
        assert!(adapter.battery_low(15.0, 11.2).is_some());
        assert_eq!(dispatcher.queue_len(), 1);
    }
}

mod delivery_tests {
    use super::*;

    #[tokio::test]
    async fn test_battery_low_email_end_to_end() {
        let sender = Arc::new(RecordingSender::default());
        let channel = Arc::new(EmailChannel::with_sender(email_config(), sender.clone()));
        let dispatcher = dispatcher(channel, NotificationSettings::all_enabled(), 3);
        let adapter = EventAdapter::new(dispatcher.clone());

        let id = adapter.battery_low(15.0, 11.2).unwrap();
        let summary = dispatcher.process_queue().await;
        assert_eq!(summary.sent, 1);
        assert_eq!(dispatcher.status(id), Some(NotificationStatus::Sent));

        let messages = sender.messages().await;
        assert_eq!(messages.len(), 1);
        let Message::Email(email) = &messages[0] else {
            panic!("expected an email message");
        };
        assert!(email.subject.contains("Battery Low"));
        assert!(email.text_body.contains("15"));
        assert!(email.text_body.contains("11.2"));
        assert!(email.html_body.contains("<b>Battery level is 15%</b>"));
    }

    #[tokio::test]
    async fn test_payload_markup_is_escaped_per_channel() {
        let email_sender = Arc::new(RecordingSender::default());
        let email = dispatcher(
            Arc::new(EmailChannel::with_sender(email_config(), email_sender.clone())),
            NotificationSettings::all_enabled(),
            3,
        );
        let telegram_sender = Arc::new(RecordingSender::default());
        let telegram = dispatcher(
            Arc::new(TelegramChannel::with_sender(telegram_config(), telegram_sender.clone())),
            NotificationSettings::all_enabled(),
            3,
        );

        for dispatcher in [&email, &telegram] {
            EventAdapter::new(dispatcher.clone())
                .system_alert(
                    "Temp <40C> & rising",
                    "<script>alert(1)</script> x<5",
                    NotificationPriority::High,
                )
                .unwrap();
            assert_eq!(dispatcher.process_queue().await.sent, 1);
        }

        let messages = email_sender.messages().await;
        let Message::Email(mail) = &messages[0] else {
            panic!("expected an email message");
        };
        assert!(mail.subject.contains("Temp <40C> & rising"));
        assert!(!mail.html_body.contains("<script>"));
        assert!(mail.html_body.contains("&lt;script&gt;alert(1)&lt;/script&gt; x&lt;5"));
        assert!(mail.text_body.contains("<script>alert(1)</script> x<5"));

        let messages = telegram_sender.messages().await;
        let Message::Chat(chat) = &messages[0] else {
            panic!("expected a chat message");
        };
        assert!(chat.text.contains("<b>System Alert: Temp &lt;40C&gt; &amp; rising</b>"));
        assert!(chat.text.contains("&lt;script&gt;alert(1)&lt;/script&gt; x&lt;5"));
        assert!(!chat.text.contains("<script>"));
    }

    #[tokio::test]
    async fn test_fail_once_then_succeed() {
        let sender = Arc::new(RecordingSender::failing(vec![ChannelError::Timeout]));
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender.clone()));
        let dispatcher = dispatcher(channel, NotificationSettings::all_enabled(), 3);
        let adapter = EventAdapter::new(dispatcher.clone());

        let id = adapter.system_alert("Disk", "Almost full", NotificationPriority::High).unwrap();
        let first = dispatcher.process_queue().await;
        assert_eq!(first.rescheduled, 1);

        assert!(wait_until(|| dispatcher.status(id) == Some(NotificationStatus::Sent)).await);
        assert_eq!(sender.calls(), 2);
        assert_eq!(dispatcher.notification(id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let failures = vec![ChannelError::unknown("502 Bad Gateway"); 10];
        let sender = Arc::new(RecordingSender::failing(failures));
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender.clone()));
        let dispatcher = dispatcher(channel, NotificationSettings::all_enabled(), 3);
        let adapter = EventAdapter::new(dispatcher.clone());

        let id = adapter.patrol_status("running", Some("wp-2".into()), Some(40.0)).unwrap();
        dispatcher.process_queue().await;

        assert!(wait_until(|| dispatcher.status(id) == Some(NotificationStatus::Failed)).await);
        assert_eq!(sender.calls(), 3);

        let notification = dispatcher.notification(id).unwrap();
        assert_eq!(notification.attempts, 3);
        assert!(notification.last_error.unwrap().contains("502"));

        // No further attempts once terminal.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sender.calls(), 3);
        assert_eq!(dispatcher.scheduled_retries(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_channel_fails_without_sending() {
        let sender = Arc::new(RecordingSender::default());
        let channel = Arc::new(TelegramChannel::with_sender(TelegramConfig::default(), sender.clone()));
        let dispatcher = dispatcher(channel, NotificationSettings::all_enabled(), 3);
        let adapter = EventAdapter::new(dispatcher.clone());

        let id = adapter.connection_lost(None, Some("heartbeat timeout".into())).unwrap();
        let summary = dispatcher.process_queue().await;

        assert_eq!(summary.failed, 1);
        assert_eq!(sender.calls(), 0);
        let notification = dispatcher.notification(id).unwrap();
        assert_eq!(notification.status, NotificationStatus::Failed);
        assert_eq!(notification.attempts, 1);
        assert_eq!(dispatcher.scheduled_retries(), 0);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let sender = Arc::new(RecordingSender::default());
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender.clone()));
        let dispatcher = dispatcher(channel, NotificationSettings::all_enabled(), 3);
        let adapter = EventAdapter::new(dispatcher.clone());

        adapter.animal_detected("fox", 0.7, Some("field".into())).unwrap();
        adapter.battery_low(15.0, 11.2).unwrap();
        dispatcher.process_queue().await;

        let messages = sender.messages().await;
        let texts: Vec<&str> = messages.iter().map(|m| m.summary()).collect();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("Animal Detected"));
        assert!(texts[1].contains("Battery Low"));
    }

    #[tokio::test]
    async fn test_concurrent_passes_send_once() {
        let sender = Arc::new(RecordingSender::slow(Duration::from_millis(20)));
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender.clone()));
        let dispatcher = dispatcher(channel, NotificationSettings::all_enabled(), 3);
        let adapter = EventAdapter::new(dispatcher.clone());

        for i in 0..5 {
            adapter.battery_low(15.0 - i as f64, 11.2).unwrap();
        }

        let passes = (0..4).map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.process_queue().await })
        });
        let mut sent = 0;
        for pass in passes.collect::<Vec<_>>() {
            sent += pass.await.unwrap().sent;
        }

        assert_eq!(sent, 5);
        assert_eq!(sender.calls(), 5);
        assert_eq!(dispatcher.queue_len(), 0);
    }
}

mod lifecycle_tests {
    use super::*;
    use rover_alert::notification::DomainEvent;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_listener_feeds_running_dispatcher() {
        let sender = Arc::new(RecordingSender::default());
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender.clone()));
        let dispatcher = dispatcher(channel, NotificationSettings::all_enabled(), 3);
        dispatcher.start().unwrap();

        let adapter = Arc::new(EventAdapter::new(dispatcher.clone()));
        let (tx, rx) = broadcast::channel(16);
        let listener = adapter.spawn_listener(rx, CancellationToken::new());

        let event: DomainEvent = serde_json::from_value(json!({
            "kind": "human_detected",
            "confidence": 0.93,
            "location": "north gate"
        }))
        .unwrap();
        tx.send(event).unwrap();
        drop(tx);
        listener.await.unwrap();

        assert!(wait_until(|| dispatcher.stats().sent == 1).await);
        let messages = sender.messages().await;
        assert!(messages[0].summary().contains("Human Detected at north gate"));

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
    }

    #[tokio::test]
    async fn test_stop_drains_queue_and_drops_retries() {
        let failures = vec![ChannelError::Timeout; 5];
        let sender = Arc::new(RecordingSender::failing(failures));
        let channel = Arc::new(TelegramChannel::with_sender(telegram_config(), sender.clone()));
        let gate = Arc::new(NotificationGate::new(NotificationSettings::all_enabled()));
        let mut config = fast_config(3);
        config.retry.base_delay_ms = 10_000;
        config.retry.max_delay_ms = 10_000;
        let dispatcher = Arc::new(NotificationDispatcher::new(channel, gate).with_config(config));
        let adapter = EventAdapter::new(dispatcher.clone());

        let id = adapter.battery_low(9.0, 10.5).unwrap();
        dispatcher.process_queue().await;
        assert_eq!(dispatcher.scheduled_retries(), 1);

        dispatcher.stop().await;
        assert_eq!(dispatcher.scheduled_retries(), 0);
        assert_eq!(dispatcher.status(id), Some(NotificationStatus::Failed));
        assert_eq!(sender.calls(), 1);
    }
}

mod template_tests {
    use super::*;
    use rover_alert::notification::Notification;

    #[test]
    fn test_render_is_deterministic() {
        let templates = TemplateSet::default();
        let mut payload = alert_template::Payload::new();
        payload.insert("battery".to_string(), json!(15));
        payload.insert("voltage".to_string(), json!(11.2));
        let notification = Notification::new(
            NotificationType::BatteryLow,
            payload,
            NotificationPriority::High,
            3,
        );

        let first = templates.render(&notification);
        let second = templates.render(&notification);
        assert_eq!(first, second);
        assert_eq!(first.subject, "Battery Low: 15%");
    }

    #[test]
    fn test_missing_keys_are_left_in_place() {
        let notification = Notification::new(
            NotificationType::BatteryLow,
            Default::default(),
            NotificationPriority::High,
            3,
        );
        let rendered = TemplateSet::default().render(&notification);
        assert_eq!(rendered.subject, "Battery Low: {{battery}}%");
        assert!(rendered.body.contains("{{voltage}}"));
    }
}

mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "notifications": {{"battery_low": true, "patrol_status": false}},
                "email": {{
                    "smtp_host": "smtp.example.com",
                    "from_address": "rover@example.com",
                    "to_addresses": "ops@example.com, owner@example.com"
                }},
                "templates": {{"battery_low": {{"subject": "Charge at {{{{battery}}}}%"}}}}
            }}"#
        )
        .unwrap();

        let store = MemoryConfigStore::load_json_file(file.path()).unwrap();
        let config = AppConfig::from_store(&store).unwrap();

        assert!(config.notifications.is_enabled(NotificationType::BatteryLow));
        assert!(!config.notifications.is_enabled(NotificationType::PatrolStatus));
        assert_eq!(config.email.to_addresses.len(), 2);
        assert_eq!(
            config.templates.get(NotificationType::BatteryLow).subject,
            "Charge at {{battery}}%"
        );
    }

    #[tokio::test]
    async fn test_partially_configured_channel_fails_loudly() {
        let store = MemoryConfigStore::from_pairs([("email.smtp_host", "smtp.example.com")]);
        let config = AppConfig::from_store(&store).unwrap();
        assert_eq!(config.declared_channels, vec![ChannelKind::Email]);
        assert_eq!(config.incomplete_channels(), vec![ChannelKind::Email]);

        let channel = build_channel(ChannelKind::Email, &store).unwrap();
        assert!(!channel.is_configured());

        let sink = Arc::new(MemorySink::new(16));
        let gate = Arc::new(NotificationGate::new(NotificationSettings::all_enabled()));
        let dispatcher = Arc::new(
            NotificationDispatcher::new(channel, gate)
                .with_config(fast_config(3))
                .with_diagnostics(sink.clone() as Arc<dyn DiagnosticsSink>),
        );

        let id = dispatcher
            .notify(NotificationType::ErrorAlert, Default::default(), None)
            .unwrap();
        assert_eq!(dispatcher.process_queue().await.failed, 1);
        assert_eq!(dispatcher.status(id), Some(NotificationStatus::Failed));
        assert!(
            sink.for_notification(id)
                .iter()
                .any(|r| r.level == DiagnosticLevel::Error)
        );
    }

    #[test]
    fn test_env_overrides_win() {
        let store = MemoryConfigStore::from_pairs([("telegram.chat_id", "1")]);
        store.apply_overrides([
            ("ROVER_ALERT__TELEGRAM__CHAT_ID".to_string(), "2".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        let config = AppConfig::from_store(&store).unwrap();
        assert_eq!(config.telegram.chat_id, "2");
    }
}
