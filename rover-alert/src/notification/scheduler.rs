//! Notification dispatcher.
//!
//! The NotificationDispatcher is responsible for:
//! - Gating notifications by type before they are queued
//! - Draining the queue in FIFO order, one pass at a time
//! - Rescheduling failed deliveries with a growing delay
//! - Reporting every terminal outcome to the diagnostics sink
//!
//! One dispatcher delivers through exactly one [`ChannelAdapter`]. Run one
//! dispatcher per channel to fan out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alert_template::Payload;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channels::{ChannelAdapter, ChannelError};
use super::diagnostics::{DiagnosticLevel, DiagnosticRecord, DiagnosticsSink, TracingSink};
use super::events::{
    Notification, NotificationId, NotificationPriority, NotificationStatus, NotificationType,
};
use super::gate::NotificationGate;
use super::queue::{DeliveryHistory, NotificationQueue};
use super::retry::RetryPolicy;
use super::templates::TemplateSet;
use crate::config::{ConfigStore, ConfigStoreExt};
use crate::{Error, Result};

/// Configuration for a dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Attempt bound and backoff.
    pub retry: RetryPolicy,
    /// Safety-net interval of the background worker.
    pub process_interval: Duration,
    /// Number of finished notifications kept for status queries.
    pub history_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            process_interval: Duration::from_secs(30),
            history_capacity: 200,
        }
    }
}

impl DispatcherConfig {
    /// Read `dispatcher.*` settings. Durations are in milliseconds.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self> {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: store
                .get_u32("dispatcher.max_attempts")?
                .unwrap_or(defaults.retry.max_attempts),
            base_delay_ms: store
                .get_u64("dispatcher.base_retry_delay_ms")?
                .unwrap_or(defaults.retry.base_delay_ms),
            max_delay_ms: store
                .get_u64("dispatcher.max_retry_delay_ms")?
                .unwrap_or(defaults.retry.max_delay_ms),
            use_jitter: store
                .get_bool("dispatcher.use_jitter")?
                .unwrap_or(defaults.retry.use_jitter),
        };
        if retry.max_attempts == 0 {
            return Err(Error::config("dispatcher.max_attempts must be at least 1"));
        }

        let process_interval = store
            .get_duration_ms("dispatcher.process_interval_ms")?
            .unwrap_or(defaults.process_interval);
        if process_interval.is_zero() {
            return Err(Error::config("dispatcher.process_interval_ms must be positive"));
        }

        Ok(Self {
            retry,
            process_interval,
            history_capacity: store
                .get_usize("dispatcher.history_capacity")?
                .unwrap_or(defaults.history_capacity),
        })
    }
}

/// Why a notification ended up `Failed`. Logged, never returned to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    #[error("{0} channel is not configured")]
    NotConfigured(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: ChannelError,
    },

    #[error("Permanent send failure: {0}")]
    Permanent(ChannelError),

    #[error("Dispatcher stopped before the next attempt")]
    Cancelled,
}

/// Counts from one `process_queue` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub sent: usize,
    pub failed: usize,
    pub rescheduled: usize,
    /// Another pass was already running, so this call did nothing.
    pub skipped: bool,
}

impl PassSummary {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn processed(&self) -> usize {
        self.sent + self.failed + self.rescheduled
    }
}

/// Statistics about a dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub channel: String,
    /// Notifications waiting in the queue.
    pub queued: usize,
    /// Notifications waiting for a retry delay to elapse.
    pub scheduled_retries: usize,
    pub sent: u64,
    pub failed: u64,
    /// Notifications rejected by the gate.
    pub gated: u64,
    pub enabled_types: Vec<NotificationType>,
}

enum Outcome {
    Sent,
    Failed,
    Rescheduled,
}

struct ScheduledRetry {
    notification: Notification,
    due_at: DateTime<Utc>,
}

/// Queue plus single-flight delivery loop for one channel.
pub struct NotificationDispatcher {
    channel: Arc<dyn ChannelAdapter>,
    gate: Arc<NotificationGate>,
    templates: RwLock<Arc<TemplateSet>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    config: DispatcherConfig,
    queue: NotificationQueue,
    scheduled: DashMap<NotificationId, ScheduledRetry>,
    history: DeliveryHistory,
    gated: AtomicU64,
    /// Held for the duration of a pass.
    processing: tokio::sync::Mutex<()>,
    wake: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl NotificationDispatcher {
    /// Create a dispatcher with default configuration, templates and a
    /// tracing diagnostics sink.
    pub fn new(channel: Arc<dyn ChannelAdapter>, gate: Arc<NotificationGate>) -> Self {
        let config = DispatcherConfig::default();
        Self {
            channel,
            gate,
            templates: RwLock::new(Arc::new(TemplateSet::default())),
            diagnostics: Arc::new(TracingSink::new()),
            history: DeliveryHistory::new(config.history_capacity),
            config,
            queue: NotificationQueue::new(),
            scheduled: DashMap::new(),
            gated: AtomicU64::new(0),
            processing: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            worker: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.history = DeliveryHistory::new(config.history_capacity);
        self.config = config;
        self
    }

    pub fn with_templates(self, templates: TemplateSet) -> Self {
        *self.templates.write() = Arc::new(templates);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn channel(&self) -> &Arc<dyn ChannelAdapter> {
        &self.channel
    }

    pub fn gate(&self) -> &Arc<NotificationGate> {
        &self.gate
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Current template set.
    pub fn templates(&self) -> Arc<TemplateSet> {
        self.templates.read().clone()
    }

    /// Swap the template set. Takes effect from the next composed message.
    pub fn set_templates(&self, templates: TemplateSet) {
        *self.templates.write() = Arc::new(templates);
    }

    /// Queue a notification if its type is enabled.
    ///
    /// Returns [`Error::GateClosed`] for disabled types; nothing is queued.
    pub fn enqueue(
        &self,
        notification_type: NotificationType,
        payload: Payload,
        priority: NotificationPriority,
    ) -> Result<NotificationId> {
        if !self.gate.is_enabled(notification_type) {
            self.gated.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.record(
                DiagnosticRecord::new(
                    DiagnosticLevel::Info,
                    format!("{} notifications are disabled; not queued", notification_type),
                )
                .with_type(notification_type)
                .with_channel(self.channel.channel_type()),
            );
            return Err(Error::GateClosed(notification_type));
        }

        let notification = Notification::new(
            notification_type,
            payload,
            priority,
            self.config.retry.max_attempts,
        );
        let id = notification.id;
        debug!(
            notification_id = %id,
            notification_type = %notification_type,
            priority = %priority,
            channel = self.channel.channel_type(),
            "Notification queued"
        );
        self.queue.push(notification);
        self.wake.notify_one();
        Ok(id)
    }

    /// Fire-and-forget entry point. Returns `None` when the type is disabled.
    pub fn notify(
        &self,
        notification_type: NotificationType,
        payload: Payload,
        priority: Option<NotificationPriority>,
    ) -> Option<NotificationId> {
        self.enqueue(notification_type, payload, priority.unwrap_or_default())
            .ok()
    }

    /// Drain the queue.
    ///
    /// Only one pass runs at a time; an overlapping call returns
    /// [`PassSummary::skipped`] and leaves the work to the running pass.
    pub async fn process_queue(self: &Arc<Self>) -> PassSummary {
        let mut summary = PassSummary::default();
        let mut ran = false;

        loop {
            let Ok(guard) = self.processing.try_lock() else {
                break;
            };
            ran = true;

            while let Some(notification) = self.queue.pop() {
                match self.deliver(notification).await {
                    Outcome::Sent => summary.sent += 1,
                    Outcome::Failed => summary.failed += 1,
                    Outcome::Rescheduled => summary.rescheduled += 1,
                }
            }
            drop(guard);

            // Work pushed while the guard was being released would otherwise
            // wait for the next trigger.
            if self.queue.is_empty() {
                break;
            }
        }

        if !ran {
            return PassSummary::skipped();
        }
        if summary.processed() > 0 {
            debug!(
                channel = self.channel.channel_type(),
                sent = summary.sent,
                failed = summary.failed,
                rescheduled = summary.rescheduled,
                "Queue pass finished"
            );
        }
        summary
    }

    async fn deliver(self: &Arc<Self>, mut notification: Notification) -> Outcome {
        let channel_type = self.channel.channel_type();

        if !self.channel.is_configured() {
            // Counts as the one and only attempt.
            let _ = notification.record_attempt();
            return self.finish_failed(
                notification,
                DeliveryFailure::NotConfigured(channel_type.to_string()),
            );
        }

        if let Err(e) = notification.record_attempt() {
            warn!(notification_id = %notification.id, "Dropping notification: {}", e);
            let last_error = ChannelError::unknown(e.to_string());
            let attempts = notification.attempts;
            return self.finish_failed(
                notification,
                DeliveryFailure::RetryExhausted {
                    attempts,
                    last_error,
                },
            );
        }

        let templates = self.templates();
        let message = self.channel.compose(&notification, &templates);

        match self.channel.send(&message).await {
            Ok(ack) => {
                if let Err(e) = notification.mark_sent() {
                    warn!(notification_id = %notification.id, "{}", e);
                }
                self.diagnostics.record(
                    DiagnosticRecord::new(
                        DiagnosticLevel::Info,
                        format!(
                            "Notification delivered after {} attempt(s){}",
                            notification.attempts,
                            ack.message_id
                                .as_deref()
                                .map(|m| format!(" ({})", m))
                                .unwrap_or_default()
                        ),
                    )
                    .with_notification(notification.id, notification.notification_type)
                    .with_channel(channel_type),
                );
                self.history.record(notification);
                Outcome::Sent
            }
            Err(e) if !e.is_retryable() => {
                self.finish_failed(notification, DeliveryFailure::Permanent(e))
            }
            Err(e) => {
                if let ChannelError::RateLimited {
                    retry_after: Some(hint),
                } = &e
                {
                    debug!(
                        notification_id = %notification.id,
                        "Provider asked to wait {:?}; using the retry policy delay instead",
                        hint
                    );
                }

                if notification.can_retry() {
                    self.schedule_retry(notification, e)
                } else {
                    let attempts = notification.attempts;
                    self.finish_failed(
                        notification,
                        DeliveryFailure::RetryExhausted {
                            attempts,
                            last_error: e,
                        },
                    )
                }
            }
        }
    }

    fn finish_failed(&self, mut notification: Notification, failure: DeliveryFailure) -> Outcome {
        let reason = failure.to_string();
        if let Err(e) = notification.mark_failed(reason.clone()) {
            warn!(notification_id = %notification.id, "{}", e);
        }
        self.diagnostics.record(
            DiagnosticRecord::new(
                DiagnosticLevel::Error,
                format!("Notification failed permanently: {}", reason),
            )
            .with_notification(notification.id, notification.notification_type)
            .with_channel(self.channel.channel_type()),
        );
        self.history.record(notification);
        Outcome::Failed
    }

    /// Put `notification` back on the queue tail after the backoff delay.
    fn schedule_retry(self: &Arc<Self>, mut notification: Notification, error: ChannelError) -> Outcome {
        if self.cancellation_token.is_cancelled() {
            return self.finish_failed(notification, DeliveryFailure::Cancelled);
        }

        let id = notification.id;
        let delay = self.config.retry.delay_for_attempt(notification.attempts);
        let due_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        notification.last_error = Some(error.to_string());
        notification.next_attempt_at = Some(due_at);

        warn!(
            notification_id = %id,
            channel = self.channel.channel_type(),
            attempt = notification.attempts,
            max_attempts = notification.max_attempts,
            error = %error,
            "Delivery failed, retrying in {:?}",
            delay
        );

        let token = self.cancellation_token.child_token();
        self.scheduled.insert(
            id,
            ScheduledRetry {
                notification,
                due_at,
            },
        );

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                // stop() settles the entry.
                _ = token.cancelled() => return,
                _ = sleep(delay) => {},
            }

            let Some((_, scheduled)) = dispatcher.scheduled.remove(&id) else {
                return;
            };
            let mut notification = scheduled.notification;
            notification.next_attempt_at = None;
            dispatcher.queue.push(notification);
            dispatcher.process_queue().await;
        });

        Outcome::Rescheduled
    }

    /// When the retry for `id` is due, if one is scheduled.
    pub fn next_retry_at(&self, id: NotificationId) -> Option<DateTime<Utc>> {
        self.scheduled.get(&id).map(|s| s.due_at)
    }

    /// Start the background worker.
    ///
    /// The worker runs a pass whenever something is enqueued and on every
    /// `process_interval` tick. A stopped dispatcher cannot be restarted.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::InvalidStateTransition {
                from: "stopped".to_string(),
                to: "running".to_string(),
            });
        }

        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!(channel = self.channel.channel_type(), "Dispatcher already running");
            return Ok(());
        }

        let dispatcher = Arc::clone(self);
        let token = self.cancellation_token.clone();
        let process_interval = self.config.process_interval;

        *worker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(process_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Dispatcher worker shutting down");
                        break;
                    }
                    _ = dispatcher.wake.notified() => {}
                    _ = interval.tick() => {}
                }
                dispatcher.process_queue().await;
            }
        }));

        info!(
            channel = self.channel.channel_type(),
            configured = self.channel.is_configured(),
            interval = ?process_interval,
            "Notification dispatcher started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some() && !self.cancellation_token.is_cancelled()
    }

    /// Stop the dispatcher.
    ///
    /// Cancels the worker and every scheduled retry (those notifications are
    /// marked `Failed`), then runs one last pass over the queue.
    pub async fn stop(self: &Arc<Self>) -> PassSummary {
        info!(channel = self.channel.channel_type(), "Stopping notification dispatcher");
        self.cancellation_token.cancel();

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!("Dispatcher worker ended abnormally: {}", e);
            }
        }

        let pending: Vec<NotificationId> = self.scheduled.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, scheduled)) = self.scheduled.remove(&id) {
                warn!(notification_id = %id, "Dropping scheduled retry on shutdown");
                self.finish_failed(scheduled.notification, DeliveryFailure::Cancelled);
            }
        }

        let summary = self.process_queue().await;
        info!(
            channel = self.channel.channel_type(),
            sent = summary.sent,
            failed = summary.failed,
            "Notification dispatcher stopped"
        );
        summary
    }

    /// Number of notifications waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn scheduled_retries(&self) -> usize {
        self.scheduled.len()
    }

    /// Whether anything is queued or waiting for a retry.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.scheduled.is_empty()
    }

    /// Look up a notification wherever it currently is.
    pub fn notification(&self, id: NotificationId) -> Option<Notification> {
        self.queue
            .get(id)
            .or_else(|| self.scheduled.get(&id).map(|s| s.notification.clone()))
            .or_else(|| self.history.get(id))
    }

    pub fn status(&self, id: NotificationId) -> Option<NotificationStatus> {
        self.notification(id).map(|n| n.status)
    }

    /// Finished notifications, oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history.entries()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            channel: self.channel.channel_type().to_string(),
            queued: self.queue.len(),
            scheduled_retries: self.scheduled.len(),
            sent: self.history.sent_total(),
            failed: self.history.failed_total(),
            gated: self.gated.load(Ordering::Relaxed),
            enabled_types: self.gate.settings().enabled_types(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::notification::channels::{Ack, Message};
    use crate::notification::diagnostics::MemorySink;
    use crate::notification::gate::NotificationSettings;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Channel that replays a script of results, then succeeds.
    struct ScriptedChannel {
        configured: bool,
        script: Mutex<VecDeque<std::result::Result<(), ChannelError>>>,
        sends: AtomicUsize,
    }

    impl ScriptedChannel {
        fn new(script: Vec<std::result::Result<(), ChannelError>>) -> Self {
            Self {
                configured: true,
                script: Mutex::new(script.into()),
                sends: AtomicUsize::new(0),
            }
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedChannel {
        fn channel_type(&self) -> &'static str {
            "scripted"
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        fn compose(&self, notification: &Notification, templates: &TemplateSet) -> Message {
            let rendered = templates.render(notification);
            Message::Chat(crate::notification::channels::ChatMessage {
                text: rendered.subject,
                parse_mode: "HTML".to_string(),
            })
        }

        async fn send(&self, _message: &Message) -> std::result::Result<Ack, ChannelError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            match next {
                Some(Err(e)) => Err(e),
                _ => Ok(Ack::new("scripted")),
            }
        }
    }

    fn fast_config(max_attempts: u32) -> DispatcherConfig {
        DispatcherConfig {
            retry: RetryPolicy {
                max_attempts,
                base_delay_ms: 5,
                max_delay_ms: 50,
                use_jitter: false,
            },
            process_interval: Duration::from_millis(20),
            history_capacity: 16,
        }
    }

    fn dispatcher(channel: Arc<ScriptedChannel>, max_attempts: u32) -> Arc<NotificationDispatcher> {
        let gate = Arc::new(NotificationGate::new(NotificationSettings::all_enabled()));
        Arc::new(NotificationDispatcher::new(channel, gate).with_config(fast_config(max_attempts)))
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[test]
    fn test_config_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay(), Duration::from_secs(5));
        assert_eq!(config.process_interval, Duration::from_secs(30));
        assert_eq!(config.history_capacity, 200);
    }

    #[test]
    fn test_config_from_store() {
        let store = MemoryConfigStore::from_pairs([
            ("dispatcher.max_attempts", "5"),
            ("dispatcher.base_retry_delay_ms", "100"),
            ("dispatcher.process_interval_ms", "1000"),
        ]);
        let config = DispatcherConfig::from_store(&store).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.process_interval, Duration::from_secs(1));

        let bad = MemoryConfigStore::from_pairs([("dispatcher.max_attempts", "0")]);
        assert!(DispatcherConfig::from_store(&bad).is_err());
    }

    #[test]
    fn test_config_history_capacity() {
        let store = MemoryConfigStore::from_pairs([("dispatcher.history_capacity", "4096")]);
        assert_eq!(DispatcherConfig::from_store(&store).unwrap().history_capacity, 4096);

        let negative = MemoryConfigStore::from_pairs([("dispatcher.history_capacity", "-1")]);
        assert!(DispatcherConfig::from_store(&negative).is_err());
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn test_config_history_capacity_out_of_range() {
        let store = MemoryConfigStore::from_pairs([("dispatcher.history_capacity", "8589934592")]);
        assert!(DispatcherConfig::from_store(&store).is_err());
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let channel = Arc::new(ScriptedChannel::new(vec![]));
        let dispatcher = dispatcher(channel.clone(), 3);

        let id = dispatcher
            .enqueue(NotificationType::StatusUpdate, Payload::new(), NotificationPriority::Low)
            .unwrap();
        let summary = dispatcher.process_queue().await;

        assert_eq!(summary.sent, 1);
        assert_eq!(channel.sends(), 1);
        assert_eq!(dispatcher.status(id), Some(NotificationStatus::Sent));
        assert_eq!(dispatcher.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_retry_reuses_id_and_counts_attempts() {
        let channel = Arc::new(ScriptedChannel::new(vec![Err(ChannelError::Timeout)]));
        let dispatcher = dispatcher(channel.clone(), 3);

        let id = dispatcher
            .enqueue(NotificationType::BatteryLow, Payload::new(), NotificationPriority::High)
            .unwrap();
        let summary = dispatcher.process_queue().await;
        assert_eq!(summary.rescheduled, 1);
        assert_eq!(dispatcher.scheduled_retries(), 1);
        assert!(dispatcher.next_retry_at(id).is_some());
        assert_eq!(dispatcher.notification(id).map(|n| n.attempts), Some(1));

        assert!(wait_until(|| dispatcher.status(id) == Some(NotificationStatus::Sent)).await);
        let finished = dispatcher.notification(id).unwrap();
        assert_eq!(finished.attempts, 2);
        assert_eq!(channel.sends(), 2);
        assert_eq!(dispatcher.history().len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let channel = Arc::new(ScriptedChannel::new(vec![Err(ChannelError::NotConfigured(
            "bad address".into(),
        ))]));
        let dispatcher = dispatcher(channel.clone(), 3);

        let id = dispatcher
            .enqueue(NotificationType::ErrorAlert, Payload::new(), NotificationPriority::High)
            .unwrap();
        let summary = dispatcher.process_queue().await;

        assert_eq!(summary.failed, 1);
        assert_eq!(channel.sends(), 1);
        assert_eq!(dispatcher.status(id), Some(NotificationStatus::Failed));
        assert_eq!(dispatcher.scheduled_retries(), 0);
    }

    #[tokio::test]
    async fn test_gate_rejection_is_reported() {
        let channel = Arc::new(ScriptedChannel::new(vec![]));
        let sink = Arc::new(MemorySink::new(16));
        let gate = Arc::new(NotificationGate::default());
        let dispatcher = NotificationDispatcher::new(channel, gate).with_diagnostics(sink.clone());

        let result = dispatcher.enqueue(
            NotificationType::PatrolStatus,
            Payload::new(),
            NotificationPriority::Low,
        );
        assert!(matches!(result, Err(Error::GateClosed(NotificationType::PatrolStatus))));
        assert_eq!(dispatcher.queue_len(), 0);
        assert_eq!(dispatcher.stats().gated, 1);
        assert_eq!(sink.count_level(DiagnosticLevel::Info), 1);
    }

    #[tokio::test]
    async fn test_stop_fails_scheduled_retries() {
        let channel = Arc::new(ScriptedChannel::new(vec![Err(ChannelError::Timeout)]));
        let gate = Arc::new(NotificationGate::new(NotificationSettings::all_enabled()));
        let mut config = fast_config(3);
        config.retry.base_delay_ms = 60_000;
        config.retry.max_delay_ms = 60_000;
        let dispatcher = Arc::new(NotificationDispatcher::new(channel.clone(), gate).with_config(config));

        let id = dispatcher
            .enqueue(NotificationType::ConnectionLost, Payload::new(), NotificationPriority::Critical)
            .unwrap();
        dispatcher.process_queue().await;
        assert_eq!(dispatcher.scheduled_retries(), 1);

        dispatcher.stop().await;
        assert_eq!(dispatcher.scheduled_retries(), 0);
        assert_eq!(dispatcher.status(id), Some(NotificationStatus::Failed));
        assert!(dispatcher.start().is_err());
    }

    #[tokio::test]
    async fn test_retry_is_scheduled_with_due_time() {
        let channel = Arc::new(ScriptedChannel::new(vec![Err(ChannelError::Timeout)]));
        let gate = Arc::new(NotificationGate::new(NotificationSettings::all_enabled()));
        let mut config = fast_config(3);
        config.retry.base_delay_ms = 60_000;
        config.retry.max_delay_ms = 60_000;
        let dispatcher = Arc::new(NotificationDispatcher::new(channel, gate).with_config(config));

        let id = dispatcher
            .enqueue(NotificationType::StatusUpdate, Payload::new(), NotificationPriority::Low)
            .unwrap();
        dispatcher.process_queue().await;

        let due_at = dispatcher.next_retry_at(id).unwrap();
        assert!(due_at > Utc::now() + chrono::Duration::seconds(50));
        assert_eq!(dispatcher.status(id), Some(NotificationStatus::Pending));
        assert_eq!(dispatcher.notification(id).unwrap().attempts, 1);
        assert!(!dispatcher.is_idle());

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_worker_delivers_on_enqueue() {
        let channel = Arc::new(ScriptedChannel::new(vec![]));
        let dispatcher = dispatcher(channel.clone(), 3);
        dispatcher.start().unwrap();
        assert!(dispatcher.is_running());

        let id = dispatcher
            .notify(NotificationType::StatusUpdate, Payload::new(), None)
            .unwrap();
        assert!(wait_until(|| dispatcher.status(id) == Some(NotificationStatus::Sent)).await);

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.stats().sent, 1);
    }

    #[test]
    fn test_pass_summary() {
        assert!(PassSummary::skipped().skipped);
        let summary = PassSummary {
            sent: 1,
            failed: 2,
            rescheduled: 3,
            skipped: false,
        };
        assert_eq!(summary.processed(), 6);
    }
}
