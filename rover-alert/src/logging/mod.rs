//! Logging setup with a reloadable filter.
//!
//! This module provides:
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - Optional daily-rotated log files with retention cleanup
//! - Local timezone timestamps for logs

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::config::{ConfigStore, ConfigStoreExt, ConfigUpdateEvent};

/// Store key holding the filter directive.
pub const LOG_FILTER_KEY: &str = "logging.filter";

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "rover_alert=info,lettre=warn,reqwest=warn";

/// File name prefix of rotated log files.
const LOG_FILE_PREFIX: &str = "rover-alert.log";

/// Default log retention period in days.
const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Logging options read from `logging.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Filter directive. `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Directory for rotated log files; console only when absent.
    pub log_dir: Option<PathBuf>,
    /// Colour console output.
    pub ansi: bool,
    /// Days to keep rotated log files.
    pub retention_days: i64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
            ansi: true,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl LoggingSettings {
    pub fn from_store(store: &dyn ConfigStore) -> crate::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            filter: store.get_string(LOG_FILTER_KEY).unwrap_or(defaults.filter),
            log_dir: store.get_string("logging.dir").map(PathBuf::from),
            ansi: store.get_bool("logging.ansi")?.unwrap_or(defaults.ansi),
            retention_days: store
                .get_u32("logging.retention_days")?
                .map(i64::from)
                .unwrap_or(defaults.retention_days),
        })
    }
}

/// Handle to the installed subscriber. Keep it alive for the app lifetime.
pub struct LoggingHandle {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
    retention_days: i64,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Set a new filter directive.
    ///
    /// # Arguments
    /// * `directive` - Filter string (e.g., "rover_alert=debug,lettre=warn")
    ///
    /// # Returns
    /// Error if the directive is invalid.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::logging(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| crate::Error::logging(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    /// Get the log directory path, if file logging is enabled.
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Apply the store's `logging.filter`, or the default when it is unset.
    fn reload_from(&self, store: &dyn ConfigStore) {
        let directive = store
            .get_string(LOG_FILTER_KEY)
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let previous = self.get_filter();
        if previous == directive {
            return;
        }
        match self.set_filter(&directive) {
            Ok(()) => debug!(from = %previous, to = %directive, "Log filter reloaded from config"),
            Err(e) => warn!("Keeping log filter {}: {}", previous, e),
        }
    }

    /// Reload the filter whenever `logging.filter` changes in the store.
    pub fn spawn_filter_watcher(
        self: &Arc<Self>,
        store: Arc<dyn ConfigStore>,
        mut rx: broadcast::Receiver<ConfigUpdateEvent>,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let logging = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Log filter watcher shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(event) if event.affects_prefix(LOG_FILTER_KEY) => {
                                logging.reload_from(store.as_ref());
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {
                                logging.reload_from(store.as_ref());
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    /// Start the log retention cleanup task.
    ///
    /// Runs daily and deletes rotated log files past the retention period.
    /// Does nothing when file logging is disabled.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60); // Daily

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {
                        if let Err(e) = cleanup_old_logs(&log_dir, retention_days).await {
                            warn!(error = %e, "Failed to cleanup old logs");
                        }
                    }
                }
            }
        });
    }
}

/// Delete log files older than the specified number of days.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    let cutoff_date = cutoff.date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        // rover-alert.log.YYYY-MM-DD
        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff_date {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete old log file");
            } else {
                deleted_count += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Initialize logging with a reloadable filter.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(settings: &LoggingSettings) -> crate::Result<Arc<LoggingHandle>> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            // stdout carries the diagnostics stream.
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(settings.ansi)
                .with_timer(LocalTimer),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::logging(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(Arc::new(LoggingHandle {
        handle: filter_handle,
        log_dir: settings.log_dir.clone(),
        retention_days: settings.retention_days,
        _guard: guard,
    }))
}
