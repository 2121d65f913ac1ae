use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rover_alert::config::{AppConfig, ConfigStore, MemoryConfigStore};
use rover_alert::logging::{self, LoggingSettings};
use rover_alert::notification::channels::build_channel;
use rover_alert::notification::{
    DiagnosticRecord, DiagnosticsSink, DomainEvent, EventAdapter, NotificationDispatcher,
    NotificationGate, TracingSink,
};

/// Capacity of the domain event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(author, version, about = "Deliver rover alerts over email and Telegram", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(env = "ROVER_ALERT_CONFIG")]
    config: Option<PathBuf>,

    /// Send a test message through each configured channel and exit
    #[arg(long)]
    test_channels: bool,

    /// Log filter directive, overrides `logging.filter`
    #[arg(long)]
    log_filter: Option<String>,

    /// Write every delivery diagnostic to stdout as a JSON line
    #[arg(long)]
    diagnostics_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let store = match &args.config {
        Some(path) => MemoryConfigStore::load_json_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => MemoryConfigStore::new(),
    };
    store.apply_env_overrides();
    let store = Arc::new(store);

    let mut logging_settings = LoggingSettings::from_store(store.as_ref())?;
    if let Some(filter) = &args.log_filter {
        logging_settings.filter = filter.clone();
    }
    let logging_handle = logging::init_logging(&logging_settings)?;

    if let Some(dir) = logging_handle.log_dir() {
        info!(dir = %dir.display(), "Writing log files");
    }

    let config = AppConfig::from_store(store.as_ref()).context("Invalid configuration")?;
    if config.declared_channels.is_empty() {
        warn!("No delivery channel is declared, nothing will be sent");
    }
    for kind in config.incomplete_channels() {
        error!(
            channel = %kind,
            "Channel is missing required settings, its notifications will fail"
        );
    }

    if args.test_channels {
        return test_channels(&config, store.as_ref()).await;
    }

    let cancellation_token = CancellationToken::new();
    logging_handle.start_retention_cleanup(cancellation_token.child_token());
    let filter_watcher = if args.log_filter.is_none() {
        Some(logging_handle.spawn_filter_watcher(
            store.clone() as Arc<dyn ConfigStore>,
            store.subscribe(),
            cancellation_token.child_token(),
        ))
    } else {
        None
    };

    let diagnostics = Arc::new(TracingSink::new());
    // Outlives the dispatchers so their shutdown records are written too.
    let diagnostics_token = CancellationToken::new();
    let diagnostics_writer = args
        .diagnostics_json
        .then(|| spawn_diagnostics_writer(&diagnostics, diagnostics_token.clone()));

    let gate = Arc::new(NotificationGate::new(config.notifications.clone()));
    let watcher = gate.spawn_settings_watcher(
        store.clone() as Arc<dyn ConfigStore>,
        store.subscribe(),
        cancellation_token.child_token(),
    );

    let (event_tx, _) = broadcast::channel::<DomainEvent>(EVENT_CHANNEL_CAPACITY);
    let mut dispatchers = Vec::new();
    let mut listeners = Vec::new();

    for &kind in &config.declared_channels {
        let channel = build_channel(kind, store.as_ref())?;
        let dispatcher = Arc::new(
            NotificationDispatcher::new(channel, gate.clone())
                .with_config(config.dispatcher.clone())
                .with_templates(config.templates.clone())
                .with_diagnostics(diagnostics.clone() as Arc<dyn DiagnosticsSink>),
        );
        dispatcher.start()?;

        let adapter = Arc::new(EventAdapter::new(dispatcher.clone()));
        listeners.push(adapter.spawn_listener(event_tx.subscribe(), cancellation_token.child_token()));
        dispatchers.push(dispatcher);
    }

    info!(
        channels = dispatchers.len(),
        enabled = ?gate.settings().enabled_types(),
        "rover-alert started, reading events from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<DomainEvent>(line) {
                            Ok(event) => {
                                if event_tx.send(event).is_err() {
                                    warn!("No dispatcher is listening, event dropped");
                                }
                            }
                            Err(e) => warn!("Ignoring malformed event: {}", e),
                        }
                    }
                    Ok(None) => {
                        info!("End of input, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Listeners drain buffered events and exit once the channel closes.
    drop(event_tx);
    for listener in listeners {
        if let Err(e) = listener.await {
            warn!("Event listener ended abnormally: {}", e);
        }
    }
    cancellation_token.cancel();
    if let Err(e) = watcher.await {
        warn!("Settings watcher ended abnormally: {}", e);
    }
    if let Some(filter_watcher) = filter_watcher {
        if let Err(e) = filter_watcher.await {
            warn!("Log filter watcher ended abnormally: {}", e);
        }
    }

    for dispatcher in dispatchers {
        let summary = dispatcher.stop().await;
        let stats = dispatcher.stats();
        info!(
            channel = %stats.channel,
            sent = stats.sent,
            failed = stats.failed,
            gated = stats.gated,
            final_pass = summary.processed(),
            "Dispatcher finished"
        );
    }

    diagnostics_token.cancel();
    if let Some(writer) = diagnostics_writer {
        if let Err(e) = writer.await {
            warn!("Diagnostics writer ended abnormally: {}", e);
        }
    }

    Ok(())
}

/// Stream diagnostic records to stdout as JSON lines.
fn spawn_diagnostics_writer(
    sink: &TracingSink,
    cancellation_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = sink.subscribe();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            let record: DiagnosticRecord = tokio::select! {
                result = rx.recv() => match result {
                    Ok(record) => record,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Diagnostics writer skipped {} records", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = cancellation_token.cancelled(), if rx.is_empty() => break,
            };
            match serde_json::to_string(&record) {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(e) = stdout.write_all(line.as_bytes()).await {
                        error!("Failed to write diagnostics: {}", e);
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(e) => warn!("Failed to serialize diagnostic record: {}", e),
            }
        }
    })
}

/// Send one test message per declared channel.
async fn test_channels(config: &AppConfig, store: &dyn ConfigStore) -> anyhow::Result<()> {
    if config.declared_channels.is_empty() {
        anyhow::bail!("No delivery channel is declared");
    }

    let mut failures = 0;
    for &kind in &config.declared_channels {
        let channel = build_channel(kind, store)?;
        match channel.test(&config.templates).await {
            Ok(ack) => info!(
                channel = %kind,
                message_id = ack.message_id.as_deref().unwrap_or("-"),
                "Test message delivered"
            ),
            Err(e) => {
                error!(channel = %kind, "Test message failed: {}", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} channel test(s) failed", failures);
    }
    Ok(())
}
