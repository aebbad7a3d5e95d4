//! FaceStream Processor service
//!
//! Reads posts as JSON lines from stdin, runs them through the stream
//! processor and logs running face statistics.
//!
//! # Architecture
//!
//! ```text
//! stdin (JSON lines) -> BroadcastEventSource -> StreamProcessor -> HttpFaceDetector
//!                                                      |
//!                                                      v
//!                                              RunningStatistics -> periodic report
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with FACESTREAM_)
//!
//! See `config.rs` for detailed configuration options.

use facestream_processor::config::{self, ProcessorConfig};
use facestream_processor::{
    BroadcastEventSource, BroadcastNotifier, HttpFaceDetector, Post, ProcessorSettings,
    RunningStatistics, StreamProcessor,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application state and shared resources.
struct AppState {
    config: ProcessorConfig,
    running: Arc<AtomicBool>,
}

impl AppState {
    fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "facestream-processor",
        version = env!("CARGO_PKG_VERSION"),
        filter = %config.source.filter,
        "Starting stream processor"
    );

    config.validate()?;

    let state = Arc::new(AppState::new(config));
    state.running.store(true, Ordering::SeqCst);

    match run_pipeline(state.clone()).await {
        Ok(()) => {
            info!("Stream processor completed successfully");
        }
        Err(e) => {
            error!(error = %e, "Stream processor failed");
            return Err(e);
        }
    }

    Ok(())
}

/// Load configuration.
fn load_config() -> anyhow::Result<ProcessorConfig> {
    // Try loading from files first, fall back to environment
    let config = ProcessorConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        ProcessorConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("facestream_processor={}", level).parse()?)
        .add_directive("reqwest=info".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    }

    Ok(())
}

/// Run the processing pipeline until Ctrl+C or end of input.
async fn run_pipeline(state: Arc<AppState>) -> anyhow::Result<()> {
    let config = &state.config;

    let source = Arc::new(BroadcastEventSource::new(config.source.channel_capacity));
    let detector = Arc::new(HttpFaceDetector::new(&config.enrichment)?);
    let notifier = BroadcastNotifier::default();

    info!(endpoint = %detector.detect_url(), "Face detection client ready");

    let processor = StreamProcessor::new(
        source.clone(),
        detector,
        ProcessorSettings::from(config),
    )
    .with_observer(Arc::new(notifier.clone()));

    processor.start(&config.source.filter).await?;

    // Spawn the stdin reader feeding the event source
    let reader_handle = tokio::spawn({
        let source = source.clone();
        let state = state.clone();
        async move {
            read_posts(source, state).await;
            info!("Input stream ended");
        }
    });

    // Spawn the notification listener
    let listener_handle = tokio::spawn({
        let mut notifications = notifier.subscribe();
        async move {
            while let Ok(notification) = notifications.recv().await {
                debug!(
                    criterion = %notification.criterion,
                    change = ?notification.change,
                    "Statistics changed"
                );
            }
        }
    });

    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received shutdown signal");
    };

    let mut ticker = tokio::time::interval(config.reporting.interval());
    ticker.tick().await;

    tokio::pin!(shutdown_signal);
    tokio::pin!(reader_handle);

    let input_ended = loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Initiating graceful shutdown...");
                break false;
            }
            _ = &mut reader_handle => {
                break true;
            }
            _ = ticker.tick() => {
                report_statistics(&processor).await;
            }
        }
    };

    state.shutdown();
    source.close();

    if input_ended {
        // Count and analyse everything already read before reporting
        let active = processor.statistics().await;
        processor.drain().await;
        if let Some(statistics) = active {
            log_snapshot(&statistics);
        }
    } else {
        reader_handle.abort();
        report_statistics(&processor).await;
        processor.stop().await;
    }

    listener_handle.abort();
    log_final_stats(&processor, &source);

    info!("Shutdown complete");
    Ok(())
}

/// Read JSON-lines posts from stdin and publish them.
async fn read_posts(source: Arc<BroadcastEventSource>, state: Arc<AppState>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while state.is_running() {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Post>(&line) {
                    Ok(post) => {
                        source.publish(post).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed post");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read input");
                break;
            }
        }
    }
}

/// Log the active session's statistics.
async fn report_statistics(processor: &StreamProcessor) {
    if let Some(statistics) = processor.statistics().await {
        log_snapshot(&statistics);
    }
}

fn log_snapshot(statistics: &RunningStatistics) {
    let snapshot = statistics.snapshot();
    info!(
        criterion = %snapshot.criterion,
        events = snapshot.event_count,
        events_per_hour = format!("{:.2}", snapshot.events_per_hour),
        male_faces_per_hour = format!("{:.2}", snapshot.male_faces_per_hour),
        female_faces_per_hour = format!("{:.2}", snapshot.female_faces_per_hour),
        recent_results = snapshot.results.len(),
        "Session statistics"
    );
}

/// Log final statistics on shutdown.
fn log_final_stats(processor: &StreamProcessor, source: &BroadcastEventSource) {
    info!("=== Final Statistics ===");

    let source_stats = source.stats();
    info!(
        posts_published = source_stats.posts_published,
        posts_delivered = source_stats.posts_delivered,
        subscriptions = source_stats.subscriptions_opened,
        "Event source final stats"
    );

    let stats = processor.stats();
    info!(
        sessions = stats.sessions_started,
        dispatched = stats.enrichments_dispatched,
        shed = stats.enrichments_shed,
        succeeded = stats.enrichments_succeeded,
        failed = stats.enrichments_failed,
        rejected = stats.results_rejected,
        "Processor final stats"
    );
}
