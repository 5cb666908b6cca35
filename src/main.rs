//! CloudWatch Shipper - forwards stdin lines to a CloudWatch Logs stream
//!
//! Every line read from standard input becomes one log event. Events are
//! buffered locally and uploaded on a fixed interval; on EOF or Ctrl+C the
//! remaining events are flushed before exit.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `AWS_REGION`, `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: temporary credentials (optional)
//! - `CLOUDWATCH_LOG_GROUP`, `CLOUDWATCH_LOG_STREAM`: delivery target (required)
//! - `CLOUDWATCH_ENDPOINT`: override the regional endpoint
//! - `CLOUDWATCH_UPLOAD_INTERVAL_MS`: milliseconds between uploads (default: 2000)
//! - `CLOUDWATCH_BUFFER_CAPACITY`: max buffered events (default: 10000)
//! - `CLOUDWATCH_OVERFLOW_POLICY`: `drop-oldest` or `reject` (default: drop-oldest)
//! - `CLOUDWATCH_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
//! - `CLOUDWATCH_MAX_RETRIES`: transport retry attempts (default: 3)
//! - `CLOUDWATCH_MAX_CONFLICT_RETRIES`: sequence token resends (default: 5)
//! - `CLOUDWATCH_TOKEN_STORE`: sequence token file path
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudwatch_shipper::config::Config;
use cloudwatch_shipper::event::LogEvent;
use cloudwatch_shipper::shipper::LogShipper;

/// Upper bound on the final flush at shutdown
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// How often to report forwarding progress
const PROGRESS_REPORT_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting CloudWatch Shipper...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                region = %config.region,
                log_group = %config.log_group,
                log_stream = %config.log_stream,
                upload_interval_ms = config.upload_interval.as_millis() as u64,
                buffer_capacity = config.buffer_capacity,
                overflow_policy = %config.overflow_policy,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let shipper = match LogShipper::from_config(&config) {
        Ok(shipper) => {
            info!(
                endpoint = %config.endpoint,
                token_store = %config.token_store_path.display(),
                "Shipper initialized"
            );
            shipper
        }
        Err(e) => {
            error!(error = %e, "Failed to create shipper");
            std::process::exit(1);
        }
    };

    // Drain delivery errors so the reporting channel never fills up
    if let Some(mut errors) = shipper.take_errors() {
        tokio::spawn(async move {
            while let Some(err) = errors.recv().await {
                warn!(error = %err, "Delivery error reported");
            }
        });
    }

    shipper.start();

    info!("Forwarding stdin. Press Ctrl+C to stop.");
    tokio::select! {
        lines = forward_lines(BufReader::new(tokio::io::stdin()), &shipper) => {
            info!(lines = lines, "Input closed, stopping...");
        }
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    match tokio::time::timeout(shutdown_timeout, shipper.stop()).await {
        Ok(Ok(outcome)) => {
            info!(outcome = ?outcome, pending = shipper.pending(), "Final upload complete");
        }
        Ok(Err(e)) => {
            warn!(error = %e, pending = shipper.pending(), "Final upload failed");
        }
        Err(_) => {
            warn!("Final upload timed out after {:?}", shutdown_timeout);
        }
    }

    let stats = shipper.stats().await;
    info!(
        received = stats.buffer.events_received,
        delivered = stats.buffer.events_delivered,
        dropped = stats.buffer.events_dropped,
        send_attempts = stats.uploader.send_attempts,
        token_conflicts = stats.uploader.token_conflicts,
        "CloudWatch Shipper stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Output goes to stderr so it never mixes with piped input.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Queue each non-empty input line as one log event until EOF.
///
/// Returns the number of lines forwarded.
async fn forward_lines<R>(reader: R, shipper: &LogShipper) -> u64
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded: u64 = 0;
    let mut last_report_time = std::time::Instant::now();
    let report_interval = Duration::from_secs(PROGRESS_REPORT_SECS);

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                shipper.log(LogEvent::new(line));
                forwarded += 1;

                // Periodic progress report
                if last_report_time.elapsed() >= report_interval {
                    info!(
                        lines_forwarded = forwarded,
                        pending = shipper.pending(),
                        "Forwarding progress"
                    );
                    last_report_time = std::time::Instant::now();
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read input");
                break;
            }
        }
    }

    forwarded
}
