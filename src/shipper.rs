//! Public client: enqueue from anywhere, upload on a schedule.
//!
//! [`LogShipper`] owns the buffer, the uploader and the scheduled upload task.
//! Producers call [`LogShipper::log`] synchronously; uploads happen either on
//! the interval started by [`LogShipper::start`] or on demand through
//! [`LogShipper::upload`]. Ticks never overlap: the scheduler skips an interval
//! while a manual upload is still running.
//!
//! # Example
//!
//! ```no_run
//! use cloudwatch_shipper::config::Config;
//! use cloudwatch_shipper::shipper::LogShipper;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let shipper = LogShipper::from_config(&config).expect("Failed to create shipper");
//!     let mut errors = shipper.take_errors().expect("errors taken once");
//!
//!     shipper.start();
//!     shipper.info("service started");
//!
//!     tokio::spawn(async move {
//!         while let Some(err) = errors.recv().await {
//!             eprintln!("delivery problem: {}", err);
//!         }
//!     });
//!
//!     shipper.stop().await.ok();
//! }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, LogsApi};
use crate::breaker::CircuitBreaker;
use crate::buffer::{self, BufferConfig, BufferError, BufferStats, LogBuffer, SharedBuffer};
use crate::client::CloudWatchLogsClient;
use crate::config::Config;
use crate::event::{Level, LogEvent, LogRecord};
use crate::resolver::TargetState;
use crate::token_store::{FileTokenStore, TokenStore};
use crate::uploader::{
    ErrorReporter, RetryPolicy, TickOutcome, UploadError, Uploader, UploaderStats,
    ERROR_CHANNEL_CAPACITY,
};

/// Combined buffer and uploader statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipperStats {
    pub buffer: BufferStats,
    pub uploader: UploaderStats,
}

struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Buffered, scheduled log delivery to one CloudWatch Logs stream.
pub struct LogShipper {
    buffer: SharedBuffer,
    uploader: Arc<AsyncMutex<Uploader>>,
    breaker: CircuitBreaker,
    reporter: ErrorReporter,
    errors: Mutex<Option<mpsc::Receiver<UploadError>>>,
    upload_interval: Duration,
    task: Mutex<Option<ScheduledTask>>,
}

impl LogShipper {
    /// Create a shipper that talks to `api` and persists tokens in `store`.
    ///
    /// Nothing runs in the background until [`LogShipper::start`] is called.
    pub fn new(config: &Config, api: Arc<dyn LogsApi>, store: Arc<dyn TokenStore>) -> Self {
        let buffer = LogBuffer::new(BufferConfig::new(
            config.buffer_capacity,
            config.overflow_policy,
        ))
        .shared();
        let breaker = CircuitBreaker::new();
        let (reporter, errors) = ErrorReporter::channel(ERROR_CHANNEL_CAPACITY);

        let uploader = Uploader::new(
            api,
            buffer.clone(),
            store,
            &config.log_group,
            &config.log_stream,
        )
        .with_retry_policy(RetryPolicy::new(config.max_conflict_retries))
        .with_breaker(breaker.clone())
        .with_reporter(reporter.clone());

        Self {
            buffer,
            uploader: Arc::new(AsyncMutex::new(uploader)),
            breaker,
            reporter,
            errors: Mutex::new(Some(errors)),
            upload_interval: config.upload_interval,
            task: Mutex::new(None),
        }
    }

    /// Create a shipper backed by the HTTPS client and the file token store.
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        let api = Arc::new(CloudWatchLogsClient::new(config)?);
        let store = Arc::new(FileTokenStore::new(config.token_store_path.clone()));
        Ok(Self::new(config, api, store))
    }

    /// Queue an event for delivery. Never blocks on the network.
    ///
    /// Under the reject overflow policy a full buffer drops the event; use
    /// [`LogShipper::try_log`] to observe that.
    pub fn log(&self, event: LogEvent) {
        if let Err(e) = self.try_log(event) {
            debug!(error = %e, "Log event refused");
        }
    }

    /// Queue an event, reporting a full buffer under the reject policy.
    pub fn try_log(&self, event: LogEvent) -> Result<(), BufferError> {
        buffer::lock(&self.buffer).enqueue(event)
    }

    /// Queue a plain message stamped now.
    pub fn log_message(&self, message: impl Into<String>) {
        self.log(LogEvent::new(message));
    }

    /// Serialize `data` as JSON and queue it.
    pub fn log_json<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), serde_json::Error> {
        self.log(LogEvent::from_json(data)?);
        Ok(())
    }

    /// Queue a structured record.
    pub fn log_record(&self, record: &LogRecord) {
        match record.to_event() {
            Ok(event) => self.log(event),
            Err(e) => warn!(error = %e, "Failed to serialize log record"),
        }
    }

    pub fn critical(&self, message: impl Into<String>) {
        self.log_record(&LogRecord::new(Level::Critical, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log_record(&LogRecord::new(Level::Error, message));
    }

    pub fn security(&self, message: impl Into<String>) {
        self.log_record(&LogRecord::new(Level::Security, message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log_record(&LogRecord::new(Level::Warning, message));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log_record(&LogRecord::new(Level::Info, message));
    }

    /// Run one upload tick now, waiting for any tick already in flight.
    ///
    /// Resolves once the events queued at call time (up to one batch) have
    /// been accepted, rejected, or failed.
    pub async fn upload(&self) -> Result<TickOutcome, UploadError> {
        self.uploader.lock().await.tick().await
    }

    /// Start the scheduled upload task. Returns `false` if it is already
    /// running or delivery has been disabled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        if self.breaker.is_tripped() {
            return false;
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_schedule(
            self.uploader.clone(),
            self.reporter.clone(),
            self.upload_interval,
            cancel.clone(),
        ));
        *task = Some(ScheduledTask { cancel, handle });

        info!(
            interval_ms = self.upload_interval.as_millis() as u64,
            "Scheduled uploads started"
        );
        true
    }

    /// Stop the scheduled task and flush once more.
    pub async fn stop(&self) -> Result<TickOutcome, UploadError> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Scheduled upload task panicked");
            }
            info!("Scheduled uploads stopped");
        }

        self.upload().await
    }

    /// Whether the scheduled task is currently running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Take the receiving end of the error channel. Returns `None` after the
    /// first call.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<UploadError>> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether delivery has been permanently disabled.
    pub fn is_disabled(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub async fn state(&self) -> TargetState {
        self.uploader.lock().await.state()
    }

    /// Number of events waiting for delivery.
    pub fn pending(&self) -> usize {
        buffer::lock(&self.buffer).len()
    }

    /// Copy of the events waiting for delivery.
    pub fn pending_events(&self) -> Vec<LogEvent> {
        buffer::lock(&self.buffer).snapshot()
    }

    pub async fn stats(&self) -> ShipperStats {
        let uploader = self.uploader.lock().await.stats().clone();
        ShipperStats {
            buffer: buffer::lock(&self.buffer).stats().clone(),
            uploader,
        }
    }
}

impl Drop for LogShipper {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
        }
    }
}

/// Scheduled upload loop.
///
/// Ends when cancelled or once a tick reports the target disabled. Tick
/// failures go to the error channel instead of ending the loop.
async fn run_schedule(
    uploader: Arc<AsyncMutex<Uploader>>,
    reporter: ErrorReporter,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let Ok(mut guard) = uploader.try_lock() else {
                    debug!("Upload still in flight, skipping tick");
                    continue;
                };

                match guard.tick().await {
                    Ok(TickOutcome::Disabled) => {
                        info!("Delivery disabled, stopping scheduled uploads");
                        break;
                    }
                    Ok(outcome) => debug!(outcome = ?outcome, "Upload tick complete"),
                    Err(e) => reporter.report(e),
                }
            }
        }
    }
}
