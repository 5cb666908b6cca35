//! The upload tick: resolve the target, send one batch, reconcile the token.
//!
//! A tick walks `Unresolved -> Ready | Disabled` through the
//! [`TargetResolver`], then sends the front of the buffer with the cached
//! sequence token. The service's answer decides what happens to the batch:
//!
//! - accepted: the new token is stored and the batch is acknowledged
//! - partially rejected: the new token is stored and the batch stays queued
//!   for a verbatim resend
//! - token conflict: the expected token is adopted (or the stale one dropped)
//!   and the send is retried with backoff, up to the policy's limit
//! - anything else: returned to the caller as an [`UploadError`]

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, LogsApi, PutLogEventsRequest, PutLogEventsResponse, RejectedLogEventsInfo};
use crate::breaker::CircuitBreaker;
use crate::buffer::{self, Batch, SharedBuffer};
use crate::resolver::{TargetResolver, TargetState};
use crate::token_store::{SequenceTokens, StoreError, TokenStore};

/// Default number of resends after a sequence-token conflict.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

const DEFAULT_CONFLICT_BASE_DELAY_MS: u64 = 100;

const DEFAULT_CONFLICT_MAX_DELAY_MS: u64 = 5_000;

/// Capacity of the error reporting channel.
pub const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Failures of a single upload tick.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The configured log group does not exist; delivery is disabled for good
    #[error("Log group '{group}' does not exist, delivery disabled")]
    TargetUnavailable { group: String },

    #[error("Sequence token conflict persisted after {attempts} attempts: {last_error}")]
    ConflictRetriesExhausted {
        attempts: u32,
        #[source]
        last_error: ApiError,
    },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The target is disabled; nothing was sent
    Disabled,

    /// The buffer was empty
    Idle,

    /// The batch was fully accepted and removed from the buffer
    Delivered { events: usize },

    /// The service refused part of the batch; it stays queued
    Rejected {
        events: usize,
        info: RejectedLogEventsInfo,
    },
}

/// Backoff for resends after sequence-token conflicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resends allowed after the first attempt
    pub max_retries: u32,

    pub base_delay: Duration,

    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONFLICT_RETRIES)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(DEFAULT_CONFLICT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_CONFLICT_MAX_DELAY_MS),
        }
    }

    /// Retry without waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the given retry (1-based): exponential with up to 25% jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if base == 0 || max == 0 {
            return Duration::ZERO;
        }

        let exponential = base.saturating_mul(1 << retry.saturating_sub(1).min(10));
        let jitter = rand::random::<u64>() % (exponential / 4 + 1);

        Duration::from_millis(exponential.saturating_add(jitter).min(max))
    }
}

/// Statistics about upload operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploaderStats {
    /// Total number of `PutLogEvents` calls issued
    pub send_attempts: u64,

    /// Batches fully accepted
    pub batches_delivered: u64,

    /// Batches kept after a partial rejection
    pub batches_rejected: u64,

    /// Sequence-token conflicts encountered
    pub token_conflicts: u64,
}

/// Sending half of the error reporting channel.
///
/// Reports are logged and forwarded; when the channel is full or the
/// receiver is gone they are only logged.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<UploadError>,
}

impl ErrorReporter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<UploadError>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn report(&self, err: UploadError) {
        error!(error = %err, "Upload failed");
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Error channel full, dropping report");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Delivers buffered events to one (group, stream) target.
pub struct Uploader {
    api: Arc<dyn LogsApi>,
    buffer: SharedBuffer,
    resolver: TargetResolver,
    tokens: SequenceTokens,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    reporter: Option<ErrorReporter>,
    stats: UploaderStats,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("resolver", &self.resolver)
            .field("tokens", &self.tokens)
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    pub fn new(
        api: Arc<dyn LogsApi>,
        buffer: SharedBuffer,
        store: Arc<dyn TokenStore>,
        group: &str,
        stream: &str,
    ) -> Self {
        Self {
            api,
            buffer,
            resolver: TargetResolver::new(group, stream),
            tokens: SequenceTokens::new(store, group, stream),
            breaker: CircuitBreaker::new(),
            retry: RetryPolicy::default(),
            reporter: None,
            stats: UploaderStats::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share an existing breaker instead of a private one.
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Publish terminal conditions detected inside a tick.
    pub fn with_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn state(&self) -> TargetState {
        self.resolver.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> &UploaderStats {
        &self.stats
    }

    /// Run one upload tick.
    pub async fn tick(&mut self) -> Result<TickOutcome, UploadError> {
        if self.breaker.is_tripped() {
            return Ok(TickOutcome::Disabled);
        }

        let state = self.resolver.ensure_ready(self.api.as_ref()).await?;
        if state.is_disabled() {
            if self.breaker.trip() {
                if let Some(reporter) = &self.reporter {
                    reporter.report(UploadError::TargetUnavailable {
                        group: self.resolver.group().to_string(),
                    });
                }
            }
            return Ok(TickOutcome::Disabled);
        }

        let batch = {
            let buffer = buffer::lock(&self.buffer);
            buffer.next_batch()
        };
        let Some(batch) = batch else {
            return Ok(TickOutcome::Idle);
        };

        debug!(
            group = %self.resolver.group(),
            stream = %self.resolver.stream(),
            batch_size = batch.len(),
            "Uploading log events"
        );

        let response = self.send_with_conflict_retry(&batch).await?;

        if let Some(token) = response.next_sequence_token.as_deref() {
            // The cache is updated even when persisting fails
            if let Err(e) = self.tokens.set(token).await {
                warn!(error = %e, "Failed to persist sequence token");
            }
        }

        match response.rejected_log_events_info {
            Some(info) => {
                Self::log_rejections(&info);
                buffer::lock(&self.buffer).retain(&batch);
                self.stats.batches_rejected += 1;
                Ok(TickOutcome::Rejected {
                    events: batch.len(),
                    info,
                })
            }
            None => {
                let removed = buffer::lock(&self.buffer).acknowledge(&batch);
                self.stats.batches_delivered += 1;
                info!(
                    group = %self.resolver.group(),
                    stream = %self.resolver.stream(),
                    events = removed,
                    "Delivered log events"
                );
                Ok(TickOutcome::Delivered { events: removed })
            }
        }
    }

    /// Send a batch, resolving sequence-token conflicts by adopting the token
    /// the service expects and resending.
    async fn send_with_conflict_retry(
        &mut self,
        batch: &Batch,
    ) -> Result<PutLogEventsResponse, UploadError> {
        let mut retries = 0;

        loop {
            let request = PutLogEventsRequest {
                log_group_name: self.resolver.group().to_string(),
                log_stream_name: self.resolver.stream().to_string(),
                log_events: batch.events.clone(),
                sequence_token: self.tokens.get().await?,
            };

            self.stats.send_attempts += 1;
            let err = match self.api.put_log_events(&request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_token_conflict() => e,
                Err(e) => return Err(e.into()),
            };

            self.stats.token_conflicts += 1;
            match err.expected_sequence_token() {
                Some(expected) => self.tokens.set(expected).await?,
                None => self.tokens.remove().await?,
            }

            if retries >= self.retry.max_retries {
                return Err(UploadError::ConflictRetriesExhausted {
                    attempts: retries + 1,
                    last_error: err,
                });
            }
            retries += 1;

            let delay = self.retry.delay(retries);
            warn!(
                error = %err,
                retry = retries,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Sequence token conflict, retrying with corrected token"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn log_rejections(info: &RejectedLogEventsInfo) {
        if let Some(index) = info.expired_log_event_end_index {
            error!(index = index, "Log events expired up to index");
        }
        if let Some(index) = info.too_old_log_event_end_index {
            error!(index = index, "Log events too old up to index");
        }
        if let Some(index) = info.too_new_log_event_start_index {
            error!(index = index, "Log events too new from index");
        }
    }
}
