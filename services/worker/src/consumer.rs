//! Consumer loop.
//!
//! Each cycle reserves limiter capacity first, then claims exactly that many
//! entries (new ones, or on a sweep, entries idle past the visibility
//! timeout) and spawns one task per entry. A task owns its slot until the
//! entry is resolved:
//!
//! ```text
//! CLAIMED -> admission (defer/retry) -> PROCESSING -> SUCCESS        -> ack
//!                                                  -> RETRY          -> append(attempt+1), ack
//!                                                  -> DEAD_LETTERED  -> append(dlq), ack
//! ```
//!
//! Log failures never consume attempt budget: the loop backs off and an
//! unacknowledged entry is eventually reclaimed at the same attempt.

use crate::admission::{Admission, AdmissionGate};
use crate::config::Config;
use crate::job::{JobContext, JOB_MANIFEST};
use crate::limiter::{ConcurrencyLimiter, LimiterError, Slot};
use crate::metrics::{ProcessingGuard, WorkerMetrics};
use crate::pipeline::{PipelineAdapter, PipelineRequest};
use crate::publisher::ArtifactPublisher;
use crate::retry::{dead_letter_fields, AttemptError, DeadLetterCause, RetryDecision, RetryPolicy};
use crate::stream_log::{LogError, StreamLog, StreamTarget};
use crate::work_item::{ClaimedEntry, WorkItem};
use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Errors that end the consumer loop
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to set up consumer group: {0}")]
    GroupSetup(#[source] LogError),

    #[error("concurrency limiter unavailable: {0}")]
    Limiter(#[from] LimiterError),
}

/// Loop tuning, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Upper bound on entries claimed per cycle
    pub batch_count: usize,
    /// How long a claim waits for new entries
    pub block: Duration,
    /// Idle time after which a pending entry is reclaimed
    pub visibility_timeout: Duration,
    /// Interval between reclaim sweeps
    pub reclaim_interval: Duration,
    /// Deadline covering pipeline and upload
    pub attempt_timeout: Duration,
    /// Wait between admission checks of a deferred entry
    pub admission_backoff: Duration,
    /// Root of per-attempt workspaces
    pub scratch_dir: PathBuf,
    pub retry: RetryPolicy,
    /// First delay after a log failure
    pub infra_backoff_initial: Duration,
    /// Longest delay after repeated log failures
    pub infra_backoff_max: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_count: config.redis.batch_count,
            block: config.block_duration(),
            visibility_timeout: config.visibility_timeout(),
            reclaim_interval: config.reclaim_interval(),
            attempt_timeout: config.attempt_timeout(),
            admission_backoff: config.admission_backoff(),
            scratch_dir: config.worker.scratch_dir.clone(),
            retry: RetryPolicy::new(config.redis.max_retry, config.retry_delay()),
            infra_backoff_initial: Duration::from_millis(500),
            infra_backoff_max: Duration::from_secs(30),
        }
    }

    fn infra_backoff(&self, max_elapsed_time: Option<Duration>) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.infra_backoff_initial,
            max_interval: self.infra_backoff_max,
            max_elapsed_time,
            ..Default::default()
        }
    }
}

/// How a task finished with its entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Succeeded,
    Retried,
    DeadLettered,
    /// Left unacknowledged for reclaim
    Released,
}

/// Why a held entry was let go before it was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupted {
    Shutdown,
    /// The entry left this consumer's pending list
    Lost,
}

/// Keeps a held entry's idle time below the visibility timeout so no other
/// consumer reclaims it while it waits here
struct Lease<'a> {
    log: &'a dyn StreamLog,
    entry_id: &'a str,
    every: Duration,
    renewed_at: Instant,
}

impl<'a> Lease<'a> {
    fn new(log: &'a dyn StreamLog, entry_id: &'a str, visibility_timeout: Duration) -> Self {
        Self {
            log,
            entry_id,
            every: visibility_timeout / 3,
            renewed_at: Instant::now(),
        }
    }

    async fn renew_if_due(&mut self) -> Result<(), Interrupted> {
        if self.renewed_at.elapsed() < self.every {
            return Ok(());
        }
        match self.log.touch(self.entry_id).await {
            Ok(true) => {
                self.renewed_at = Instant::now();
                Ok(())
            }
            Ok(false) => Err(Interrupted::Lost),
            Err(e) => {
                // Retried at the next renewal
                warn!(error = %e, "Failed to renew entry lease");
                Ok(())
            }
        }
    }

    /// Wait for `total`, renewing along the way
    async fn hold(&mut self, total: Duration, shutdown: &CancellationToken) -> Result<(), Interrupted> {
        let until = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            let step = (until - now).min(self.every.max(Duration::from_millis(1)));
            tokio::select! {
                _ = shutdown.cancelled() => return Err(Interrupted::Shutdown),
                _ = tokio::time::sleep(step) => {}
            }
            self.renew_if_due().await?;
        }
    }
}

/// Drives one claimed entry to a terminal state
pub struct EntryProcessor {
    log: Arc<dyn StreamLog>,
    gate: AdmissionGate,
    pipeline: Arc<dyn PipelineAdapter>,
    publisher: Arc<dyn ArtifactPublisher>,
    metrics: Arc<WorkerMetrics>,
    settings: ConsumerSettings,
}

impl EntryProcessor {
    #[instrument(skip_all, fields(entry_id = %entry.entry_id, source = ?entry.source))]
    async fn handle(&self, entry: ClaimedEntry, shutdown: CancellationToken) {
        let resolution = self.resolve(&entry, &shutdown).await;
        debug!(?resolution, "Entry resolved");
        self.metrics.pending_resolved();
    }

    async fn resolve(&self, entry: &ClaimedEntry, shutdown: &CancellationToken) -> Resolution {
        let item = match entry.work_item() {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "Malformed entry");
                return self.dead_letter(entry, DeadLetterCause::Malformed(e)).await;
            }
        };

        let policy = self.settings.retry;
        if !policy.admits(item.attempt) {
            let cause = DeadLetterCause::OverBudget {
                attempt: item.attempt,
                max_retry: policy.max_retry,
            };
            return self.dead_letter(entry, cause).await;
        }

        let mut lease = Lease::new(self.log.as_ref(), &entry.entry_id, self.settings.visibility_timeout);
        if let Err(why) = self.wait_for_admission(&item, &mut lease, shutdown).await {
            info!(source_id = %item.source_id, reason = ?why, "Released while deferred");
            return Resolution::Released;
        }

        let result = {
            let _processing = ProcessingGuard::new(&self.metrics);
            self.attempt(entry, &item).await
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.log.ack(&entry.entry_id).await {
                    // Work is done; a reclaim replays it under the same job id
                    warn!(error = %e, "Failed to acknowledge processed entry");
                }
                self.metrics.record_processed();
                Resolution::Succeeded
            }
            Err(e) => {
                self.metrics.record_failed(e.kind());
                match policy.decide(item.attempt) {
                    RetryDecision::Retry { next_attempt, delay } => {
                        warn!(
                            source_id = %item.source_id,
                            attempt = item.attempt,
                            next_attempt,
                            error = %e,
                            "Attempt failed, re-enqueueing"
                        );
                        self.retry(entry, &item, &e, delay, &mut lease, shutdown).await
                    }
                    RetryDecision::DeadLetter => {
                        error!(
                            source_id = %item.source_id,
                            attempt = item.attempt,
                            error = %e,
                            "Retry budget exhausted"
                        );
                        self.dead_letter(entry, DeadLetterCause::Exhausted(e)).await
                    }
                }
            }
        }
    }

    async fn wait_for_admission(
        &self,
        item: &WorkItem,
        lease: &mut Lease<'_>,
        shutdown: &CancellationToken,
    ) -> Result<(), Interrupted> {
        loop {
            match self.gate.admit(item).await {
                Admission::Allow => return Ok(()),
                Admission::Defer { reason } => {
                    self.metrics.record_deferred();
                    debug!(%reason, "Admission deferred");
                    lease.hold(self.settings.admission_backoff, shutdown).await?;
                }
            }
        }
    }

    async fn attempt(&self, entry: &ClaimedEntry, item: &WorkItem) -> Result<(), AttemptError> {
        let ctx = JobContext::create(&self.settings.scratch_dir, &entry.entry_id, item)
            .await
            .map_err(|e| AttemptError::Analysis(format!("failed to create workspace: {e}")))?;

        let deadline = self.settings.attempt_timeout;
        let result = match tokio::time::timeout(deadline, self.run_and_publish(&ctx, item)).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::Timeout(deadline)),
        };

        ctx.cleanup().await;
        result
    }

    #[instrument(skip_all, fields(job_id = %ctx.job_id, attempt = ctx.attempt))]
    async fn run_and_publish(&self, ctx: &JobContext, item: &WorkItem) -> Result<(), AttemptError> {
        let request = PipelineRequest {
            source_id: item.source_id.clone(),
            media_ref: item.media_ref.clone(),
            duration_seconds: item.duration_seconds,
            attempt: item.attempt,
            workspace: ctx.workspace.clone(),
        };
        let output = self.pipeline.run(&request).await?;

        let mut artifacts = output.artifacts;
        artifacts.retain(|a| a.name != JOB_MANIFEST);
        let manifest = ctx
            .write_manifest(item, &artifacts, &output.metadata)
            .await
            .map_err(|e| AttemptError::Analysis(format!("failed to write job manifest: {e}")))?;
        artifacts.push(manifest);

        let report = self.publisher.publish(ctx, &artifacts).await;
        let failures = report.failures();
        if let Some(first) = failures.first() {
            return Err(AttemptError::Upload {
                failed: failures.len(),
                total: artifacts.len(),
                detail: first.to_string(),
            });
        }

        info!(
            source_id = %item.source_id,
            artifacts = artifacts.len(),
            detections = output.metadata.detections,
            elapsed_ms = output.metadata.elapsed_ms,
            "Job published"
        );
        Ok(())
    }

    /// Append the next attempt, then acknowledge the original
    async fn retry(
        &self,
        entry: &ClaimedEntry,
        item: &WorkItem,
        error: &AttemptError,
        delay: Duration,
        lease: &mut Lease<'_>,
        shutdown: &CancellationToken,
    ) -> Resolution {
        if let Err(why) = lease.hold(delay, shutdown).await {
            info!(reason = ?why, "Retry delay interrupted, leaving entry for reclaim");
            return Resolution::Released;
        }

        let fields = self.settings.retry.retry_fields(item, error);
        match self.log.append(StreamTarget::Work, &fields).await {
            Ok(new_id) => {
                debug!(new_entry_id = %new_id, "Re-enqueued");
                if let Err(e) = self.log.ack(&entry.entry_id).await {
                    warn!(error = %e, "Failed to acknowledge retried entry");
                }
                self.metrics.record_retried();
                Resolution::Retried
            }
            Err(e) => {
                error!(error = %e, "Failed to re-enqueue, leaving entry for reclaim");
                Resolution::Released
            }
        }
    }

    async fn dead_letter(&self, entry: &ClaimedEntry, cause: DeadLetterCause) -> Resolution {
        let fields = dead_letter_fields(&entry.fields, &entry.entry_id, &cause);
        match self.log.append(StreamTarget::DeadLetter, &fields).await {
            Ok(dlq_id) => {
                warn!(
                    dlq_entry_id = %dlq_id,
                    kind = cause.kind(),
                    reason = %cause.reason(),
                    "Entry dead-lettered"
                );
                if let Err(e) = self.log.ack(&entry.entry_id).await {
                    warn!(error = %e, "Failed to acknowledge dead-lettered entry");
                }
                self.metrics.record_dead_lettered(cause.kind());
                Resolution::DeadLettered
            }
            Err(e) => {
                error!(error = %e, "Failed to dead-letter, leaving entry for reclaim");
                Resolution::Released
            }
        }
    }
}

/// Removes an entry id from the in-flight set when its task ends
struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
    entry_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.ids.lock().remove(&self.entry_id);
    }
}

/// Claims entries and runs them under the concurrency limiter
pub struct StreamConsumer {
    log: Arc<dyn StreamLog>,
    limiter: Arc<ConcurrencyLimiter>,
    processor: Arc<EntryProcessor>,
    metrics: Arc<WorkerMetrics>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
    settings: ConsumerSettings,
}

impl StreamConsumer {
    pub fn new(
        log: Arc<dyn StreamLog>,
        limiter: Arc<ConcurrencyLimiter>,
        gate: AdmissionGate,
        pipeline: Arc<dyn PipelineAdapter>,
        publisher: Arc<dyn ArtifactPublisher>,
        metrics: Arc<WorkerMetrics>,
        settings: ConsumerSettings,
    ) -> Self {
        let processor = Arc::new(EntryProcessor {
            log: log.clone(),
            gate,
            pipeline,
            publisher,
            metrics: metrics.clone(),
            settings: settings.clone(),
        });

        Self {
            log,
            limiter,
            processor,
            metrics,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            settings,
        }
    }

    /// Run until `shutdown` fires, then wait for in-flight entries
    #[instrument(skip_all, fields(consumer = %self.log.consumer_name()))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        if !self.ensure_group(&shutdown).await? {
            return Ok(());
        }
        info!(ceiling = self.limiter.ceiling(), "Consumer loop started");
        self.metrics.record_limit(self.limiter.ceiling());

        let mut backoff = self.settings.infra_backoff(None);
        let mut next_sweep = Instant::now();

        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                slot = self.limiter.acquire() => slot?,
            };
            let mut slots = vec![first];
            while slots.len() < self.settings.batch_count {
                match self.limiter.try_acquire() {
                    Some(slot) => slots.push(slot),
                    None => break,
                }
            }

            let sweep = Instant::now() >= next_sweep;
            if sweep {
                next_sweep = Instant::now() + self.settings.reclaim_interval;
            }
            let request = async {
                if sweep {
                    self.log.reclaim(self.settings.visibility_timeout, slots.len()).await
                } else {
                    self.log.claim(slots.len(), self.settings.block).await
                }
            };
            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                claimed = request => claimed,
            };

            match claimed {
                Ok(entries) => {
                    backoff.reset();
                    if shutdown.is_cancelled() {
                        // Delivered but never started; they stay pending for reclaim
                        info!(count = entries.len(), "Shutdown during claim, leaving entries unprocessed");
                        break;
                    }
                    self.dispatch(entries, slots, &shutdown);
                }
                Err(e) => {
                    drop(slots);
                    let delay = backoff.next_backoff().unwrap_or(self.settings.infra_backoff_max);
                    metrics::counter!("worker.log.errors").increment(1);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Claim failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(in_flight = self.tracker.len(), "Consumer loop stopping, draining in-flight entries");
        self.tracker.close();
        self.tracker.wait().await;
        info!("Consumer drained");
        Ok(())
    }

    /// Entries currently being handled by this process
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Returns false if shutdown arrived first
    async fn ensure_group(&self, shutdown: &CancellationToken) -> Result<bool, ConsumerError> {
        let mut backoff = self.settings.infra_backoff(Some(Duration::from_secs(15 * 60)));
        loop {
            match self.log.ensure_group().await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    let Some(delay) = backoff.next_backoff() else {
                        error!(error = %e, "Giving up on consumer group setup");
                        return Err(ConsumerError::GroupSetup(e));
                    };
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Consumer group setup failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn dispatch(&self, entries: Vec<ClaimedEntry>, mut slots: Vec<Slot>, shutdown: &CancellationToken) {
        for entry in entries {
            if !self.in_flight.lock().insert(entry.entry_id.clone()) {
                debug!(entry_id = %entry.entry_id, "Entry already in flight here, skipping");
                continue;
            }
            let in_flight = InFlight {
                ids: self.in_flight.clone(),
                entry_id: entry.entry_id.clone(),
            };
            let Some(slot) = slots.pop() else {
                // Log returned more than requested; the rest stays pending
                warn!(entry_id = %entry.entry_id, "No slot for claimed entry");
                continue;
            };

            self.metrics.pending_claimed(1);
            let processor = self.processor.clone();
            let shutdown = shutdown.clone();
            self.tracker.spawn(async move {
                let _slot = slot;
                let _in_flight = in_flight;
                processor.handle(entry, shutdown).await;
            });
        }
    }
}
