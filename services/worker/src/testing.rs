//! In-memory collaborators for consumer and API tests.

use crate::admission::{ProbeError, ResourceProbe};
use crate::job::JobContext;
use crate::pipeline::{collect_artifacts, AnalysisMetadata, Artifact, PipelineAdapter, PipelineError, PipelineOutput, PipelineRequest};
use crate::publisher::{object_key, ArtifactPublisher, ArtifactUpload, PublishError, PublishReport};
use crate::stream_log::{GroupStatus, LogError, StreamLog, StreamTarget};
use crate::work_item::{ClaimSource, ClaimedEntry};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

const CONSUMER: &str = "test-consumer";

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn field_map(fields: &[(String, String)]) -> BTreeMap<String, String> {
    fields.iter().cloned().collect()
}

struct PendingEntry {
    fields: BTreeMap<String, String>,
    consumer: String,
    /// `None` for entries whose consumer went away long ago
    delivered_at: Option<Instant>,
}

#[derive(Default)]
struct LogState {
    next_seq: u64,
    group_exists: bool,
    group_creations: usize,
    claim_calls: usize,
    touches: usize,
    backlog: VecDeque<(String, BTreeMap<String, String>)>,
    pending: BTreeMap<String, PendingEntry>,
    work_history: Vec<BTreeMap<String, String>>,
    dead_letters: Vec<BTreeMap<String, String>>,
    acked: Vec<String>,
}

/// Consumer-group log with the delivery semantics of a Redis stream
pub struct MemoryLog {
    state: Mutex<LogState>,
    appended: Notify,
    failing_claims: AtomicUsize,
    failing_work_appends: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            appended: Notify::new(),
            failing_claims: AtomicUsize::new(0),
            failing_work_appends: AtomicBool::new(false),
        }
    }

    fn append_work(&self, fields: BTreeMap<String, String>) -> String {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.work_history.push(fields.clone());
        state.backlog.push_back((id.clone(), fields));
        drop(state);
        self.appended.notify_waiters();
        id
    }

    /// Producer-side append
    pub fn push(&self, fields: Vec<(String, String)>) -> String {
        self.append_work(field_map(&fields))
    }

    /// Deliver up to `count` backlog entries to a consumer that then dies
    pub fn simulate_crash_claim(&self, count: usize) -> Vec<String> {
        let mut state = self.state.lock();
        let mut ids = Vec::new();
        for _ in 0..count {
            let Some((id, fields)) = state.backlog.pop_front() else {
                break;
            };
            state.pending.insert(
                id.clone(),
                PendingEntry {
                    fields,
                    consumer: "crashed-consumer".to_string(),
                    delivered_at: None,
                },
            );
            ids.push(id);
        }
        ids
    }

    /// The consumer holding `entry_id` dies without acknowledging it
    pub fn abandon(&self, entry_id: &str) {
        if let Some(pending) = self.state.lock().pending.get_mut(entry_id) {
            pending.consumer = "crashed-consumer".to_string();
            pending.delivered_at = None;
        }
    }

    pub fn fail_next_claims(&self, count: usize) {
        self.failing_claims.store(count, Ordering::SeqCst);
    }

    pub fn fail_work_appends(&self, fail: bool) {
        self.failing_work_appends.store(fail, Ordering::SeqCst);
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    pub fn dead_letters(&self) -> Vec<BTreeMap<String, String>> {
        self.state.lock().dead_letters.clone()
    }

    /// Every entry ever appended to the work stream, in order
    pub fn work_history(&self) -> Vec<BTreeMap<String, String>> {
        self.state.lock().work_history.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Entries never delivered to any consumer
    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    pub fn claim_calls(&self) -> usize {
        self.state.lock().claim_calls
    }

    pub fn touches(&self) -> usize {
        self.state.lock().touches
    }

    pub fn group_creations(&self) -> usize {
        self.state.lock().group_creations
    }

    fn injected_failure(&self, command: &'static str) -> Result<(), LogError> {
        let failed = self
            .failing_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LogError::Command {
                command,
                message: "connection reset".to_string(),
            });
        }
        Ok(())
    }

    fn take_backlog(&self, count: usize) -> Vec<ClaimedEntry> {
        let mut state = self.state.lock();
        let mut entries = Vec::new();
        while entries.len() < count {
            let Some((id, fields)) = state.backlog.pop_front() else {
                break;
            };
            state.pending.insert(
                id.clone(),
                PendingEntry {
                    fields: fields.clone(),
                    consumer: CONSUMER.to_string(),
                    delivered_at: Some(Instant::now()),
                },
            );
            entries.push(ClaimedEntry {
                entry_id: id,
                consumer_id: CONSUMER.to_string(),
                claimed_at: Utc::now(),
                source: ClaimSource::Fresh,
                fields,
            });
        }
        entries
    }
}

#[async_trait]
impl StreamLog for MemoryLog {
    async fn ensure_group(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if !state.group_exists {
            state.group_exists = true;
            state.group_creations += 1;
        }
        Ok(())
    }

    async fn claim(&self, count: usize, block: Duration) -> Result<Vec<ClaimedEntry>, LogError> {
        self.state.lock().claim_calls += 1;
        self.injected_failure("XREADGROUP")?;

        let deadline = Instant::now() + block;
        loop {
            let appended = self.appended.notified();
            let entries = self.take_backlog(count);
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<ClaimedEntry>, LogError> {
        self.injected_failure("XAUTOCLAIM")?;

        let mut state = self.state.lock();
        let now = Instant::now();
        let mut entries = Vec::new();
        for (id, pending) in state.pending.iter_mut() {
            if entries.len() >= count {
                break;
            }
            let idle_enough = pending
                .delivered_at
                .map_or(true, |at| now.duration_since(at) >= min_idle);
            if !idle_enough {
                continue;
            }
            pending.consumer = CONSUMER.to_string();
            pending.delivered_at = Some(now);
            entries.push(ClaimedEntry {
                entry_id: id.clone(),
                consumer_id: pending.consumer.clone(),
                claimed_at: Utc::now(),
                source: ClaimSource::Reclaimed,
                fields: pending.fields.clone(),
            });
        }
        Ok(entries)
    }

    async fn touch(&self, entry_id: &str) -> Result<bool, LogError> {
        let mut state = self.state.lock();
        state.touches += 1;
        match state.pending.get_mut(entry_id) {
            Some(pending) => {
                pending.consumer = CONSUMER.to_string();
                pending.delivered_at = Some(Instant::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.pending.remove(entry_id).is_some() {
            state.acked.push(entry_id.to_string());
        }
        Ok(())
    }

    async fn append(&self, target: StreamTarget, fields: &[(String, String)]) -> Result<String, LogError> {
        match target {
            StreamTarget::Work => {
                if self.failing_work_appends.load(Ordering::SeqCst) {
                    return Err(LogError::Command {
                        command: "XADD",
                        message: "connection reset".to_string(),
                    });
                }
                Ok(self.append_work(field_map(fields)))
            }
            StreamTarget::DeadLetter => {
                let mut state = self.state.lock();
                state.next_seq += 1;
                state.dead_letters.push(field_map(fields));
                Ok(format!("{}-0", state.next_seq))
            }
        }
    }

    async fn group_status(&self) -> Result<GroupStatus, LogError> {
        Ok(GroupStatus {
            stream: "stream:test".to_string(),
            group: "workers".to_string(),
            consumer: CONSUMER.to_string(),
            dead_letter_stream: "stream:test:dlq".to_string(),
            pending: self.pending_len() as u64,
        })
    }

    fn consumer_name(&self) -> &str {
        CONSUMER
    }
}

/// Decrements the running count when a run ends, including by timeout
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pipeline whose outcomes are scripted per call
pub struct ScriptedPipeline {
    script: Mutex<VecDeque<Result<(), PipelineError>>>,
    fallback: Result<(), PipelineError>,
    delay: Duration,
    hold: Option<Semaphore>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedPipeline {
    fn with_fallback(fallback: Result<(), PipelineError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            hold: None,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_fallback(Ok(()))
    }

    pub fn failing(error: PipelineError) -> Self {
        Self::with_fallback(Err(error))
    }

    /// Play `outcomes` in order, then succeed
    pub fn scripted(outcomes: Vec<Result<(), PipelineError>>) -> Self {
        let pipeline = Self::succeeding();
        *pipeline.script.lock() = outcomes.into();
        pipeline
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block every run until [`ScriptedPipeline::release`] lets it finish
    pub fn held(mut self) -> Self {
        self.hold = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self, runs: usize) {
        if let Some(hold) = &self.hold {
            hold.add_permits(runs);
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// The attempt number of every run, in call order
    pub fn attempts_seen(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl PipelineAdapter for ScriptedPipeline {
    async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutput, PipelineError> {
        self.attempts.lock().push(request.attempt);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        if let Some(hold) = &self.hold {
            if let Ok(permit) = hold.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        outcome?;

        let frames = request.workspace.join("frames");
        tokio::fs::create_dir_all(&frames)
            .await
            .map_err(|e| PipelineError::Analysis(e.to_string()))?;
        tokio::fs::write(frames.join("background.jpg"), b"jpeg")
            .await
            .map_err(|e| PipelineError::Analysis(e.to_string()))?;

        let artifacts = collect_artifacts(&request.workspace)
            .await
            .map_err(|e| PipelineError::Analysis(e.to_string()))?;
        Ok(PipelineOutput {
            artifacts,
            metadata: AnalysisMetadata {
                detections: 1,
                frames_sampled: request.duration_seconds,
                ..Default::default()
            },
        })
    }
}

/// One recorded publish call
#[derive(Debug, Clone)]
pub struct Publish {
    pub job_id: String,
    pub attempt: u32,
    pub artifacts: Vec<String>,
}

/// Publisher that records calls instead of uploading
pub struct RecordingPublisher {
    publishes: Mutex<Vec<Publish>>,
    failing: AtomicUsize,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self {
            publishes: Mutex::new(Vec::new()),
            failing: AtomicUsize::new(0),
        }
    }

    /// Fail the first artifact of the next `count` publishes
    pub fn failing_first(count: usize) -> Self {
        let publisher = Self::new();
        publisher.failing.store(count, Ordering::SeqCst);
        publisher
    }

    pub fn publishes(&self) -> Vec<Publish> {
        self.publishes.lock().clone()
    }
}

#[async_trait]
impl ArtifactPublisher for RecordingPublisher {
    async fn publish(&self, ctx: &JobContext, artifacts: &[Artifact]) -> PublishReport {
        let fail = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let uploads = artifacts
            .iter()
            .enumerate()
            .map(|(i, artifact)| {
                let key = object_key("preprocess", &ctx.source_id, &ctx.job_id, ctx.started_at, &artifact.name);
                let result = if fail && i == 0 {
                    Err(PublishError::Upload {
                        key: key.clone(),
                        message: "503 Slow Down".to_string(),
                    })
                } else {
                    Ok(())
                };
                ArtifactUpload {
                    name: artifact.name.clone(),
                    key,
                    result,
                }
            })
            .collect();

        self.publishes.lock().push(Publish {
            job_id: ctx.job_id.clone(),
            attempt: ctx.attempt,
            artifacts: artifacts.iter().map(|a| a.name.clone()).collect(),
        });
        PublishReport { uploads }
    }
}

/// Reports low headroom for the first `low_calls` reads
pub struct SteppedProbe {
    low_calls: usize,
    calls: AtomicUsize,
}

impl SteppedProbe {
    pub fn low_then_high(low_calls: usize) -> Self {
        Self {
            low_calls,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ResourceProbe for SteppedProbe {
    async fn free_bytes(&self) -> Result<u64, ProbeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mib = if call < self.low_calls { 256 } else { 8192 };
        Ok(mib * 1024 * 1024)
    }
}

/// Shared handle to a fresh log
pub fn memory_log() -> Arc<MemoryLog> {
    Arc::new(MemoryLog::new())
}
