//! Nier Analysis Worker
//!
//! Stream worker for the CCTV analysis platform. Work items describing camera
//! video segments are claimed from a Redis Streams consumer group, run through
//! an external analysis pipeline and the resulting artifacts are uploaded to
//! S3-compatible storage.
//!
//! ## Features
//!
//! - **At-least-once delivery**: entries are acknowledged only after their
//!   artifacts are uploaded; crashed consumers' entries are reclaimed after
//!   the visibility timeout and replayed at the same attempt
//! - **Bounded concurrency**: a runtime-adjustable ceiling on in-flight jobs,
//!   changeable over HTTP without a restart
//! - **Resource-aware admission**: jobs wait while free GPU memory is low
//! - **Retry and dead-lettering**: failed attempts are re-enqueued with an
//!   incremented attempt until the retry budget is spent
//!
//! ## Architecture
//!
//! ```text
//!  Redis Stream                                         S3 Bucket
//! ┌──────────────┐                                    ┌──────────────────┐
//! │ stream:      │  claim / reclaim                   │ {prefix}/        │
//! │ preprocess   │──────────────┐                     │   {sourceId}/    │
//! └──────────────┘              ▼                     │   {jobId}/       │
//!        ▲               ┌──────────────┐             │   {timestamp}/   │
//!        │ retry         │ Consumer     │             └──────────────────┘
//!        │ (attempt+1)   │ Loop         │                      ▲
//!        │               └──────────────┘                      │
//!        │                      │ limiter slot                 │
//!        │                      ▼                              │
//!        │               ┌──────────────┐    ┌──────────────┐  │
//!        │               │ Admission    │───▶│ Pipeline     │  │
//!        │               │ Gate         │    │ Adapter      │  │
//!        │               └──────────────┘    └──────────────┘  │
//!        │                                          │          │
//!        │               ┌──────────────┐           ▼          │
//!        └───────────────│ Retry / DLQ  │◀── ┌──────────────┐  │
//!                        │ Policy       │    │ Artifact     │──┘
//!  stream:preprocess:dlq◀└──────────────┘    │ Publisher    │
//!                                            └──────────────┘
//! ```
//!
//! Counters and the concurrency ceiling are shared with the operational API
//! (`/health`, `/metrics`, `/worker/status`, `/control/concurrency`).

pub mod admission;
pub mod api;
pub mod config;
pub mod consumer;
pub mod job;
pub mod lifecycle;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod publisher;
pub mod retry;
pub mod stream_log;
pub mod work_item;

#[cfg(test)]
mod testing;

pub use admission::{Admission, AdmissionGate, NvidiaSmiProbe, ResourceProbe};
pub use api::{start_api_server, AppState};
pub use config::Config;
pub use consumer::{ConsumerError, ConsumerSettings, StreamConsumer};
pub use crate::metrics::{MetricsSnapshot, WorkerMetrics};
pub use job::JobContext;
pub use lifecycle::{shutdown_signal, DrainOutcome, WorkerHandle};
pub use limiter::{ConcurrencyLimiter, LimiterError};
pub use pipeline::{CommandPipeline, PipelineAdapter, PipelineError};
pub use publisher::{ArtifactPublisher, S3Publisher};
pub use retry::{AttemptError, RetryPolicy};
pub use stream_log::{RedisStreamLog, StreamLog};
pub use work_item::{ClaimedEntry, WorkItem};
