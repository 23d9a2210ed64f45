//! Resource-aware admission.
//!
//! The gate runs after an entry has been claimed and a limiter slot reserved
//! for it. A `Defer` verdict leaves the entry claimed and unprocessed; the
//! consumer retries admission after a backoff without touching the attempt
//! counter.

use crate::work_item::WorkItem;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Errors reading the resource signal
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe command failed: {0}")]
    Command(String),

    #[error("unparsable probe output: {0:?}")]
    Parse(String),
}

/// Source of the headroom signal
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Free bytes currently available to the pipeline
    async fn free_bytes(&self) -> Result<u64, ProbeError>;
}

/// Admission verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Start processing now
    Allow,
    /// Leave claimed and try again later
    Defer { reason: String },
}

/// Decides whether a claimed item may start processing
pub struct AdmissionGate {
    probe: Option<Arc<dyn ResourceProbe>>,
    min_free_bytes: u64,
}

impl AdmissionGate {
    /// Gate that always allows
    pub fn disabled() -> Self {
        Self {
            probe: None,
            min_free_bytes: 0,
        }
    }

    /// Gate that defers while the probe reports less than `min_free_mb` MiB free
    pub fn guarded(probe: Arc<dyn ResourceProbe>, min_free_mb: u64) -> Self {
        Self {
            probe: Some(probe),
            min_free_bytes: min_free_mb.saturating_mul(BYTES_PER_MIB),
        }
    }

    pub fn is_guarded(&self) -> bool {
        self.probe.is_some()
    }

    pub async fn admit(&self, item: &WorkItem) -> Admission {
        let Some(probe) = &self.probe else {
            return Admission::Allow;
        };

        match probe.free_bytes().await {
            Ok(free) if free < self.min_free_bytes => {
                let reason = format!(
                    "free memory {}MiB below required {}MiB",
                    free / BYTES_PER_MIB,
                    self.min_free_bytes / BYTES_PER_MIB
                );
                warn!(source_id = %item.source_id, %reason, "Deferring admission");
                Admission::Defer { reason }
            }
            Ok(free) => {
                debug!(source_id = %item.source_id, free_mib = free / BYTES_PER_MIB, "Admitted");
                Admission::Allow
            }
            Err(e) => {
                // An unreadable signal must not stall intake
                warn!(error = %e, "Resource probe failed, admitting");
                Admission::Allow
            }
        }
    }
}

/// Reads free memory of the first GPU through `nvidia-smi`
pub struct NvidiaSmiProbe {
    binary: String,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for NvidiaSmiProbe {
    async fn free_bytes(&self) -> Result<u64, ProbeError> {
        let output = Command::new(&self.binary)
            .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::Command(e.to_string()))?;

        if !output.status.success() {
            return Err(ProbeError::Command(format!(
                "{} exited with {}",
                self.binary, output.status
            )));
        }

        parse_free_mib(&String::from_utf8_lossy(&output.stdout)).map(|mib| mib * BYTES_PER_MIB)
    }
}

/// First line of `nvidia-smi` csv output, in MiB
fn parse_free_mib(stdout: &str) -> Result<u64, ProbeError> {
    let line = stdout.lines().next().unwrap_or_default().trim();
    line.parse::<u64>()
        .map_err(|_| ProbeError::Parse(line.to_string()))
}
