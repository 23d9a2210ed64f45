//! Analysis pipeline boundary.
//!
//! The pipeline is a black box: given a media reference, a duration and a
//! scratch workspace, it leaves artifact files behind and reports metadata,
//! or fails with one of the [`PipelineError`] variants.

use crate::config::PipelineConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Exit code the command uses to report unreachable media
pub const EXIT_FETCH_FAILED: i32 = 3;

/// Metadata file the command may leave in its workspace
pub const METADATA_FILE: &str = "meta.json";

/// Closed set of pipeline failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("media fetch failed: {0}")]
    Fetch(String),

    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("attempt exceeded deadline of {0:?}")]
    Timeout(Duration),
}

/// Input to one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub source_id: String,
    pub media_ref: String,
    pub duration_seconds: u32,
    pub attempt: u32,
    pub workspace: PathBuf,
}

/// A local file to publish under a logical name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Logical name, used as the last object key component(s)
    pub name: String,
    /// Local file
    pub path: PathBuf,
}

/// Structured result of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetadata {
    /// Detections found
    #[serde(default)]
    pub detections: u32,
    /// Frames sampled from the media
    #[serde(default)]
    pub frames_sampled: u32,
    /// Wall time spent in the pipeline
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Anything else the pipeline reported
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Successful run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub artifacts: Vec<Artifact>,
    pub metadata: AnalysisMetadata,
}

#[async_trait]
pub trait PipelineAdapter: Send + Sync {
    /// Run the pipeline once for the request
    async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutput, PipelineError>;
}

/// Runs an external executable per attempt
pub struct CommandPipeline {
    command: String,
    args: Vec<String>,
}

impl CommandPipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn render_args(&self, request: &PipelineRequest) -> Vec<String> {
        let workspace = request.workspace.to_string_lossy();
        let duration = request.duration_seconds.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{media_ref}", &request.media_ref)
                    .replace("{duration}", &duration)
                    .replace("{workspace}", &workspace)
                    .replace("{source_id}", &request.source_id)
            })
            .collect()
    }
}

#[async_trait]
impl PipelineAdapter for CommandPipeline {
    #[instrument(skip(self, request), fields(source_id = %request.source_id, attempt = request.attempt))]
    async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutput, PipelineError> {
        let started = Instant::now();
        let args = self.render_args(request);
        debug!(command = %self.command, ?args, "Starting pipeline");

        // kill_on_drop ends the child when the attempt deadline drops this future
        let output = Command::new(&self.command)
            .args(&args)
            .current_dir(&request.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::Analysis(format!("failed to start {}: {e}", self.command)))?;

        if !output.status.success() {
            let detail = stderr_tail(&output.stderr);
            return Err(match output.status.code() {
                Some(EXIT_FETCH_FAILED) => PipelineError::Fetch(detail),
                Some(code) => PipelineError::Analysis(format!("exit code {code}: {detail}")),
                None => PipelineError::Analysis(format!("terminated by signal: {detail}")),
            });
        }

        let mut metadata = read_metadata(&request.workspace).await;
        metadata.elapsed_ms = started.elapsed().as_millis() as u64;

        let artifacts = collect_artifacts(&request.workspace)
            .await
            .map_err(|e| PipelineError::Analysis(format!("failed to list artifacts: {e}")))?;

        if artifacts.is_empty() {
            return Err(PipelineError::Analysis("pipeline produced no artifacts".to_string()));
        }

        Ok(PipelineOutput { artifacts, metadata })
    }
}

async fn read_metadata(workspace: &Path) -> AnalysisMetadata {
    let path = workspace.join(METADATA_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unparsable pipeline metadata");
            AnalysisMetadata::default()
        }),
        Err(_) => AnalysisMetadata::default(),
    }
}

/// Every regular file under `root`, named by its `/`-separated relative path
pub async fn collect_artifacts(root: &Path) -> std::io::Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                dirs.push(path);
            } else if file_type.is_file() {
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                artifacts.push(Artifact { name, path });
            }
        }
    }

    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(artifacts)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}
