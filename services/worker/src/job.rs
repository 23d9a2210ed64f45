use crate::pipeline::{AnalysisMetadata, Artifact};
use crate::work_item::WorkItem;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Name of the attempt summary the worker publishes next to pipeline artifacts
pub const JOB_MANIFEST: &str = "job.json";

/// Per-attempt state: collision-free id, scratch workspace, start time
#[derive(Debug, Clone)]
pub struct JobContext {
    /// `{sourceId}-{entryId}-a{attempt}`, sanitized for object keys
    pub job_id: String,
    pub source_id: String,
    pub entry_id: String,
    pub attempt: u32,
    /// Processing start, used in object keys
    pub started_at: DateTime<Utc>,
    /// Scratch directory owned by this attempt
    pub workspace: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobManifest<'a> {
    job_id: &'a str,
    source_id: &'a str,
    entry_id: &'a str,
    attempt: u32,
    media_ref: &'a str,
    duration_seconds: u32,
    enqueued_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    artifacts: Vec<&'a str>,
    analysis: &'a AnalysisMetadata,
}

impl JobContext {
    /// Create the context and its scratch directory under `scratch_root`
    pub async fn create(scratch_root: &Path, entry_id: &str, item: &WorkItem) -> std::io::Result<Self> {
        let job_id = job_id(&item.source_id, entry_id, item.attempt);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let workspace = scratch_root.join(format!("{job_id}-{}", &suffix[..8]));
        tokio::fs::create_dir_all(&workspace).await?;

        Ok(Self {
            job_id,
            source_id: item.source_id.clone(),
            entry_id: entry_id.to_string(),
            attempt: item.attempt,
            started_at: Utc::now(),
            workspace,
        })
    }

    /// Write the attempt summary into the workspace and return it as an artifact
    pub async fn write_manifest(
        &self,
        item: &WorkItem,
        artifacts: &[Artifact],
        analysis: &AnalysisMetadata,
    ) -> std::io::Result<Artifact> {
        let manifest = JobManifest {
            job_id: &self.job_id,
            source_id: &self.source_id,
            entry_id: &self.entry_id,
            attempt: self.attempt,
            media_ref: &item.media_ref,
            duration_seconds: item.duration_seconds,
            enqueued_at: item.enqueued_at,
            started_at: self.started_at,
            artifacts: artifacts.iter().map(|a| a.name.as_str()).collect(),
            analysis,
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        let path = self.workspace.join(JOB_MANIFEST);
        tokio::fs::write(&path, bytes).await?;

        Ok(Artifact {
            name: JOB_MANIFEST.to_string(),
            path,
        })
    }

    /// Remove the scratch directory
    pub async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %self.job_id, error = %e, "Failed to remove scratch workspace");
            }
        }
    }
}

/// Attempt-scoped job id; distinct for every (source, entry, attempt)
pub fn job_id(source_id: &str, entry_id: &str, attempt: u32) -> String {
    format!(
        "{}-{}-a{}",
        sanitize_path_component(source_id),
        sanitize_path_component(entry_id),
        attempt
    )
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
