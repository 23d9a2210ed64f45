use crate::config::S3Config;
use crate::job::{sanitize_path_component, JobContext};
use crate::pipeline::Artifact;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Failure to publish a single artifact
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to upload {key}: {message}")]
    Upload { key: String, message: String },
}

/// Per-artifact outcome of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUpload {
    pub name: String,
    pub key: String,
    pub result: Result<(), PublishError>,
}

/// Outcome of publishing one job's artifact set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub uploads: Vec<ArtifactUpload>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.uploads.iter().all(|u| u.result.is_ok())
    }

    pub fn uploaded_keys(&self) -> Vec<&str> {
        self.uploads
            .iter()
            .filter(|u| u.result.is_ok())
            .map(|u| u.key.as_str())
            .collect()
    }

    pub fn failures(&self) -> Vec<&PublishError> {
        self.uploads.iter().filter_map(|u| u.result.as_ref().err()).collect()
    }
}

#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    /// Upload every artifact of the job, reporting each one
    async fn publish(&self, ctx: &JobContext, artifacts: &[Artifact]) -> PublishReport;
}

/// Object key for an artifact.
///
/// Format: `{prefix}/{sourceId}/{jobId}/{timestamp}/{artifactName}`, with
/// `timestamp` the processing start as `%Y%m%d_%H%M%S`.
pub fn object_key(
    prefix: &str,
    source_id: &str,
    job_id: &str,
    started_at: DateTime<Utc>,
    artifact_name: &str,
) -> String {
    let prefix = prefix.trim_matches('/');
    let path = format!(
        "{source_id}/{job_id}/{timestamp}/{name}",
        source_id = sanitize_path_component(source_id),
        job_id = sanitize_path_component(job_id),
        timestamp = started_at.format("%Y%m%d_%H%M%S"),
        name = sanitize_artifact_name(artifact_name),
    );
    if prefix.is_empty() {
        path
    } else {
        format!("{prefix}/{path}")
    }
}

/// Keep nested artifact names but drop empty, `.` and `..` segments
fn sanitize_artifact_name(name: &str) -> String {
    let cleaned: Vec<String> = name
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .map(|segment| {
            segment
                .chars()
                .map(|c| match c {
                    'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                    _ => '_',
                })
                .collect()
        })
        .collect();

    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned.join("/")
    }
}

/// Get content type from the artifact's extension
fn get_content_type(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
    match extension.as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        Some("mp4") => "video/mp4",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// S3 publisher for job artifacts
pub struct S3Publisher {
    client: S3Client,
    bucket: String,
    prefix: String,
    upload_concurrency: usize,
}

impl S3Publisher {
    /// Create a new S3 publisher
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/Swift
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "analysis-worker-config",
            ));
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.upload_prefix,
            "S3 publisher initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.upload_prefix.clone(),
            upload_concurrency: config.upload_concurrency.max(1),
        }
    }

    async fn upload_one(&self, ctx: &JobContext, artifact: &Artifact) -> ArtifactUpload {
        let key = object_key(
            &self.prefix,
            &ctx.source_id,
            &ctx.job_id,
            ctx.started_at,
            &artifact.name,
        );
        let result = self.put_file(ctx, artifact, &key).await;
        if let Err(ref e) = result {
            warn!(job_id = %ctx.job_id, error = %e, "Artifact upload failed");
        }
        ArtifactUpload {
            name: artifact.name.clone(),
            key,
            result,
        }
    }

    async fn put_file(&self, ctx: &JobContext, artifact: &Artifact, key: &str) -> Result<(), PublishError> {
        let body = ByteStream::from_path(&artifact.path)
            .await
            .map_err(|e| PublishError::Read {
                path: artifact.path.display().to_string(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Uploading artifact to S3");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(get_content_type(&artifact.name))
            .metadata("source-id", &ctx.source_id)
            .metadata("job-id", &ctx.job_id)
            .metadata("attempt", ctx.attempt.to_string())
            .metadata("started-at", ctx.started_at.to_rfc3339())
            .send()
            .await
            .map_err(|e| PublishError::Upload {
                key: key.to_string(),
                message: aws_sdk_s3::error::DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

#[async_trait]
impl ArtifactPublisher for S3Publisher {
    #[instrument(skip(self, ctx, artifacts), fields(job_id = %ctx.job_id, count = artifacts.len()))]
    async fn publish(&self, ctx: &JobContext, artifacts: &[Artifact]) -> PublishReport {
        let pending: Vec<BoxFuture<'_, ArtifactUpload>> = artifacts
            .iter()
            .map(|artifact| self.upload_one(ctx, artifact).boxed())
            .collect();
        let uploads: Vec<ArtifactUpload> = stream::iter(pending)
            .buffered(self.upload_concurrency)
            .collect()
            .await;

        let report = PublishReport { uploads };
        info!(
            uploaded = report.uploaded_keys().len(),
            total = artifacts.len(),
            "Artifact upload finished"
        );
        report
    }
}
