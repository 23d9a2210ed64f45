use analysis_worker::{
    shutdown_signal, start_api_server, AdmissionGate, AppState, CommandPipeline, ConcurrencyLimiter,
    Config, ConsumerSettings, DrainOutcome, NvidiaSmiProbe, RedisStreamLog, S3Publisher,
    StreamConsumer, WorkerHandle, WorkerMetrics,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        stream = %config.redis.stream,
        group = %config.redis.group,
        "Starting Nier Analysis Worker"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    tokio::fs::create_dir_all(&config.worker.scratch_dir)
        .await
        .with_context(|| format!("Failed to create scratch dir {}", config.worker.scratch_dir.display()))?;

    // Initialize components
    let log = Arc::new(
        RedisStreamLog::connect(&config.redis_url(), &config.redis)
            .await
            .context("Failed to connect to Redis")?,
    );

    let publisher = Arc::new(S3Publisher::new(&config.s3).await);
    let pipeline = Arc::new(CommandPipeline::new(&config.pipeline));
    let limiter = Arc::new(ConcurrencyLimiter::new(config.worker.max_concurrency));
    let metrics = Arc::new(WorkerMetrics::new());

    let gate = if config.worker.gpu_memory_guard {
        info!(
            min_free_mb = config.worker.min_free_gpu_memory_mb,
            "GPU memory guard enabled"
        );
        AdmissionGate::guarded(Arc::new(NvidiaSmiProbe::new()), config.worker.min_free_gpu_memory_mb)
    } else {
        AdmissionGate::disabled()
    };

    let consumer = Arc::new(StreamConsumer::new(
        log.clone(),
        limiter.clone(),
        gate,
        pipeline,
        publisher,
        metrics.clone(),
        ConsumerSettings::from_config(&config),
    ));

    let shutdown = CancellationToken::new();

    // Create API state
    let api_state = AppState {
        metrics,
        limiter,
        log,
        shutdown: shutdown.clone(),
    };

    // Spawn consumer loop
    let worker = WorkerHandle::spawn(consumer, shutdown.clone(), config.drain_grace());

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Analysis worker started successfully");

    // Wait for shutdown signal, or for the consumer to give up on its own
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {
            warn!("Consumer stopped unexpectedly");
        }
    }

    info!("Shutting down analysis worker");

    match worker.shutdown().await {
        DrainOutcome::Drained => info!("In-flight work drained"),
        DrainOutcome::TimedOut => warn!("Shutdown proceeded with work still in flight"),
    }

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Analysis worker stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
