//! Ties the consumer loop to process start-up and shutdown.

use crate::consumer::{ConsumerError, StreamConsumer};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Loop returned and every in-flight entry finished
    Drained,
    /// Grace period elapsed first; remaining entries are left for reclaim
    TimedOut,
}

/// Running consumer loop
pub struct WorkerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ConsumerError>>,
    grace: Duration,
}

impl WorkerHandle {
    /// Start the loop in the background.
    ///
    /// `shutdown` is shared with the rest of the process: cancelling it stops
    /// the loop, and a loop that fails on its own cancels it.
    pub fn spawn(consumer: Arc<StreamConsumer>, shutdown: CancellationToken, grace: Duration) -> Self {
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = consumer.run(token.clone()).await;
            if let Err(ref e) = result {
                error!(error = %e, "Consumer loop failed");
                token.cancel();
            }
            result
        });

        Self { shutdown, task, grace }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop claiming and wait up to the grace period for in-flight work
    pub async fn shutdown(mut self) -> DrainOutcome {
        self.shutdown.cancel();

        match tokio::time::timeout(self.grace, &mut self.task).await {
            Ok(Ok(Ok(()))) => {
                info!("Consumer stopped cleanly");
                DrainOutcome::Drained
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Consumer had already stopped with an error");
                DrainOutcome::Drained
            }
            Ok(Err(e)) => {
                error!(error = %e, "Consumer task panicked");
                DrainOutcome::Drained
            }
            Err(_) => {
                warn!(
                    grace_secs = self.grace.as_secs(),
                    "Drain grace period elapsed, abandoning in-flight entries"
                );
                self.task.abort();
                DrainOutcome::TimedOut
            }
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
