//! Collector lifecycle
//!
//! A [`Collector`] owns one pipeline and drives it either on a recurring
//! background loop or on demand. Both paths take the same cycle lock, which
//! also guards the dedup index, so a manual run never overlaps a scheduled one.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::RecordStore;
use crate::error::CollectorResult;

use super::config::CollectorConfig;
use super::dedup::DeduplicationIndex;
use super::ftp::{ConnectionCheck, FtpSourceProvider, SourceProvider};
use super::models::{CollectorStatus, ProcessResult};
use super::pipeline::IngestionPipeline;
use super::status::{CollectorEvent, StatusBoard};

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Collector {
    pipeline: Arc<IngestionPipeline>,
    status: Arc<StatusBoard>,
    cycle: Arc<AsyncMutex<DeduplicationIndex>>,
    worker: Mutex<Option<Worker>>,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        store: Arc<dyn RecordStore>,
        sources: Arc<dyn SourceProvider>,
    ) -> Self {
        let status = Arc::new(StatusBoard::new());
        let index = DeduplicationIndex::with_capacity(config.dedup_capacity);
        let pipeline = IngestionPipeline::new(config, store, sources, status.clone());

        Self {
            pipeline: Arc::new(pipeline),
            status,
            cycle: Arc::new(AsyncMutex::new(index)),
            worker: Mutex::new(None),
        }
    }

    /// Collector polling its IHMs over FTP
    pub fn with_ftp(config: CollectorConfig, store: Arc<dyn RecordStore>) -> Self {
        Self::new(config, store, Arc::new(FtpSourceProvider))
    }

    pub fn config(&self) -> &CollectorConfig {
        self.pipeline.config()
    }

    pub fn status(&self) -> CollectorStatus {
        self.status.snapshot()
    }

    /// Up to 50 most recent results, newest first
    pub fn history(&self) -> Vec<ProcessResult> {
        self.status.history()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Start the recurring loop
    ///
    /// Returns `false` without side effects when the loop is already running.
    /// Must be called from within a tokio runtime.
    pub fn start_recurring(&self) -> bool {
        let mut worker = self.lock_worker();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            info!("Collector already running");
            return false;
        }

        self.status.set_running(true);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(recurring_loop(
            self.pipeline.clone(),
            self.status.clone(),
            self.cycle.clone(),
            cancel.clone(),
        ));
        *worker = Some(Worker { cancel, handle });

        info!(
            line = %self.config().line,
            interval_secs = self.config().interval_secs,
            endpoints = self.config().endpoints.len(),
            "Collector started"
        );
        true
    }

    /// Stop the recurring loop, waiting at most the configured stop timeout
    ///
    /// Returns `true` when the loop exited in time. Status is marked as not
    /// running either way; a loop that overran the timeout is left to finish
    /// its current cycle in the background.
    pub async fn stop(&self) -> bool {
        let worker = self.lock_worker().take();
        let Some(worker) = worker else {
            info!("Collector not running");
            self.status.set_running(false);
            return true;
        };

        worker.cancel.cancel();
        let timeout = self.config().stop_timeout();

        let stopped = match tokio::time::timeout(timeout, worker.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Collector task ended abnormally: {}", e);
                true
            },
            Err(_) => {
                warn!(?timeout, "Collector did not stop in time, detaching current cycle");
                false
            },
        };

        self.status.set_running(false);
        info!("Collector stopped");
        stopped
    }

    /// Run a single cycle now, after any cycle already in progress
    ///
    /// When the store rejected every file the error is
    /// [`CollectorError::StoreUnavailable`](crate::CollectorError::StoreUnavailable),
    /// which still carries the per-file results.
    pub async fn run_once(&self) -> CollectorResult<Vec<ProcessResult>> {
        let mut index = self.cycle.lock().await;
        let outcome = self.pipeline.run_cycle(&mut index).await;
        if let Err(e) = &outcome {
            error!("Manual collection failed: {}", e);
            self.status.record_error(e.to_string());
        }
        outcome
    }

    pub async fn test_connections(&self) -> Vec<(String, ConnectionCheck)> {
        self.pipeline.test_connections().await
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Some(worker) = self.lock_worker().take() {
            worker.cancel.cancel();
        }
    }
}

async fn recurring_loop(
    pipeline: Arc<IngestionPipeline>,
    status: Arc<StatusBoard>,
    cycle: Arc<AsyncMutex<DeduplicationIndex>>,
    cancel: CancellationToken,
) {
    let interval = pipeline.config().interval();
    let backoff = pipeline.config().error_backoff();

    while !cancel.is_cancelled() {
        let outcome = {
            let mut index = tokio::select! {
                _ = cancel.cancelled() => break,
                index = cycle.lock() => index,
            };
            pipeline.run_cycle(&mut index).await
        };

        let delay = match outcome {
            Ok(_) => interval,
            Err(e) => {
                error!(backoff_secs = backoff.as_secs(), "Collection cycle failed: {}", e);
                status.record_error(e.to_string());
                backoff
            },
        };

        // stop() may have given up on this cycle already
        if cancel.is_cancelled() {
            break;
        }
        status.cycle_finished(next_run_after(delay));

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {},
        }
    }

    info!("Collector loop exited");
}

fn next_run_after(delay: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_run_after() {
        let before = Utc::now();
        let next = next_run_after(Duration::from_secs(60));
        assert!(next.is_some_and(|n| n >= before + chrono::Duration::seconds(60)));
    }
}
