//! Reconciliation sweep for orphaned jobs.
//!
//! A job whose request was never enqueued (the enqueue after the insert
//! failed) stays pending forever. The sweep re-enqueues a request for every
//! job still pending after a threshold. Jobs that were merely slow get a
//! duplicate request, which the idempotent completion absorbs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::RequestItem;
use crate::queue::{WorkQueue, publish};
use crate::store::JobStore;
use crate::telemetry::metrics;

/// Jobs re-enqueued per sweep, at most.
pub const DEFAULT_SWEEP_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    requests: Arc<dyn WorkQueue>,
    limit: i64,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn JobStore>, requests: Arc<dyn WorkQueue>) -> Self {
        Self {
            store,
            requests,
            limit: DEFAULT_SWEEP_LIMIT,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Re-enqueue requests for jobs pending longer than `older_than`.
    /// Returns how many were re-enqueued.
    pub async fn sweep(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Config(format!("reconcile threshold out of range: {e}")))?;
        let pending = self.store.pending_jobs(Utc::now() - age, self.limit).await?;

        for job in &pending {
            let msg_id = publish(self.requests.as_ref(), &RequestItem::from(job)).await?;
            info!(job_id = %job.id, msg_id, created = %job.created, "pending job re-enqueued");
        }
        metrics::jobs_requeued().add(pending.len() as u64, &[]);
        Ok(pending.len())
    }

    /// Sweep every `interval` until shutdown. A failed sweep is logged and
    /// retried on the next tick.
    pub async fn run(&self, interval: Duration, older_than: Duration) -> Result<()> {
        info!(?interval, ?older_than, "reconciler started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("reconciler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.sweep(older_than).await {
                warn!(error = %e, "reconciliation sweep failed");
            }
        }
    }
}
