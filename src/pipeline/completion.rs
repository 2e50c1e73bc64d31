//! Completion loop: reconcile computed results into the job store.
//!
//! Per item: receive → decode → update store → acknowledge result. The
//! store update is idempotent, so a duplicate delivery of the same result
//! is acknowledged like the first one.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, info};

use super::{DeadLetterPolicy, LoopConfig, acknowledge};
use crate::error::{Error, Result};
use crate::model::{JobStatus, ResultItem};
use crate::queue::{Delivery, WorkQueue};
use crate::store::JobStore;
use crate::telemetry::metrics;
use crate::telemetry::pipeline::{record_job, start_process_span};

/// Consumes the result channel and completes jobs in the store.
#[derive(Clone)]
pub struct CompletionLoop {
    results: Arc<dyn WorkQueue>,
    store: Arc<dyn JobStore>,
    dead_letters: DeadLetterPolicy,
    config: LoopConfig,
    shutdown: Arc<Notify>,
}

impl CompletionLoop {
    pub fn new(
        results: Arc<dyn WorkQueue>,
        store: Arc<dyn JobStore>,
        dead_letters: Arc<dyn WorkQueue>,
        config: LoopConfig,
    ) -> Self {
        Self {
            results,
            store,
            dead_letters: DeadLetterPolicy::new(dead_letters, config.max_deliveries),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop after the item it is working on.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown or a fatal error (store or broker unreachable).
    pub async fn run(&self) -> Result<()> {
        info!(queue = self.results.name(), "completion loop started");
        loop {
            let batch = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("completion loop shutting down");
                    return Ok(());
                }
                batch = self.results.receive_batch(self.config.receive_wait) => batch?,
            };
            for delivery in batch {
                self.process(delivery).await?;
            }
        }
    }

    /// Receive one batch and process it. Returns the number of items received.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self.results.receive_batch(self.config.receive_wait).await?;
        let n = batch.len();
        for delivery in batch {
            self.process(delivery).await?;
        }
        Ok(n)
    }

    async fn process(&self, delivery: Delivery) -> Result<()> {
        let span = start_process_span(self.results.name(), &delivery);
        let started = Instant::now();
        async {
            if self.dead_letters.exhausted(&delivery) {
                let reason = format!("exceeded {} deliveries", self.config.max_deliveries);
                return self
                    .dead_letters
                    .quarantine(self.results.as_ref(), &delivery, &reason)
                    .await;
            }

            let item: ResultItem = match delivery.decode() {
                Ok(item) => item,
                Err(e) => {
                    let reason = format!("malformed result item: {e}");
                    return self
                        .dead_letters
                        .quarantine(self.results.as_ref(), &delivery, &reason)
                        .await;
                }
            };
            record_job(&tracing::Span::current(), &item.id);

            let now = Utc::now();
            let updated = match (item.result, item.error.as_deref()) {
                (Some(value), _) => self.store.complete_job(item.id, value, now).await,
                (None, Some(error)) => self.store.fail_job(item.id, error, now).await,
                (None, None) => {
                    return self
                        .dead_letters
                        .quarantine(
                            self.results.as_ref(),
                            &delivery,
                            "unprocessable result item: neither result nor error",
                        )
                        .await;
                }
            };

            let job = match updated {
                Ok(job) => job,
                // No job will ever match this id; redelivery cannot help.
                Err(Error::NotFound(_)) => {
                    let reason = format!("unprocessable result item: unknown job {}", item.id);
                    return self
                        .dead_letters
                        .quarantine(self.results.as_ref(), &delivery, &reason)
                        .await;
                }
                Err(e) => return Err(e),
            };

            let outcome = match job.status() {
                JobStatus::Completed => "completed",
                JobStatus::Failed => "failed",
                JobStatus::Pending => "pending",
            };
            info!(job_id = %job.id, outcome, result = ?job.result, "job resolved");
            metrics::jobs_resolved().add(1, &[KeyValue::new("outcome", outcome)]);

            acknowledge(self.results.as_ref(), &delivery.handle).await?;

            metrics::processing_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("stage", "completion")],
            );
            Ok(())
        }
        .instrument(span)
        .await
    }
}
