//! Worker loop: evaluate requests and publish their results.
//!
//! Per item: receive → decode → evaluate → publish result → acknowledge
//! request. The request is acknowledged only after its result is on the
//! result channel.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, debug, info, warn};

use super::{DeadLetterPolicy, LoopConfig, acknowledge};
use crate::compute::Evaluate;
use crate::error::Result;
use crate::model::{RequestItem, ResultItem};
use crate::queue::{Delivery, WorkQueue, publish};
use crate::telemetry::metrics;
use crate::telemetry::pipeline::{inject_context, record_job, start_process_span};

/// Consumes the request channel and feeds the result channel.
#[derive(Clone)]
pub struct Worker {
    requests: Arc<dyn WorkQueue>,
    results: Arc<dyn WorkQueue>,
    evaluator: Arc<dyn Evaluate>,
    dead_letters: DeadLetterPolicy,
    config: LoopConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub fn new(
        requests: Arc<dyn WorkQueue>,
        results: Arc<dyn WorkQueue>,
        dead_letters: Arc<dyn WorkQueue>,
        evaluator: Arc<dyn Evaluate>,
        config: LoopConfig,
    ) -> Self {
        Self {
            requests,
            results,
            evaluator,
            dead_letters: DeadLetterPolicy::new(dead_letters, config.max_deliveries),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop after the item it is working on.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown or a fatal error.
    ///
    /// Fatal errors are the ones redelivery can recover from later: the
    /// broker or the result channel being unreachable. The loop is not
    /// restarted by this crate.
    pub async fn run(&self) -> Result<()> {
        info!(queue = self.requests.name(), "worker started");
        loop {
            let batch = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                batch = self.requests.receive_batch(self.config.receive_wait) => batch?,
            };
            for delivery in batch {
                self.process(delivery).await?;
            }
        }
    }

    /// Receive one batch and process it. Returns the number of items received.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self.requests.receive_batch(self.config.receive_wait).await?;
        let n = batch.len();
        for delivery in batch {
            self.process(delivery).await?;
        }
        Ok(n)
    }

    async fn process(&self, delivery: Delivery) -> Result<()> {
        let span = start_process_span(self.requests.name(), &delivery);
        let started = Instant::now();
        async {
            if self.dead_letters.exhausted(&delivery) {
                let reason = format!("exceeded {} deliveries", self.config.max_deliveries);
                return self
                    .dead_letters
                    .quarantine(self.requests.as_ref(), &delivery, &reason)
                    .await;
            }

            let request: RequestItem = match delivery.decode() {
                Ok(request) => request,
                Err(e) => {
                    let reason = format!("malformed request item: {e}");
                    return self
                        .dead_letters
                        .quarantine(self.requests.as_ref(), &delivery, &reason)
                        .await;
                }
            };
            let current = tracing::Span::current();
            record_job(&current, &request.id);

            let outcome = match self.evaluator.evaluate(&request.expression) {
                Ok(value) => {
                    debug!(job_id = %request.id, value, "expression evaluated");
                    metrics::evaluations().add(1, &[KeyValue::new("outcome", "ok")]);
                    ResultItem::success(request.id, value)
                }
                Err(e) => {
                    warn!(job_id = %request.id, error = %e, "expression rejected");
                    metrics::evaluations().add(1, &[KeyValue::new("outcome", "error")]);
                    ResultItem::failure(request.id, e.to_string())
                }
            }
            .with_headers(inject_context(&current));

            publish(self.results.as_ref(), &outcome).await?;
            acknowledge(self.requests.as_ref(), &delivery.handle).await?;

            metrics::processing_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("stage", "worker")],
            );
            Ok(())
        }
        .instrument(span)
        .await
    }
}
