//! The asynchronous job pipeline.
//!
//! ```text
//! submit ──► job store (pending) + request queue
//!                          │
//!                      Worker: evaluate ──► result queue
//!                                               │
//!                              CompletionLoop: update job store (completed)
//! ```
//!
//! Both loops acknowledge an item only after the side effect it guards has
//! succeeded, so a crash in between leads to redelivery and a harmless
//! repeat. Items that can never be processed go to the dead-letter channel
//! instead of cycling forever.

pub mod completion;
pub mod reconcile;
pub mod submit;
pub mod worker;

pub use completion::CompletionLoop;
pub use reconcile::Reconciler;
pub use submit::Submitter;
pub use worker::Worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::warn;

use crate::error::Result;
use crate::model::DeadLetter;
use crate::queue::{Delivery, ReceiptHandle, WorkQueue, publish};
use crate::telemetry::metrics;

/// Settings shared by the consuming loops.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Upper bound on one blocking receive.
    pub receive_wait: Duration,
    /// Deliveries allowed before an item is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_secs(10),
            max_deliveries: 5,
        }
    }
}

/// Moves poison items to the dead-letter channel.
#[derive(Clone)]
pub struct DeadLetterPolicy {
    dead_letters: Arc<dyn WorkQueue>,
    max_deliveries: u32,
}

impl DeadLetterPolicy {
    pub fn new(dead_letters: Arc<dyn WorkQueue>, max_deliveries: u32) -> Self {
        Self {
            dead_letters,
            max_deliveries,
        }
    }

    /// The item has been delivered more often than allowed.
    pub fn exhausted(&self, delivery: &Delivery) -> bool {
        delivery.read_count > self.max_deliveries
    }

    /// Copy the item to the dead-letter channel, then remove it from `source`.
    ///
    /// If the copy fails the original stays on `source` and will be
    /// redelivered.
    pub async fn quarantine(
        &self,
        source: &dyn WorkQueue,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<()> {
        let letter = DeadLetter {
            source: source.name().to_string(),
            reason: reason.to_string(),
            deliveries: delivery.read_count,
            dead_lettered_at: Utc::now(),
            payload: delivery.payload.clone(),
        };
        publish(self.dead_letters.as_ref(), &letter).await?;

        warn!(
            queue = source.name(),
            msg_id = delivery.msg_id(),
            deliveries = delivery.read_count,
            reason,
            "item dead-lettered"
        );
        metrics::items_dead_lettered().add(
            1,
            &[
                KeyValue::new("queue", source.name().to_string()),
                KeyValue::new("reason", reason_label(reason)),
            ],
        );

        acknowledge(source, &delivery.handle).await
    }
}

fn reason_label(reason: &str) -> &'static str {
    if reason.starts_with("exceeded") {
        "redeliveries"
    } else if reason.starts_with("malformed") {
        "malformed"
    } else {
        "unprocessable"
    }
}

/// Acknowledge a delivery, tolerating a stale handle.
///
/// A stale handle means the item was already deleted or redelivered to a
/// slower consumer; the side effect it guarded has happened either way.
pub(crate) async fn acknowledge(queue: &dyn WorkQueue, handle: &ReceiptHandle) -> Result<()> {
    match queue.acknowledge(handle).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_stale_handle() => {
            warn!(queue = queue.name(), msg_id = handle.msg_id, "stale acknowledgment ignored");
            metrics::stale_acknowledgments()
                .add(1, &[KeyValue::new("queue", queue.name().to_string())]);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
