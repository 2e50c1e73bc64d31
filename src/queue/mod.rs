//! Work queue abstraction: at-least-once channels with visibility windows.
//!
//! A received item stays invisible to other receivers for the queue's
//! visibility window. If it is not acknowledged within that window it becomes
//! visible again and is redelivered with a higher read count. Redelivery is
//! the only retry mechanism.
//!
//! Implementations: [`crate::db::pgmq::PgmqQueue`] and [`MemoryQueue`].

pub mod memory;

pub use memory::MemoryQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Broker-assigned message id, returned by [`WorkQueue::enqueue`].
pub type MessageId = i64;

/// Per-channel receive settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// How long a received item stays hidden from other receivers.
    pub visibility_timeout: Duration,
    /// Upper bound on items returned by one receive.
    pub batch_size: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            batch_size: 10,
        }
    }
}

/// Opaque token identifying one delivery of one message.
///
/// `receipt` changes on every redelivery, so a handle obtained before the
/// item was redelivered no longer acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle {
    pub msg_id: MessageId,
    pub receipt: u64,
}

/// One received item, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: ReceiptHandle,
    /// Number of times this item has been delivered, this delivery included.
    pub read_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Delivery {
    pub fn msg_id(&self) -> MessageId {
        self.handle.msg_id
    }

    /// Deserialize the payload into a typed item.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Channel name, used in logs and dead letters.
    fn name(&self) -> &str;

    /// Append an item. It is visible to receivers once this returns.
    async fn enqueue(&self, payload: &serde_json::Value) -> Result<MessageId>;

    /// Wait up to `max_wait` for visible items and return up to the batch
    /// size of them, each hidden for the visibility window. Returns an empty
    /// batch on timeout.
    async fn receive_batch(&self, max_wait: Duration) -> Result<Vec<Delivery>>;

    /// Delete a delivered item so it is never redelivered.
    ///
    /// `Error::StaleHandle` if the item was already deleted or redelivered.
    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<()>;
}

/// Serialize `item` and enqueue it.
pub async fn publish<T>(queue: &dyn WorkQueue, item: &T) -> Result<MessageId>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_value(item)?;
    queue.enqueue(&payload).await
}
