//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.read_with_poll, pgmq.delete. [`PgmqQueue`] binds one queue name to
//! the [`WorkQueue`] contract.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::queue::{Delivery, MessageId, QueueSettings, ReceiptHandle, WorkQueue};
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

type MessageRow = (
    i64,
    i32,
    chrono::DateTime<chrono::Utc>,
    chrono::DateTime<chrono::Utc>,
    serde_json::Value,
);

impl From<MessageRow> for PgmqMessage {
    fn from((msg_id, read_ct, enqueued_at, vt, message): MessageRow) -> Self {
        Self {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        }
    }
}

fn record_operation(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record_operation(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(self.pool())
            .await?;
        record_operation(queue_name, "send");
        Ok(row.0)
    }

    /// Read up to `qty` messages, hiding each for `vt_seconds`.
    ///
    /// With `max_poll_seconds > 0` the read long-polls until a message
    /// arrives or the poll window closes. Returns an empty vec if the queue
    /// stays empty.
    pub async fn read_batch_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        qty: i32,
        max_poll_seconds: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let rows: Vec<MessageRow> = if max_poll_seconds > 0 {
            sqlx::query_as(
                "SELECT msg_id, read_ct, enqueued_at, vt, message
                 FROM pgmq.read_with_poll($1, $2, $3, $4, 100)",
            )
            .bind(queue_name)
            .bind(vt_seconds)
            .bind(qty)
            .bind(max_poll_seconds)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as(
                "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)",
            )
            .bind(queue_name)
            .bind(vt_seconds)
            .bind(qty)
            .fetch_all(self.pool())
            .await?
        };

        let msgs: Vec<PgmqMessage> = rows.into_iter().map(PgmqMessage::from).collect();
        record_operation(
            queue_name,
            if msgs.is_empty() { "read_empty" } else { "read" },
        );
        Ok(msgs)
    }

    /// Delete a message permanently. Returns false if it no longer exists.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_one(self.pool())
            .await?;
        record_operation(queue_name, "delete");
        Ok(row.0)
    }
}

/// One named pgmq queue behind the [`WorkQueue`] contract.
///
/// pgmq deletes by message id, so a handle only goes stale once the message
/// is gone; a redelivered message can still be deleted through an older
/// handle.
pub struct PgmqQueue {
    db: super::Db,
    name: String,
    settings: QueueSettings,
}

impl PgmqQueue {
    pub fn new(db: super::Db, name: impl Into<String>, settings: QueueSettings) -> Self {
        Self {
            db,
            name: name.into(),
            settings,
        }
    }

    /// Create the underlying pgmq queue if it does not exist yet.
    pub async fn ensure_created(&self) -> Result<()> {
        self.db.create_queue(&self.name).await
    }

    fn broker_error(&self, operation: &str, err: Error) -> Error {
        match err {
            Error::Storage(e) => Error::Queue(format!("{operation} on {}: {e}", self.name)),
            other => other,
        }
    }
}

fn whole_seconds(d: Duration) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

#[async_trait]
impl WorkQueue for PgmqQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, payload: &serde_json::Value) -> Result<MessageId> {
        self.db
            .send_to_queue(&self.name, payload)
            .await
            .map_err(|e| self.broker_error("send", e))
    }

    async fn receive_batch(&self, max_wait: Duration) -> Result<Vec<Delivery>> {
        let msgs = self
            .db
            .read_batch_from_queue(
                &self.name,
                whole_seconds(self.settings.visibility_timeout),
                i32::try_from(self.settings.batch_size.max(1)).unwrap_or(i32::MAX),
                whole_seconds(max_wait),
            )
            .await
            .map_err(|e| self.broker_error("read", e))?;

        Ok(msgs
            .into_iter()
            .map(|msg| Delivery {
                handle: ReceiptHandle {
                    msg_id: msg.msg_id,
                    receipt: u64::try_from(msg.read_ct).unwrap_or(0),
                },
                read_count: u32::try_from(msg.read_ct).unwrap_or(0),
                enqueued_at: msg.enqueued_at,
                payload: msg.message,
            })
            .collect())
    }

    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<()> {
        let deleted = self
            .db
            .delete_message(&self.name, handle.msg_id)
            .await
            .map_err(|e| self.broker_error("delete", e))?;
        if deleted {
            Ok(())
        } else {
            Err(Error::StaleHandle {
                queue: self.name.clone(),
                msg_id: handle.msg_id,
            })
        }
    }
}
