//! In-process broker with visibility-window redelivery.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Delivery, MessageId, QueueSettings, ReceiptHandle, WorkQueue};
use crate::error::{Error, Result};

/// A queue held entirely in memory. Messages are lost with the process.
pub struct MemoryQueue {
    name: String,
    settings: QueueSettings,
    state: Mutex<State>,
    arrivals: Notify,
}

#[derive(Default)]
struct State {
    next_msg_id: MessageId,
    next_receipt: u64,
    messages: BTreeMap<MessageId, Message>,
}

struct Message {
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
    read_count: u32,
    receipt: u64,
    invisible_until: Option<Instant>,
}

impl Message {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
        }
    }

    /// Messages not yet acknowledged, in flight or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.messages.is_empty()
    }

    /// Unacknowledged payloads in enqueue order.
    pub async fn payloads(&self) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .await
            .messages
            .values()
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Take visible messages, hide them, and report when the next hidden
    /// one becomes visible again.
    async fn take_visible(&self) -> (Vec<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let hide_until = now + self.settings.visibility_timeout;
        let limit = self.settings.batch_size.max(1) as usize;

        let mut state = self.state.lock().await;
        let State {
            next_receipt,
            messages,
            ..
        } = &mut *state;

        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;
        for (&msg_id, msg) in messages.iter_mut() {
            if batch.len() < limit && msg.is_visible(now) {
                *next_receipt += 1;
                msg.receipt = *next_receipt;
                msg.read_count += 1;
                msg.invisible_until = Some(hide_until);
                batch.push(Delivery {
                    handle: ReceiptHandle {
                        msg_id,
                        receipt: msg.receipt,
                    },
                    read_count: msg.read_count,
                    enqueued_at: msg.enqueued_at,
                    payload: msg.payload.clone(),
                });
            } else if let Some(until) = msg.invisible_until.filter(|until| *until > now) {
                next_visible = Some(next_visible.map_or(until, |t| t.min(until)));
            }
        }
        (batch, next_visible)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, payload: &serde_json::Value) -> Result<MessageId> {
        let msg_id = {
            let mut state = self.state.lock().await;
            state.next_msg_id += 1;
            let msg_id = state.next_msg_id;
            state.messages.insert(
                msg_id,
                Message {
                    payload: payload.clone(),
                    enqueued_at: Utc::now(),
                    read_count: 0,
                    receipt: 0,
                    invisible_until: None,
                },
            );
            msg_id
        };
        self.arrivals.notify_waiters();
        Ok(msg_id)
    }

    async fn receive_batch(&self, max_wait: Duration) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + max_wait;
        loop {
            // Register for arrivals before looking, so an enqueue between the
            // look and the wait is not missed.
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let (batch, next_visible) = self.take_visible().await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut arrived => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        let current = state
            .messages
            .get(&handle.msg_id)
            .map(|msg| msg.receipt == handle.receipt);
        match current {
            Some(true) => {
                state.messages.remove(&handle.msg_id);
                Ok(())
            }
            _ => Err(Error::StaleHandle {
                queue: self.name.clone(),
                msg_id: handle.msg_id,
            }),
        }
    }
}
