//! Submission path: record the job, then enqueue its request.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{Instrument, error, info};

use crate::error::Result;
use crate::model::{JobId, NewJob, RequestItem};
use crate::queue::{WorkQueue, publish};
use crate::store::JobStore;
use crate::telemetry::metrics;
use crate::telemetry::pipeline::{inject_context, record_job, start_submit_span};

/// Creates jobs and hands them to the request channel.
///
/// The insert and the enqueue are not one transaction. If the enqueue fails
/// the job stays pending with no request in flight until
/// [`super::Reconciler`] re-enqueues it.
#[derive(Clone)]
pub struct Submitter {
    store: Arc<dyn JobStore>,
    requests: Arc<dyn WorkQueue>,
}

impl Submitter {
    pub fn new(store: Arc<dyn JobStore>, requests: Arc<dyn WorkQueue>) -> Self {
        Self { store, requests }
    }

    /// Create a pending job and enqueue a request item for it.
    ///
    /// A store error means nothing was enqueued. A queue error means the job
    /// exists but was not enqueued.
    pub async fn submit(&self, new: NewJob) -> Result<JobId> {
        let span = start_submit_span(&new.submitter, &new.expression);
        async move {
            let id = match self.store.create_job(new.clone()).await {
                Ok(id) => id,
                Err(e) => {
                    error!(error = %e, "job insert failed");
                    record_submitted("store_error");
                    return Err(e);
                }
            };
            let current = tracing::Span::current();
            record_job(&current, &id);

            let request = RequestItem::new(id, new.submitter, new.expression)
                .with_headers(inject_context(&current));
            match publish(self.requests.as_ref(), &request).await {
                Ok(msg_id) => {
                    info!(job_id = %id, msg_id, queue = self.requests.name(), "job submitted");
                    record_submitted("ok");
                    Ok(id)
                }
                Err(e) => {
                    error!(job_id = %id, error = %e, "job created but request not enqueued");
                    record_submitted("queue_error");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn record_submitted(result: &'static str) {
    metrics::jobs_submitted().add(1, &[KeyValue::new("result", result)]);
}
