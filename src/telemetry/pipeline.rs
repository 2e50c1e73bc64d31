//! Span helpers for the submission path and the consuming loops.
//!
//! Field names follow the OpenTelemetry messaging conventions where one
//! exists (`messaging.*`). Trace context crosses the queues as W3C
//! `traceparent`/`tracestate` entries in an item's `headers`, so the worker
//! and completion spans for a job join the trace its submission started.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::model::{Headers, JobId};
use crate::queue::Delivery;

/// Start a span for creating and enqueueing one job.
///
/// `job.id` is declared empty and filled in by [`record_job`] once the store
/// has assigned it.
pub fn start_submit_span(submitter: &str, expression: &str) -> Span {
    tracing::info_span!(
        "job.submit",
        "messaging.operation.type" = "send",
        "job.submitter" = submitter,
        "job.expression" = expression,
        "job.id" = tracing::field::Empty,
    )
}

/// Start a consumer span for one received queue item, continuing the trace
/// carried in the item's `headers` when there is one.
pub fn start_process_span(queue: &str, delivery: &Delivery) -> Span {
    let span = tracing::info_span!(
        "queue.process",
        "messaging.operation.type" = "process",
        "messaging.destination.name" = queue,
        "messaging.message.id" = delivery.msg_id(),
        "messaging.delivery_count" = delivery.read_count,
        "job.id" = tracing::field::Empty,
    );
    let headers = delivery_headers(delivery);
    if !headers.is_empty() {
        let _ = span.set_parent(extract_context(&headers));
    }
    span
}

/// Record the job a span is about.
pub fn record_job(span: &Span, id: &JobId) {
    span.record("job.id", tracing::field::display(id));
}

/// W3C trace context of `span`, for attaching to an outgoing item.
///
/// Empty when no OpenTelemetry layer is installed.
pub fn inject_context(span: &Span) -> Headers {
    let mut headers = Headers::new();
    TraceContextPropagator::new().inject_context(&span.context(), &mut headers);
    headers
}

/// Parent context described by an item's headers.
pub fn extract_context(headers: &Headers) -> opentelemetry::Context {
    TraceContextPropagator::new().extract(headers)
}

/// Headers of a raw delivery, read before the payload is decoded so that
/// malformed items are still traced.
fn delivery_headers(delivery: &Delivery) -> Headers {
    delivery
        .payload
        .get("headers")
        .and_then(|v| v.as_object())
        .map(|fields| {
            fields
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
