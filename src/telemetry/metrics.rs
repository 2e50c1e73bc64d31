//! Metric instrument factories for calcq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without one (tests, no OTLP endpoint) the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("calcq")
}

/// Counter: submissions. Labels: `result` ("ok" | "store_error" | "queue_error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("calcq.jobs.submitted")
        .with_description("Number of job submissions")
        .build()
}

/// Counter: jobs reaching a terminal state in the store.
/// Labels: `outcome` ("completed" | "failed").
pub fn jobs_resolved() -> Counter<u64> {
    meter()
        .u64_counter("calcq.jobs.resolved")
        .with_description("Number of jobs completed or failed")
        .build()
}

/// Counter: expressions evaluated by the worker.
/// Labels: `outcome` ("ok" | "error").
pub fn evaluations() -> Counter<u64> {
    meter()
        .u64_counter("calcq.worker.evaluations")
        .with_description("Number of expressions evaluated")
        .build()
}

/// Counter: queue-level operations (create, send, read, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("calcq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: poison items moved to the dead-letter channel.
/// Labels: `queue` (source channel), `reason`.
pub fn items_dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("calcq.queue.dead_lettered")
        .with_description("Number of items moved to the dead-letter channel")
        .build()
}

/// Counter: stale acknowledgments tolerated by a loop. Labels: `queue`.
pub fn stale_acknowledgments() -> Counter<u64> {
    meter()
        .u64_counter("calcq.queue.stale_acks")
        .with_description("Acknowledgments that found the item already gone or redelivered")
        .build()
}

/// Counter: request items re-enqueued by the reconciliation sweep.
pub fn jobs_requeued() -> Counter<u64> {
    meter()
        .u64_counter("calcq.jobs.requeued")
        .with_description("Pending jobs re-enqueued by reconciliation")
        .build()
}

/// Histogram: per-item processing duration in milliseconds.
/// Labels: `stage` ("worker" | "completion").
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("calcq.item.duration_ms")
        .with_description("Queue item processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
