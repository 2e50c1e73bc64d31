//! # calcq
//!
//! Asynchronous calculation pipeline. A submission is recorded as a pending
//! job in Postgres and enqueued on a pgmq request channel; an out-of-process
//! worker evaluates it and publishes the result; a completion loop writes
//! the result back to the job. Delivery is at-least-once throughout.

pub mod compute;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod telemetry;
