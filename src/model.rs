//! Core data model.
//!
//! A job is one submitted expression tracked from pending to completed. Jobs
//! live in the job store; request and result items are the transient
//! messages that carry a job through the queues.

pub mod item;
pub mod job;

pub use item::{DeadLetter, Headers, RequestItem, ResultItem};
pub use job::{Job, JobId, JobStatus, NewJob};
