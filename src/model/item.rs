//! Queue item payloads.
//!
//! These are the JSON bodies carried on the request, result and dead-letter
//! channels.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Job, JobId};

/// Propagation fields carried alongside an item, e.g. W3C `traceparent`.
pub type Headers = HashMap<String, String>;

/// Work for the calculator: evaluate `expression` for job `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestItem {
    pub id: JobId,
    pub submitter: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: Headers,
}

impl RequestItem {
    pub fn new(id: JobId, submitter: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id,
            submitter: submitter.into(),
            expression: expression.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

impl From<&Job> for RequestItem {
    fn from(job: &Job) -> Self {
        Self::new(job.id, job.submitter.clone(), job.expression.clone())
    }
}

/// Outcome of one evaluation, addressed to job `id`.
///
/// Exactly one of `result` and `error` is set. A successful outcome
/// serializes as `{"id": ..., "result": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: Headers,
}

impl ResultItem {
    pub fn success(id: JobId, result: f64) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            headers: Headers::new(),
        }
    }

    pub fn failure(id: JobId, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A poison item moved off its channel, with the reason it was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Channel the item was received from.
    pub source: String,
    pub reason: String,
    /// How many times the item had been delivered.
    pub deliveries: u32,
    pub dead_lettered_at: DateTime<Utc>,
    /// Original payload, untouched.
    pub payload: serde_json::Value,
}
