//! HTTP ingress: create a calculation, look one up.
//!
//! - `POST /calculations` `{expression, submitter}` → `{id}`
//! - `GET /calculations/{id}` → the job record, 404 if unknown, 400 if `id`
//!   is not a UUID
//!
//! Failures surface as `{code, message}` with a fixed message; internal
//! error detail only goes to the log.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Error;
use crate::model::{Job, JobId, JobStatus, NewJob};
use crate::pipeline::Submitter;
use crate::store::JobStore;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn JobStore>,
    submitter: Submitter,
}

/// Build the ingress router.
pub fn router(store: Arc<dyn JobStore>, submitter: Submitter) -> Router {
    Router::new()
        .route("/calculations", post(create_calculation))
        .route("/calculations/{id}", get(get_calculation))
        .with_state(AppState { store, submitter })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCalculationRequest {
    pub expression: String,
    #[serde(alias = "student")]
    pub submitter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCalculationResponse {
    pub id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationResponse {
    pub id: JobId,
    pub submitter: String,
    pub expression: String,
    pub status: JobStatus,
    pub result: Option<f64>,
    pub created: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<Job> for CalculationResponse {
    fn from(job: Job) -> Self {
        Self {
            status: job.status(),
            id: job.id,
            submitter: job.submitter,
            expression: job.expression,
            result: job.result,
            created: job.created,
            completed: job.completed,
            error: job.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

async fn create_calculation(
    State(state): State<AppState>,
    Json(body): Json<CreateCalculationRequest>,
) -> Response {
    match state
        .submitter
        .submit(NewJob::new(body.expression, body.submitter))
        .await
    {
        Ok(id) => Json(CreateCalculationResponse { id }).into_response(),
        // The row is written before the request item is encoded and sent.
        Err(e @ (Error::Queue(_) | Error::StaleHandle { .. } | Error::Serialization(_))) => {
            error!(error = %e, "create calculation: enqueue failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "queue write failure",
            )
        }
        Err(e @ Error::Storage(_)) => {
            error!(error = %e, "create calculation: insert failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "database write failure",
            )
        }
        Err(e) => {
            error!(error = %e, "create calculation: store rejected job");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "database write failure",
            )
        }
    }
}

async fn get_calculation(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let Ok(id) = raw.parse::<JobId>() else {
        return error_response(StatusCode::BAD_REQUEST, "bad_request", "invalid calculation id");
    };
    match state.store.get_job(id).await {
        Ok(job) => Json(CalculationResponse::from(job)).into_response(),
        Err(Error::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "not_found", "calculation not found")
        }
        Err(e) => {
            error!(error = %e, job_id = %id, "get calculation failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "database read failure",
            )
        }
    }
}
