//! Job status lookups for operators.
//!
//! Jobs are only ever created by the protocol listener; there is deliberately
//! no POST route here.

use crate::queue::{JobRecord, JobStatus};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/jobs", get(all_jobs))
		.route("/jobs/{id}", get(job_status))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResponse {
	status: JobStatus,
	attempts: u32,
	last_error: Option<String>,
}

impl From<JobRecord> for JobStatusResponse {
	fn from(record: JobRecord) -> Self {
		Self {
			status: record.status,
			attempts: record.attempts,
			last_error: record.last_error,
		}
	}
}

async fn job_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
	match state.queue.status(id) {
		Ok(Some(record)) => Json(JobStatusResponse::from(record)).into_response(),
		Ok(None) => StatusCode::NOT_FOUND.into_response(),
		Err(err) => {
			error!("Failed to look up job {id}: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
	status: Option<JobStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSummary {
	id: Uuid,
	status: JobStatus,
	attempts: u32,
}

async fn all_jobs(State(state): State<AppState>, Query(query): Query<JobsQuery>) -> Response {
	match state.queue.jobs(query.status) {
		Ok(records) => Json(
			records
				.into_iter()
				.map(|record| JobSummary {
					id: record.id,
					status: record.status,
					attempts: record.attempts,
				})
				.collect::<Vec<JobSummary>>(),
		)
		.into_response(),
		Err(err) => {
			error!("Failed to list jobs: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}
