//! Read-only patient lookups for operators, keyed by the identifier the
//! sending device asserted.

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::error;

pub fn routes() -> Router<AppState> {
	Router::new().route("/patients/{patient}", get(patient))
}

async fn patient(State(state): State<AppState>, Path(patient): Path<String>) -> Response {
	match state.registry.patient(&patient) {
		Ok(Some(record)) => Json(record).into_response(),
		Ok(None) => StatusCode::NOT_FOUND.into_response(),
		Err(err) => {
			error!("Failed to look up patient {patient}: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}
