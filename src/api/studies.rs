//! Read-only study lookups for operators.

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::error;

pub fn routes() -> Router<AppState> {
	Router::new().route("/studies/{study}", get(study))
}

async fn study(State(state): State<AppState>, Path(study): Path<String>) -> Response {
	match state.registry.study(&study) {
		Ok(Some(record)) => Json(record).into_response(),
		Ok(None) => StatusCode::NOT_FOUND.into_response(),
		Err(err) => {
			error!("Failed to look up study {study}: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}
