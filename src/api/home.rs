use crate::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

pub fn routes() -> Router<AppState> {
	Router::new().route("/", get(index))
}

async fn index(State(state): State<AppState>) -> impl IntoResponse {
	format!(
		"This server is running DICOM-INTAKE (v{}) as AE title {}",
		env!("CARGO_PKG_VERSION"),
		state.config.dimse.aet
	)
}
