use crate::AppState;
use axum::Router;

mod home;
pub mod jobs;
pub mod patients;
pub mod studies;

pub fn routes() -> Router<AppState> {
	Router::new()
		.merge(home::routes())
		.merge(jobs::routes())
		.merge(patients::routes())
		.merge(studies::routes())
}
