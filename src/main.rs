pub(crate) mod api;
pub(crate) mod config;
pub(crate) mod decoder;
pub(crate) mod dimse;
pub(crate) mod queue;
pub(crate) mod registrar;
pub(crate) mod registry;
pub(crate) mod storage;
pub(crate) mod types;

use crate::config::{AppConfig, HttpServerConfig};
use crate::dimse::StoreServiceClassProvider;
use crate::queue::IngestionQueue;
use crate::registrar::{LoggingWorkflowSink, StudyRegistrar};
use crate::registry::Registry;
use crate::storage::FilesystemStore;
use axum::extract::Request;
use axum::response::Response;
use redb::Database;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace;
use tracing::{error, info, level_filters::LevelFilter, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The implementation class UID for DICOM-INTAKE.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.137287659837923851264519433801569441826";

/// The implementation version name for DICOM-INTAKE, at most 16 characters
/// as required for the user information item.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("INTAKE-", env!("CARGO_PKG_VERSION"));

fn init_logger(level: LevelFilter) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(level.into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

#[derive(Clone)]
pub struct AppState {
	pub config: AppConfig,
	pub queue: IngestionQueue,
	pub registry: Arc<Registry>,
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level.parse()?);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if let Err(error) = run(config).await {
				error!("Failed to start application due to error: {error}");
			}
		});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	if let Some(parent) = config.storage.database.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	let db = Arc::new(Database::create(&config.storage.database)?);
	let registry = Arc::new(Registry::new(Arc::clone(&db))?);
	let store = Arc::new(FilesystemStore::create(&config.storage.objects).await?);

	let queue = IngestionQueue::new(db, config.queue.clone())?;
	let registrar = Arc::new(StudyRegistrar::new(
		Arc::clone(&registry),
		store,
		Arc::new(LoggingWorkflowSink),
	));
	queue.spawn_workers(registrar);
	queue.recover()?;

	let storescp = StoreServiceClassProvider::bind(queue.clone(), config.dimse.clone()).await?;
	tokio::spawn(async move {
		if let Err(err) = storescp.serve().await {
			error!("Store Service Class Provider terminated: {err}");
			// Unrecoverable error - exit the process
			std::process::exit(-1);
		}
	});

	let app_state = AppState {
		config: config.clone(),
		queue,
		registry,
	};

	let app = api::routes()
		.layer(CorsLayer::permissive())
		.layer(axum::middleware::from_fn(add_common_headers))
		.layer(
			tower_http::trace::TraceLayer::new_for_http()
				.make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
				.on_request(trace::DefaultOnRequest::new().level(Level::INFO))
				.on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
		)
		.layer(TimeoutLayer::new(Duration::from_secs(
			config.http.request_timeout,
		)))
		.with_state(app_state);

	let HttpServerConfig {
		interface: host,
		port,
		..
	} = config.http;
	let addr = SocketAddr::from((host, port));
	let listener = TcpListener::bind(addr).await?;

	info!("Started job status API on http://{addr}");
	if config.http.graceful_shutdown {
		axum::serve(listener, app)
			.with_graceful_shutdown(shutdown_signal())
			.await?;
	} else {
		axum::serve(listener, app).await?;
	}

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async { signal::ctrl_c().await.unwrap() };

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.unwrap()
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

async fn add_common_headers(req: Request, next: axum::middleware::Next) -> Response {
	let mut response = next.run(req).await;
	let server_name = concat!("DICOM-INTAKE/", env!("CARGO_PKG_VERSION"));
	let headers = response.headers_mut();
	headers.insert("Server", axum::http::HeaderValue::from_static(server_name));
	response
}
