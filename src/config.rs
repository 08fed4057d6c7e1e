use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub http: HttpServerConfig,
	pub dimse: DimseServerConfig,
	pub queue: QueueConfig,
	pub storage: StorageConfig,
}

impl AppConfig {
	/// Loads the application config by layering the embedded defaults, an
	/// optional `config.toml` next to the working directory and
	/// `DICOM_INTAKE`-prefixed environment variables.
	pub fn new() -> Result<Self, config::ConfigError> {
		let settings = config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config").required(false))
			.add_source(config::Environment::with_prefix("DICOM_INTAKE").separator("_"))
			.build()?;

		settings.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default log level. Also configurable at runtime via `RUST_LOG`.
	pub level: String,
	/// Sentry DSN. Absent or empty disables Sentry.
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HttpServerConfig {
	/// The interface the status API listens on.
	pub interface: IpAddr,
	/// The port of the status API.
	pub port: u16,
	/// Request timeout in seconds.
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimseServerConfig {
	/// The application entity title of this intake node.
	pub aet: String,
	pub interface: IpAddr,
	pub port: u16,
	/// Upper bound for incoming PDUs. Larger PDUs abort the association.
	pub max_pdu_length: u32,
	/// Seconds without peer activity before an association is aborted.
	pub idle_timeout: u64,
	/// Attempts to bind the listening socket before giving up.
	pub bind_attempts: u32,
	/// Seconds between bind attempts.
	pub bind_backoff: u64,
	/// Abstract syntaxes accepted during negotiation.
	/// An empty list accepts every proposed abstract syntax.
	pub abstract_syntaxes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
	/// Size of the ingestion worker pool.
	pub workers: usize,
	/// Maximum processing attempts per job.
	pub max_attempts: u32,
	/// Base delay in seconds for exponential retry backoff.
	pub retry_backoff: u64,
	/// Upper bound in seconds for a single backoff delay.
	pub retry_backoff_cap: u64,
	/// Seconds a single processing attempt may run before it counts as failed.
	pub processing_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
	/// Path of the embedded registry/queue database.
	pub database: PathBuf,
	/// Directory that received objects are persisted into.
	pub objects: PathBuf,
}
