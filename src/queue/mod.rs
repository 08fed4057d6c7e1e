//! The durable ingestion queue.
//!
//! One job per received object. Jobs and their payloads are persisted before
//! the listener acknowledges the sender, so an accepted object survives a
//! process restart. A bounded worker pool drains the queue; each job is
//! processed end-to-end by a single worker and retried with exponential
//! backoff until it completes, fails permanently, or exhausts its attempts.

use crate::config::QueueConfig;
use crate::types::{AE, UI};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("ingestion_jobs");
const PAYLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("ingestion_payloads");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
	Queued,
	Active,
	Completed,
	Failed,
}

/// The durable state of one ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
	pub id: Uuid,
	pub status: JobStatus,
	pub attempts: u32,
	pub last_error: Option<String>,
	/// Where the payload currently lives. Cleared once a completed job's
	/// payload has been handed to the object store and dropped from the
	/// queue; failed jobs keep theirs for operator replay.
	pub payload_ref: Option<String>,
	pub source_aet: AE,
	pub transfer_syntax: UI,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub received_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
}

/// A received object as handed over by the protocol listener.
#[derive(Debug, Clone)]
pub struct RawObject {
	pub data: Bytes,
	pub source_aet: AE,
	pub transfer_syntax: UI,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub received_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
	#[error(transparent)]
	Database(#[from] redb::DatabaseError),
	#[error(transparent)]
	Transaction(#[from] redb::TransactionError),
	#[error(transparent)]
	Table(#[from] redb::TableError),
	#[error(transparent)]
	Storage(#[from] redb::StorageError),
	#[error(transparent)]
	Commit(#[from] redb::CommitError),
	#[error("Failed to encode job record: {0}")]
	Encoding(#[from] serde_json::Error),
	#[error("Queue write task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

/// The outcome classification of one processing attempt.
#[derive(Debug, Error)]
pub enum ProcessError {
	/// Retrying cannot help, e.g. an undecodable object.
	#[error("permanent failure: {0}")]
	Permanent(anyhow::Error),
	/// Worth retrying, e.g. a store connectivity blip.
	#[error("transient failure: {0}")]
	Transient(anyhow::Error),
}

/// Processes one claimed job end-to-end: decode, persist, register.
#[async_trait]
pub trait JobProcessor: Send + Sync {
	async fn process(&self, job: &JobRecord, payload: Bytes) -> Result<(), ProcessError>;
}

#[derive(Clone)]
pub struct IngestionQueue {
	inner: Arc<QueueInner>,
}

struct QueueInner {
	db: Arc<Database>,
	config: QueueConfig,
	dispatch: mpsc::UnboundedSender<Uuid>,
	claims: Mutex<mpsc::UnboundedReceiver<Uuid>>,
}

impl IngestionQueue {
	pub fn new(db: Arc<Database>, config: QueueConfig) -> Result<Self, QueueError> {
		// Create the tables up front so reads never race table creation.
		let txn = db.begin_write()?;
		{
			txn.open_table(JOBS)?;
			txn.open_table(PAYLOADS)?;
		}
		txn.commit()?;

		let (dispatch, claims) = mpsc::unbounded_channel();
		Ok(Self {
			inner: Arc::new(QueueInner {
				db,
				config,
				dispatch,
				claims: Mutex::new(claims),
			}),
		})
	}

	/// Durably accepts a received object and returns its job id.
	///
	/// The job row and payload are committed before this returns, so a
	/// success acknowledgment to the sender is backed by storage.
	/// Processing happens asynchronously on the worker pool.
	pub async fn enqueue(&self, raw: RawObject) -> Result<Uuid, QueueError> {
		let id = Uuid::new_v4();
		let job = JobRecord {
			id,
			status: JobStatus::Queued,
			attempts: 0,
			last_error: None,
			payload_ref: Some(format!("payload:{id}")),
			source_aet: raw.source_aet,
			transfer_syntax: raw.transfer_syntax,
			sop_class_uid: raw.sop_class_uid,
			sop_instance_uid: raw.sop_instance_uid,
			received_at: raw.received_at,
			created_at: Utc::now(),
		};

		let db = Arc::clone(&self.inner.db);
		let payload = raw.data;
		tokio::task::spawn_blocking(move || -> Result<(), QueueError> {
			let txn = db.begin_write()?;
			{
				let mut jobs = txn.open_table(JOBS)?;
				jobs.insert(job.id.to_string().as_str(), serde_json::to_vec(&job)?.as_slice())?;
				let mut payloads = txn.open_table(PAYLOADS)?;
				payloads.insert(job.id.to_string().as_str(), payload.as_ref())?;
			}
			txn.commit()?;
			Ok(())
		})
		.await??;

		if self.inner.dispatch.send(id).is_err() {
			// The job is durable either way; it will be re-dispatched by
			// recover() after a restart.
			warn!(job = %id, "No worker pool is draining the queue");
		}
		debug!(job = %id, "Enqueued ingestion job");
		Ok(id)
	}

	/// Looks up the durable state of a job.
	pub fn status(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
		let txn = self.inner.db.begin_read()?;
		let jobs = txn.open_table(JOBS)?;
		let Some(guard) = jobs.get(id.to_string().as_str())? else {
			return Ok(None);
		};
		Ok(Some(serde_json::from_slice(guard.value())?))
	}

	/// Lists jobs, optionally narrowed to one status. Operator use.
	pub fn jobs(&self, filter: Option<JobStatus>) -> Result<Vec<JobRecord>, QueueError> {
		let txn = self.inner.db.begin_read()?;
		let jobs = txn.open_table(JOBS)?;

		let mut records = Vec::new();
		for entry in jobs.iter()? {
			let (_, value) = entry?;
			let record: JobRecord = serde_json::from_slice(value.value())?;
			if filter.is_none_or(|status| record.status == status) {
				records.push(record);
			}
		}
		Ok(records)
	}

	/// Re-dispatches jobs left Queued or Active by a previous process.
	/// An Active job counts as an interrupted attempt (at-least-once).
	pub fn recover(&self) -> Result<usize, QueueError> {
		let mut recovered = 0;
		for record in self.jobs(None)? {
			if matches!(record.status, JobStatus::Queued | JobStatus::Active)
				&& self.inner.dispatch.send(record.id).is_ok()
			{
				recovered += 1;
			}
		}
		if recovered > 0 {
			info!("Recovered {recovered} unfinished ingestion jobs");
		}
		Ok(recovered)
	}

	/// Spawns the bounded worker pool. Each worker claims one job at a time
	/// and processes it exclusively; different jobs run concurrently.
	pub fn spawn_workers(&self, processor: Arc<dyn JobProcessor>) {
		for worker in 0..self.inner.config.workers {
			let queue = self.clone();
			let processor = Arc::clone(&processor);
			let span = info_span!("ingestion-worker", worker);
			tokio::spawn(
				async move {
					loop {
						let claimed = {
							let mut claims = queue.inner.claims.lock().await;
							claims.recv().await
						};
						let Some(job_id) = claimed else {
							break;
						};
						if let Err(err) = queue.process_job(job_id, processor.as_ref()).await {
							error!(job = %job_id, "Job bookkeeping failed: {err}");
						}
					}
				}
				.instrument(span),
			);
		}
	}

	async fn process_job(
		&self,
		id: Uuid,
		processor: &dyn JobProcessor,
	) -> Result<(), QueueError> {
		let Some(mut job) = self.status(id)? else {
			warn!(job = %id, "Claimed job no longer exists");
			return Ok(());
		};
		if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
			// Replays can hand out finished jobs, e.g. after recovery.
			return Ok(());
		}
		let Some(payload) = self.payload(id)? else {
			job.status = JobStatus::Failed;
			job.last_error = Some(String::from("job payload is missing"));
			return self.persist(job).await;
		};

		let timeout = Duration::from_secs(self.inner.config.processing_timeout);
		loop {
			job.attempts += 1;
			job.status = JobStatus::Active;
			self.persist(job.clone()).await?;

			let attempt = tokio::time::timeout(timeout, processor.process(&job, payload.clone()));
			let error = match attempt.await {
				Ok(Ok(())) => {
					job.status = JobStatus::Completed;
					debug!(job = %id, attempts = job.attempts, "Job completed");
					return self.finish(job).await;
				}
				Ok(Err(ProcessError::Permanent(err))) => {
					job.status = JobStatus::Failed;
					job.last_error = Some(err.to_string());
					warn!(job = %id, "Job failed permanently: {err}");
					return self.persist(job).await;
				}
				Ok(Err(ProcessError::Transient(err))) => err.to_string(),
				Err(_) => format!(
					"processing attempt timed out after {}s",
					self.inner.config.processing_timeout
				),
			};

			job.last_error = Some(error);
			if job.attempts >= self.inner.config.max_attempts {
				job.status = JobStatus::Failed;
				warn!(
					job = %id,
					attempts = job.attempts,
					"Job failed after exhausting retries: {:?}",
					job.last_error
				);
				return self.persist(job).await;
			}

			// Retrying re-enters the queued state until the next attempt.
			job.status = JobStatus::Queued;
			self.persist(job.clone()).await?;
			tokio::time::sleep(self.backoff(job.attempts)).await;
		}
	}

	fn backoff(&self, attempts: u32) -> Duration {
		let exponent = attempts.saturating_sub(1).min(16);
		let delay = self
			.inner
			.config
			.retry_backoff
			.saturating_mul(1 << exponent)
			.min(self.inner.config.retry_backoff_cap);
		Duration::from_secs(delay)
	}

	fn payload(&self, id: Uuid) -> Result<Option<Bytes>, QueueError> {
		let txn = self.inner.db.begin_read()?;
		let payloads = txn.open_table(PAYLOADS)?;
		let Some(guard) = payloads.get(id.to_string().as_str())? else {
			return Ok(None);
		};
		Ok(Some(Bytes::copy_from_slice(guard.value())))
	}

	async fn persist(&self, job: JobRecord) -> Result<(), QueueError> {
		let db = Arc::clone(&self.inner.db);
		tokio::task::spawn_blocking(move || -> Result<(), QueueError> {
			let txn = db.begin_write()?;
			{
				let mut jobs = txn.open_table(JOBS)?;
				jobs.insert(job.id.to_string().as_str(), serde_json::to_vec(&job)?.as_slice())?;
			}
			txn.commit()?;
			Ok(())
		})
		.await?
	}

	/// Persists the final job state and drops the payload in one transaction.
	async fn finish(&self, mut job: JobRecord) -> Result<(), QueueError> {
		job.payload_ref = None;
		let db = Arc::clone(&self.inner.db);
		tokio::task::spawn_blocking(move || -> Result<(), QueueError> {
			let txn = db.begin_write()?;
			{
				let mut jobs = txn.open_table(JOBS)?;
				jobs.insert(job.id.to_string().as_str(), serde_json::to_vec(&job)?.as_slice())?;
				let mut payloads = txn.open_table(PAYLOADS)?;
				payloads.remove(job.id.to_string().as_str())?;
			}
			txn.commit()?;
			Ok(())
		})
		.await?
	}
}
