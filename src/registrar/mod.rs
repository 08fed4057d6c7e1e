//! The study registrar: turns queued objects into registry state.
//!
//! One worker invocation per job: decode the identifier record, persist the
//! object bytes, then run the registry's atomic upsert. Decode problems are
//! permanent (the bytes will not improve on retry); store and registry
//! problems are transient and retried by the queue.

use crate::decoder;
use crate::queue::{JobProcessor, JobRecord, ProcessError};
use crate::registry::{RegistrationOutcome, Registry};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, instrument};

/// Consumes `{studyId, patientId, created}` notifications after each commit.
/// The workflow engine hangs off this seam; the default sink just logs.
#[async_trait]
pub trait WorkflowSink: Send + Sync {
	async fn study_registered(&self, outcome: &RegistrationOutcome);
}

pub struct LoggingWorkflowSink;

#[async_trait]
impl WorkflowSink for LoggingWorkflowSink {
	async fn study_registered(&self, outcome: &RegistrationOutcome) {
		info!(
			study_instance_uid = outcome.study_instance_uid,
			patient_id = %outcome.patient_id,
			created = outcome.created,
			"Registered object"
		);
	}
}

pub struct StudyRegistrar {
	registry: Arc<Registry>,
	store: Arc<dyn ObjectStore>,
	sink: Arc<dyn WorkflowSink>,
}

impl StudyRegistrar {
	pub fn new(
		registry: Arc<Registry>,
		store: Arc<dyn ObjectStore>,
		sink: Arc<dyn WorkflowSink>,
	) -> Self {
		Self {
			registry,
			store,
			sink,
		}
	}
}

#[async_trait]
impl JobProcessor for StudyRegistrar {
	#[instrument(skip_all, fields(job = %job.id))]
	async fn process(&self, job: &JobRecord, payload: Bytes) -> Result<(), ProcessError> {
		let decoded = decoder::decode(&payload, &job.transfer_syntax)
			.map_err(|err| ProcessError::Permanent(err.into()))?;

		// Keyed by the object identity: retried attempts and re-deliveries of
		// the same instance resolve to the same stored file and reference.
		let mut storage_key = decoded.sop_instance_uid.clone();
		if storage_key.is_empty() {
			storage_key = job.sop_instance_uid.clone();
		}
		if storage_key.is_empty() {
			storage_key = job.id.to_string();
		}
		let storage_ref = self
			.store
			.put(&storage_key, &payload)
			.await
			.map_err(|err| ProcessError::Transient(err.into()))?;

		let registry = Arc::clone(&self.registry);
		let outcome = tokio::task::spawn_blocking(move || registry.register(&decoded, &storage_ref))
			.await
			.map_err(|err| ProcessError::Transient(err.into()))?
			.map_err(|err| ProcessError::Transient(err.into()))?;

		self.sink.study_registered(&outcome).await;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::queue::{IngestionQueue, JobStatus, RawObject};
	use crate::registry::WorkflowStatus;
	use crate::storage::FilesystemStore;
	use bytes::{BufMut, BytesMut};
	use chrono::Utc;
	use dicom_core::Tag;
	use dicom_dictionary_std::{tags, uids};
	use redb::Database;
	use std::time::Duration;
	use uuid::Uuid;

	fn put_implicit(buf: &mut BytesMut, tag: Tag, value: &[u8]) {
		buf.put_u16_le(tag.group());
		buf.put_u16_le(tag.element());
		buf.put_u32_le(u32::try_from(value.len()).unwrap());
		buf.put_slice(value);
	}

	fn object(study_uid: &str, modality: &str, patient_id: &str, sop_uid: &str) -> Bytes {
		let mut buf = BytesMut::new();
		put_implicit(&mut buf, tags::SOP_INSTANCE_UID, sop_uid.as_bytes());
		put_implicit(&mut buf, tags::MODALITY, modality.as_bytes());
		put_implicit(&mut buf, tags::PATIENT_NAME, b"DOE^JANE");
		put_implicit(&mut buf, tags::PATIENT_ID, patient_id.as_bytes());
		put_implicit(&mut buf, tags::STUDY_INSTANCE_UID, study_uid.as_bytes());
		buf.freeze()
	}

	struct Harness {
		queue: IngestionQueue,
		registry: Arc<Registry>,
		_dir: tempfile::TempDir,
	}

	async fn harness() -> Harness {
		let dir = tempfile::tempdir().unwrap();
		let db = Arc::new(Database::create(dir.path().join("intake.redb")).unwrap());
		let registry = Arc::new(Registry::new(Arc::clone(&db)).unwrap());
		let store = Arc::new(
			FilesystemStore::create(dir.path().join("objects"))
				.await
				.unwrap(),
		);
		let queue = IngestionQueue::new(
			db,
			crate::config::QueueConfig {
				workers: 2,
				max_attempts: 3,
				retry_backoff: 0,
				retry_backoff_cap: 0,
				processing_timeout: 5,
			},
		)
		.unwrap();
		queue.spawn_workers(Arc::new(StudyRegistrar::new(
			Arc::clone(&registry),
			store,
			Arc::new(LoggingWorkflowSink),
		)));
		Harness {
			queue,
			registry,
			_dir: dir,
		}
	}

	fn raw(data: Bytes) -> RawObject {
		RawObject {
			data,
			source_aet: String::from("MODALITY1"),
			transfer_syntax: String::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
			sop_class_uid: String::from(uids::CT_IMAGE_STORAGE),
			sop_instance_uid: String::from("1.2.3.4"),
			received_at: Utc::now(),
		}
	}

	async fn wait_for_status(queue: &IngestionQueue, id: Uuid, status: JobStatus) -> JobRecord {
		for _ in 0..200 {
			let record = queue.status(id).unwrap().expect("job exists");
			if record.status == status {
				return record;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("job {id} never reached {status:?}");
	}

	#[tokio::test]
	async fn concurrent_objects_coalesce_into_one_study() {
		let harness = harness().await;

		let first = harness
			.queue
			.enqueue(raw(object("1.2.3", "CT", "P1", "1.2.3.1")))
			.await
			.unwrap();
		let second = harness
			.queue
			.enqueue(raw(object("1.2.3", "MR", "P1", "1.2.3.2")))
			.await
			.unwrap();

		wait_for_status(&harness.queue, first, JobStatus::Completed).await;
		wait_for_status(&harness.queue, second, JobStatus::Completed).await;

		let study = harness.registry.study("1.2.3").unwrap().unwrap();
		let modalities: Vec<_> = study.modalities_present.iter().cloned().collect();
		assert_eq!(modalities, vec!["CT", "MR"]);
		assert_eq!(study.workflow_status, WorkflowStatus::Received);

		let patient = harness.registry.patient("P1").unwrap().unwrap();
		assert_eq!(patient.patient_id, study.patient_id);
	}

	#[tokio::test]
	async fn object_without_study_uid_fails_permanently() {
		let harness = harness().await;

		let mut buf = BytesMut::new();
		put_implicit(&mut buf, tags::PATIENT_ID, b"P1");
		let id = harness.queue.enqueue(raw(buf.freeze())).await.unwrap();

		let record = wait_for_status(&harness.queue, id, JobStatus::Failed).await;
		assert_eq!(record.attempts, 1);
		assert!(record.last_error.unwrap().contains("StudyInstanceUID"));
	}
}
