//! The patient/study registry.
//!
//! All writes go through [`Registry::register`], one serializable write
//! transaction per received object. The single-writer transaction makes the
//! get-then-insert on the `StudyInstanceUID` key race-free, so two workers
//! registering objects of the same study concurrently can never create two
//! study rows: the loser of the commit race observes the winner's row and
//! takes the merge path.

use crate::decoder::{DecodedObject, PersonName};
use crate::types::UI;
use chrono::{DateTime, NaiveDate, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const PATIENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("patients");
const STUDIES: TableDefinition<&str, &[u8]> = TableDefinition::new("studies");

/// Status history entries retained per study; older entries are dropped.
pub const STATUS_HISTORY_LIMIT: usize = 32;

/// The workflow states a study can be in. Only [`WorkflowStatus::Received`]
/// is ever set here; every later transition belongs to the workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
	Received,
	PendingAssignment,
	Assigned,
	ReportSubmitted,
	Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
	pub status: WorkflowStatus,
	pub at: DateTime<Utc>,
	/// The object that triggered this entry, as `series/instance` UIDs.
	pub object: String,
	/// Where the object bytes are persisted.
	pub storage_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
	/// Application-level identifier, generated at creation.
	pub patient_id: Uuid,
	/// The identifier asserted by the sending device. Not globally unique,
	/// but the natural correlation key for incoming objects.
	pub source_patient_id: String,
	pub name: Option<PersonName>,
	pub sex: String,
	pub birth_date: Option<NaiveDate>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyRecord {
	pub study_instance_uid: UI,
	pub patient_id: Uuid,
	/// Grows monotonically as objects arrive; never shrinks.
	pub modalities_present: BTreeSet<String>,
	pub accession_number: String,
	pub study_date: Option<NaiveDate>,
	pub study_time: String,
	pub study_description: String,
	pub workflow_status: WorkflowStatus,
	pub status_history: Vec<StatusEntry>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// What a registration did, for the workflow engine seam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationOutcome {
	pub study_instance_uid: UI,
	pub patient_id: Uuid,
	pub created: bool,
}

#[derive(Debug, Error)]
pub enum RegistryError {
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
	#[error("Failed to encode registry record: {0}")]
	Encoding(#[from] serde_json::Error),
}

pub struct Registry {
	db: Arc<Database>,
}

impl Registry {
	pub fn new(db: Arc<Database>) -> Result<Self, RegistryError> {
		let txn = db.begin_write()?;
		{
			txn.open_table(PATIENTS)?;
			txn.open_table(STUDIES)?;
		}
		txn.commit()?;
		Ok(Self { db })
	}

	/// Registers one decoded object as a single atomic unit of work:
	/// find-or-create the patient, upsert the study, merge per-object facts.
	///
	/// Safe to repeat with the same input and safe under concurrent
	/// invocation for the same study: merges only fill empty fields and the
	/// modality set grows by union, so updates commute.
	pub fn register(
		&self,
		decoded: &DecodedObject,
		storage_ref: &str,
	) -> Result<RegistrationOutcome, RegistryError> {
		let now = Utc::now();
		let txn = self.db.begin_write()?;
		let outcome = {
			let mut patients = txn.open_table(PATIENTS)?;
			let patient_key = correlation_key(decoded);

			let existing = match patients.get(patient_key.as_str())? {
				Some(guard) => Some(serde_json::from_slice::<PatientRecord>(guard.value())?),
				None => None,
			};
			let patient_id = match existing {
				Some(mut patient) => {
					if merge_patient(&mut patient, decoded) {
						patient.updated_at = now;
						patients.insert(
							patient_key.as_str(),
							serde_json::to_vec(&patient)?.as_slice(),
						)?;
					}
					patient.patient_id
				}
				None => {
					let patient = PatientRecord {
						patient_id: Uuid::new_v4(),
						source_patient_id: decoded.source_patient_id.clone(),
						name: decoded.patient_name.clone(),
						sex: decoded.sex.clone(),
						birth_date: decoded.birth_date,
						created_at: now,
						updated_at: now,
					};
					patients.insert(
						patient_key.as_str(),
						serde_json::to_vec(&patient)?.as_slice(),
					)?;
					debug!(patient = %patient.patient_id, "Created patient record");
					patient.patient_id
				}
			};

			let mut studies = txn.open_table(STUDIES)?;
			let uid = decoded.study_instance_uid.as_str();
			let existing = match studies.get(uid)? {
				Some(guard) => Some(serde_json::from_slice::<StudyRecord>(guard.value())?),
				None => None,
			};
			let (mut study, created) = match existing {
				Some(study) => (study, false),
				None => (
					StudyRecord {
						study_instance_uid: decoded.study_instance_uid.clone(),
						patient_id,
						modalities_present: BTreeSet::new(),
						accession_number: String::new(),
						study_date: None,
						study_time: String::new(),
						study_description: String::new(),
						workflow_status: WorkflowStatus::Received,
						status_history: Vec::new(),
						created_at: now,
						updated_at: now,
					},
					true,
				),
			};

			merge_study(&mut study, decoded);
			append_history(&mut study, decoded, storage_ref, now);
			study.updated_at = now;
			studies.insert(uid, serde_json::to_vec(&study)?.as_slice())?;

			RegistrationOutcome {
				study_instance_uid: study.study_instance_uid,
				patient_id,
				created,
			}
		};
		txn.commit()?;
		Ok(outcome)
	}

	pub fn study(&self, study_instance_uid: &str) -> Result<Option<StudyRecord>, RegistryError> {
		let txn = self.db.begin_read()?;
		let studies = txn.open_table(STUDIES)?;
		match studies.get(study_instance_uid)? {
			Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
			None => Ok(None),
		}
	}

	pub fn patient(&self, source_patient_id: &str) -> Result<Option<PatientRecord>, RegistryError> {
		let txn = self.db.begin_read()?;
		let patients = txn.open_table(PATIENTS)?;
		match patients.get(source_patient_id)? {
			Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
			None => Ok(None),
		}
	}
}

/// The patient lookup key. Objects without a source patient id correlate to a
/// per-study synthetic key, so one study never fans out into multiple
/// anonymous patients.
fn correlation_key(decoded: &DecodedObject) -> String {
	if decoded.source_patient_id.is_empty() {
		format!("study:{}", decoded.study_instance_uid)
	} else {
		decoded.source_patient_id.clone()
	}
}

/// Fills empty patient fields from the decoded object. Populated fields are
/// never overwritten, whatever a later object asserts. Returns whether any
/// field changed.
fn merge_patient(patient: &mut PatientRecord, decoded: &DecodedObject) -> bool {
	let mut changed = false;
	if patient.name.is_none() && decoded.patient_name.is_some() {
		patient.name = decoded.patient_name.clone();
		changed = true;
	}
	if patient.sex.is_empty() && !decoded.sex.is_empty() {
		patient.sex = decoded.sex.clone();
		changed = true;
	}
	if patient.birth_date.is_none() && decoded.birth_date.is_some() {
		patient.birth_date = decoded.birth_date;
		changed = true;
	}
	changed
}

/// Merges per-object facts into the study: modality set union plus
/// fill-empty on the descriptive fields.
fn merge_study(study: &mut StudyRecord, decoded: &DecodedObject) {
	if !decoded.modality.is_empty() {
		study.modalities_present.insert(decoded.modality.clone());
	}
	if study.accession_number.is_empty() && !decoded.accession_number.is_empty() {
		study.accession_number = decoded.accession_number.clone();
	}
	if study.study_date.is_none() && decoded.study_date.is_some() {
		study.study_date = decoded.study_date;
	}
	if study.study_time.is_empty() && !decoded.study_time.is_empty() {
		study.study_time = decoded.study_time.clone();
	}
	if study.study_description.is_empty() && !decoded.study_description.is_empty() {
		study.study_description = decoded.study_description.clone();
	}
}

/// Appends a history entry naming the triggering object, unless the same
/// object was already recorded. The object identity alone is the dedup key:
/// a repeat delivery stays idempotent even when it was persisted under a
/// different storage reference. The history is capped by dropping the oldest
/// entries.
fn append_history(study: &mut StudyRecord, decoded: &DecodedObject, storage_ref: &str, now: DateTime<Utc>) {
	let object = format!(
		"{}/{}",
		decoded.series_instance_uid, decoded.sop_instance_uid
	);
	if study.status_history.iter().any(|entry| entry.object == object) {
		return;
	}
	study.status_history.push(StatusEntry {
		status: study.workflow_status,
		at: now,
		object,
		storage_ref: storage_ref.to_string(),
	});
	if study.status_history.len() > STATUS_HISTORY_LIMIT {
		let excess = study.status_history.len() - STATUS_HISTORY_LIMIT;
		study.status_history.drain(..excess);
	}
}
