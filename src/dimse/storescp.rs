//! The Store Service Class Provider: accepts pushed objects over DIMSE.

use crate::config::DimseServerConfig;
use crate::dimse::association::{Action, Association, ReceivedObject};
use crate::dimse::command::{STATUS_OUT_OF_RESOURCES, STATUS_SUCCESS};
use crate::queue::{IngestionQueue, RawObject};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
	listener: TcpListener,
}

struct InnerStoreServiceClassProvider {
	queue: IngestionQueue,
	config: DimseServerConfig,
}

impl StoreServiceClassProvider {
	/// Binds the listening socket, retrying with a fixed backoff while the
	/// address is still in use (e.g. right after a restart).
	pub async fn bind(queue: IngestionQueue, config: DimseServerConfig) -> anyhow::Result<Self> {
		let address = SocketAddr::from((config.interface, config.port));

		let mut attempt = 0;
		let listener = loop {
			attempt += 1;
			match TcpListener::bind(&address).await {
				Ok(listener) => break listener,
				Err(err) if attempt < config.bind_attempts => {
					warn!("Failed to bind {address} (attempt {attempt}): {err}");
					tokio::time::sleep(Duration::from_secs(config.bind_backoff)).await;
				}
				Err(err) => return Err(err.into()),
			}
		};

		info!(
			"Started Store Service Class Provider on {}",
			listener.local_addr()?
		);
		Ok(Self {
			inner: Arc::new(InnerStoreServiceClassProvider { queue, config }),
			listener,
		})
	}

	/// The actual listening address, useful when port 0 was configured.
	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	pub async fn serve(&self) -> anyhow::Result<()> {
		loop {
			match self.listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!(
						"association",
						aet = &self.inner.config.aet,
						peer = peer.to_string()
					);
					info!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					tokio::spawn(async move {
						if let Err(err) = Self::process(stream, inner).instrument(span).await {
							error!("{err}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	#[instrument(skip_all)]
	async fn process(
		mut stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let mut association = Association::new(inner.config.clone());
		let idle_timeout = Duration::from_secs(inner.config.idle_timeout);
		let mut chunk = [0u8; 8192];

		loop {
			let actions = match tokio::time::timeout(idle_timeout, stream.read(&mut chunk)).await {
				Ok(Ok(0)) => {
					debug!(state = ?association.state(), "Peer closed the connection");
					return Ok(());
				}
				Ok(Ok(n)) => association.handle_input(&chunk[..n]),
				Ok(Err(err)) => {
					// No partial object ever reaches the queue; the
					// association state is simply dropped.
					debug!("Socket error, closing association: {err}");
					return Ok(());
				}
				Err(_) => {
					warn!(
						"No activity for {}s, aborting association",
						inner.config.idle_timeout
					);
					association.abort_locally()
				}
			};

			for action in actions {
				match action {
					Action::Reply(bytes) => stream.write_all(&bytes).await?,
					Action::Store(object) => {
						let ack = Self::intake(&inner, &association, &object).await;
						stream.write_all(&ack).await?;
					}
					Action::Shutdown => {
						stream.shutdown().await.ok();
						return Ok(());
					}
				}
			}
		}
	}

	/// Hands a reassembled object to the ingestion queue and builds the
	/// per-object acknowledgment. Acceptance by the durable queue is enough
	/// to acknowledge success; registration failures surface on the job, not
	/// on this association.
	async fn intake(
		inner: &InnerStoreServiceClassProvider,
		association: &Association,
		object: &ReceivedObject,
	) -> bytes::Bytes {
		let raw = RawObject {
			data: object.data.clone(),
			source_aet: association.calling_aet().to_string(),
			transfer_syntax: object.transfer_syntax.clone(),
			sop_class_uid: object.sop_class_uid.clone(),
			sop_instance_uid: object.sop_instance_uid.clone(),
			received_at: chrono::Utc::now(),
		};

		match inner.queue.enqueue(raw).await {
			Ok(job) => {
				debug!(
					sop_instance_uid = object.sop_instance_uid,
					job = %job,
					"Queued received object"
				);
				association.acknowledge(object, STATUS_SUCCESS)
			}
			Err(err) => {
				error!("Failed to queue received object: {err}");
				association.acknowledge(object, STATUS_OUT_OF_RESOURCES)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::QueueConfig;
	use crate::dimse::command::{CommandSet, COMMAND_FIELD_C_STORE_RQ};
	use crate::dimse::pdu::{
		AssociateRq, Pdu, PresentationDataValue, ProposedPresentationContext,
		DICOM_APPLICATION_CONTEXT,
	};
	use crate::queue::JobStatus;
	use crate::registrar::{LoggingWorkflowSink, StudyRegistrar};
	use crate::registry::Registry;
	use crate::storage::FilesystemStore;
	use bytes::{BufMut, Bytes, BytesMut};
	use dicom_core::Tag;
	use dicom_dictionary_std::{tags, uids};
	use redb::Database;
	use std::net::{IpAddr, Ipv4Addr};
	use tokio::io::AsyncReadExt;
	use tokio::net::TcpStream;

	fn put_implicit(buf: &mut BytesMut, tag: Tag, value: &[u8]) {
		buf.put_u16_le(tag.group());
		buf.put_u16_le(tag.element());
		buf.put_u32_le(u32::try_from(value.len()).unwrap());
		buf.put_slice(value);
	}

	fn store_command(message_id: u16, sop_instance_uid: &str) -> Bytes {
		let mut body = BytesMut::new();
		put_implicit(&mut body, tags::AFFECTED_SOP_CLASS_UID, uids::CT_IMAGE_STORAGE.as_bytes());
		put_implicit(&mut body, tags::COMMAND_FIELD, &COMMAND_FIELD_C_STORE_RQ.to_le_bytes());
		put_implicit(&mut body, tags::MESSAGE_ID, &message_id.to_le_bytes());
		put_implicit(&mut body, tags::COMMAND_DATA_SET_TYPE, &0x0102u16.to_le_bytes());
		put_implicit(&mut body, tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid.as_bytes());

		let mut command = BytesMut::new();
		put_implicit(&mut command, tags::COMMAND_GROUP_LENGTH, &u32::try_from(body.len()).unwrap().to_le_bytes());
		command.extend_from_slice(&body);
		command.freeze()
	}

	fn data_set(study_uid: &str, modality: &str, patient_id: &str, sop_uid: &str) -> Bytes {
		let mut buf = BytesMut::new();
		put_implicit(&mut buf, tags::SOP_INSTANCE_UID, sop_uid.as_bytes());
		put_implicit(&mut buf, tags::MODALITY, modality.as_bytes());
		put_implicit(&mut buf, tags::PATIENT_ID, patient_id.as_bytes());
		put_implicit(&mut buf, tags::STUDY_INSTANCE_UID, study_uid.as_bytes());
		buf.freeze()
	}

	async fn read_pdu(stream: &mut TcpStream, buf: &mut BytesMut) -> Pdu {
		loop {
			if let Some(pdu) = Pdu::decode(buf, 1 << 20).unwrap() {
				return pdu;
			}
			let mut chunk = [0u8; 4096];
			let n = stream.read(&mut chunk).await.unwrap();
			assert!(n > 0, "peer closed the connection mid-PDU");
			buf.extend_from_slice(&chunk[..n]);
		}
	}

	#[tokio::test]
	async fn store_roundtrip_registers_study() {
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
			QueueConfig {
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

		let config = DimseServerConfig {
			aet: String::from("DICOM-INTAKE"),
			interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 0,
			max_pdu_length: 262_144,
			idle_timeout: 10,
			bind_attempts: 1,
			bind_backoff: 1,
			abstract_syntaxes: Vec::new(),
		};
		let provider = StoreServiceClassProvider::bind(queue.clone(), config)
			.await
			.unwrap();
		let addr = provider.local_addr().unwrap();
		tokio::spawn(async move { provider.serve().await });

		let mut stream = TcpStream::connect(addr).await.unwrap();
		let mut buf = BytesMut::new();

		// Associate.
		let rq = Pdu::AssociateRq(AssociateRq {
			called_aet: String::from("DICOM-INTAKE"),
			calling_aet: String::from("MODALITY1"),
			application_context: String::from(DICOM_APPLICATION_CONTEXT),
			presentation_contexts: vec![ProposedPresentationContext {
				id: 1,
				abstract_syntax: String::from(uids::CT_IMAGE_STORAGE),
				transfer_syntaxes: vec![String::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			}],
			max_pdu_length: Some(16384),
		});
		stream.write_all(&rq.to_bytes()).await.unwrap();
		let Pdu::AssociateAc(ac) = read_pdu(&mut stream, &mut buf).await else {
			panic!("expected A-ASSOCIATE-AC");
		};
		assert_eq!(ac.results.len(), 1);
		assert_eq!(ac.results[0].transfer_syntax, uids::IMPLICIT_VR_LITTLE_ENDIAN);

		// Store one object, data set split over two fragments.
		let command = store_command(99, "7.7.7.1");
		stream
			.write_all(
				&Pdu::PData(vec![PresentationDataValue {
					context_id: 1,
					is_command: true,
					is_last: true,
					data: command,
				}])
				.to_bytes(),
			)
			.await
			.unwrap();
		let payload = data_set("7.7.7", "CT", "P9", "7.7.7.1");
		let (first, second) = payload.split_at(payload.len() / 2);
		for (chunk, is_last) in [(first, false), (second, true)] {
			stream
				.write_all(
					&Pdu::PData(vec![PresentationDataValue {
						context_id: 1,
						is_command: false,
						is_last,
						data: Bytes::copy_from_slice(chunk),
					}])
					.to_bytes(),
				)
				.await
				.unwrap();
		}

		// Acknowledged with success and the original message id.
		let Pdu::PData(pdvs) = read_pdu(&mut stream, &mut buf).await else {
			panic!("expected C-STORE-RSP");
		};
		let response = CommandSet::parse(&pdvs[0].data).unwrap();
		assert_eq!(response.message_id, 99);
		assert_eq!(response.affected_sop_instance_uid, "7.7.7.1");

		// Release.
		stream.write_all(&Pdu::ReleaseRq.to_bytes()).await.unwrap();
		assert!(matches!(read_pdu(&mut stream, &mut buf).await, Pdu::ReleaseRp));

		// The job completes and the study is registered exactly once.
		let mut completed = Vec::new();
		for _ in 0..200 {
			completed = queue.jobs(Some(JobStatus::Completed)).unwrap();
			if !completed.is_empty() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(completed.len(), 1);
		assert_eq!(completed[0].source_aet, "MODALITY1");

		let study = registry
			.study("7.7.7")
			.unwrap()
			.expect("study was registered");
		assert!(study.modalities_present.contains("CT"));
	}
}
