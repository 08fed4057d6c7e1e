//! The per-connection association state machine.
//!
//! Each accepted TCP connection owns exactly one [`Association`]. The state
//! machine is fed raw socket bytes and emits [`Action`]s: bytes to write back,
//! reassembled objects to hand to the ingestion queue, or a shutdown request.
//! Keeping it free of socket I/O makes it testable with scripted byte
//! sequences.

use crate::config::DimseServerConfig;
use crate::dimse::command::{
	CommandError, CommandSet, CompositeStoreResponse, EchoResponse, COMMAND_FIELD_C_ECHO_RQ,
	COMMAND_FIELD_C_STORE_RQ,
};
use crate::dimse::pdu::{
	Abort, AssociateAc, AssociateRj, AssociateRq, ContextResult, Pdu, PduError,
	PresentationContextResult, PresentationDataValue, ABORT_REASON_UNSPECIFIED,
	ABORT_SOURCE_SERVICE_PROVIDER, DICOM_APPLICATION_CONTEXT, REJECT_REASON_NO_REASON_GIVEN,
	REJECT_RESULT_PERMANENT, REJECT_SOURCE_SERVICE_USER,
};
use crate::types::{AE, UI, US};
use bytes::{Bytes, BytesMut};
use dicom_dictionary_std::uids;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Transfer syntaxes this node can decode, in no particular order.
/// Negotiation picks the first of the *proposed* syntaxes found in here.
const SUPPORTED_TRANSFER_SYNTAXES: &[&str] = &[
	uids::IMPLICIT_VR_LITTLE_ENDIAN,
	uids::EXPLICIT_VR_LITTLE_ENDIAN,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
	Idle,
	Requested,
	Established,
	Releasing,
	Closed,
}

/// A presentation context after negotiation. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
	pub id: u8,
	pub abstract_syntax: UI,
	/// The negotiated transfer syntax. Empty if the context was rejected.
	pub transfer_syntax: UI,
	pub accepted: bool,
}

/// A complete object received via C-STORE, ready for the ingestion queue.
#[derive(Debug, Clone)]
pub struct ReceivedObject {
	pub context_id: u8,
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub transfer_syntax: UI,
	pub data: Bytes,
}

/// What the connection handler must do next.
#[derive(Debug)]
pub enum Action {
	/// Write these bytes to the peer.
	Reply(Bytes),
	/// Hand this object to the ingestion queue, then acknowledge it via
	/// [`Association::acknowledge`].
	Store(ReceivedObject),
	/// The association is over; close the socket.
	Shutdown,
}

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Pdu(#[from] PduError),
	#[error(transparent)]
	Command(#[from] CommandError),
	#[error("Received {0} in state {1:?}")]
	UnexpectedPdu(&'static str, AssociationState),
	#[error("Fragment references unknown or rejected presentation context {0}")]
	UnknownPresentationContext(u8),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("C-STORE-RQ announces no data set")]
	MissingDataSet,
	#[error("Unsupported operation {0:#06x}")]
	UnsupportedOperation(US),
}

pub struct Association {
	config: DimseServerConfig,
	state: AssociationState,
	/// Raw socket bytes not yet consumed by a complete PDU.
	buffer: BytesMut,
	calling_aet: AE,
	contexts: Vec<PresentationContext>,
	/// Fragments of the current command set.
	command_buffer: BytesMut,
	/// Fragments of the current data set.
	data_buffer: BytesMut,
	/// A parsed C-STORE-RQ waiting for its data set to complete.
	pending_store: Option<(u8, CommandSet)>,
}

impl Association {
	pub fn new(config: DimseServerConfig) -> Self {
		Self {
			config,
			state: AssociationState::Idle,
			buffer: BytesMut::new(),
			calling_aet: AE::new(),
			contexts: Vec::new(),
			command_buffer: BytesMut::new(),
			data_buffer: BytesMut::new(),
			pending_store: None,
		}
	}

	pub const fn state(&self) -> AssociationState {
		self.state
	}

	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	pub fn presentation_contexts(&self) -> &[PresentationContext] {
		&self.contexts
	}

	/// Feeds raw socket bytes into the state machine.
	///
	/// Bytes accumulate in an internal buffer until a complete PDU is
	/// available, so the caller may deliver any split of the byte stream,
	/// from byte-at-a-time up to many coalesced PDUs per call.
	/// A protocol violation aborts the association: the returned actions end
	/// with the A-ABORT reply and a shutdown request.
	pub fn handle_input(&mut self, bytes: &[u8]) -> Vec<Action> {
		self.buffer.extend_from_slice(bytes);
		let mut actions = Vec::new();

		while self.state != AssociationState::Closed {
			match self.step(&mut actions) {
				Ok(true) => {}
				Ok(false) => break,
				Err(err) => {
					warn!(peer = %self.calling_aet, "Protocol violation: {err}");
					self.abort(&mut actions);
				}
			}
		}
		actions
	}

	/// Aborts the association locally, e.g. after an idle timeout.
	pub fn abort_locally(&mut self) -> Vec<Action> {
		let mut actions = Vec::new();
		if self.state != AssociationState::Closed {
			self.abort(&mut actions);
		}
		actions
	}

	/// Builds the per-object acknowledgment for a previously emitted
	/// [`Action::Store`], carrying the original message id and `status`.
	pub fn acknowledge(&self, object: &ReceivedObject, status: US) -> Bytes {
		let response = CompositeStoreResponse {
			message_id: object.message_id,
			sop_class_uid: object.sop_class_uid.clone(),
			sop_instance_uid: object.sop_instance_uid.clone(),
			status,
		};
		Pdu::PData(vec![PresentationDataValue {
			context_id: object.context_id,
			is_command: true,
			is_last: true,
			data: response.to_command_bytes(),
		}])
		.to_bytes()
	}

	/// Decodes and dispatches at most one PDU. Returns whether one was consumed.
	fn step(&mut self, actions: &mut Vec<Action>) -> Result<bool, AssociationError> {
		let Some(pdu) = Pdu::decode(&mut self.buffer, self.config.max_pdu_length)? else {
			return Ok(false);
		};
		self.handle_pdu(pdu, actions)?;
		Ok(true)
	}

	fn handle_pdu(&mut self, pdu: Pdu, actions: &mut Vec<Action>) -> Result<(), AssociationError> {
		match (pdu, self.state) {
			(Pdu::AssociateRq(rq), AssociationState::Idle) => {
				self.state = AssociationState::Requested;
				self.negotiate(&rq, actions);
				Ok(())
			}
			(Pdu::PData(pdvs), AssociationState::Established) => {
				for pdv in pdvs {
					self.handle_pdv(pdv, actions)?;
				}
				Ok(())
			}
			(Pdu::ReleaseRq, AssociationState::Established) => {
				self.state = AssociationState::Releasing;
				// Partially reassembled fragments are never forwarded.
				self.discard_partial();
				actions.push(Action::Reply(Pdu::ReleaseRp.to_bytes()));
				self.state = AssociationState::Closed;
				actions.push(Action::Shutdown);
				debug!(peer = %self.calling_aet, "Association released");
				Ok(())
			}
			(Pdu::Abort(abort), _) => {
				info!(
					peer = %self.calling_aet,
					source = abort.source,
					reason = abort.reason,
					"Association aborted by peer"
				);
				self.discard_partial();
				self.state = AssociationState::Closed;
				actions.push(Action::Shutdown);
				Ok(())
			}
			(Pdu::AssociateRq(_), state) => {
				Err(AssociationError::UnexpectedPdu("A-ASSOCIATE-RQ", state))
			}
			(Pdu::AssociateAc(_), state) => {
				Err(AssociationError::UnexpectedPdu("A-ASSOCIATE-AC", state))
			}
			(Pdu::AssociateRj(_), state) => {
				Err(AssociationError::UnexpectedPdu("A-ASSOCIATE-RJ", state))
			}
			(Pdu::PData(_), state) => Err(AssociationError::UnexpectedPdu("P-DATA-TF", state)),
			(Pdu::ReleaseRq, state) => Err(AssociationError::UnexpectedPdu("A-RELEASE-RQ", state)),
			(Pdu::ReleaseRp, state) => Err(AssociationError::UnexpectedPdu("A-RELEASE-RP", state)),
		}
	}

	/// Accepts or rejects each proposed presentation context. A context is
	/// rejected on its own; the association is only rejected as a whole when
	/// zero contexts are acceptable.
	fn negotiate(&mut self, rq: &AssociateRq, actions: &mut Vec<Action>) {
		self.calling_aet = rq.calling_aet.clone();

		let mut results = Vec::with_capacity(rq.presentation_contexts.len());
		for proposed in &rq.presentation_contexts {
			let abstract_supported = self.config.abstract_syntaxes.is_empty()
				|| self
					.config
					.abstract_syntaxes
					.iter()
					.any(|uid| uid == &proposed.abstract_syntax);

			let transfer_syntax = proposed
				.transfer_syntaxes
				.iter()
				.find(|ts| SUPPORTED_TRANSFER_SYNTAXES.contains(&ts.as_str()));

			let (result, negotiated) = if !abstract_supported {
				(ContextResult::AbstractSyntaxNotSupported, UI::new())
			} else if let Some(transfer_syntax) = transfer_syntax {
				(ContextResult::Acceptance, transfer_syntax.clone())
			} else {
				(ContextResult::TransferSyntaxesNotSupported, UI::new())
			};

			trace!(
				context_id = proposed.id,
				abstract_syntax = proposed.abstract_syntax,
				?result,
				"Negotiated presentation context"
			);

			self.contexts.push(PresentationContext {
				id: proposed.id,
				abstract_syntax: proposed.abstract_syntax.clone(),
				transfer_syntax: negotiated.clone(),
				accepted: result == ContextResult::Acceptance,
			});
			results.push(PresentationContextResult {
				id: proposed.id,
				result,
				transfer_syntax: negotiated,
			});
		}

		if self.contexts.iter().any(|context| context.accepted) {
			let ac = AssociateAc {
				called_aet: self.config.aet.clone(),
				calling_aet: rq.calling_aet.clone(),
				application_context: UI::from(DICOM_APPLICATION_CONTEXT),
				results,
				max_pdu_length: self.config.max_pdu_length,
				implementation_class_uid: UI::from(crate::IMPLEMENTATION_CLASS_UID),
				implementation_version_name: String::from(crate::IMPLEMENTATION_VERSION_NAME),
			};
			actions.push(Action::Reply(Pdu::AssociateAc(ac).to_bytes()));
			self.state = AssociationState::Established;
			info!(
				calling_aet = %rq.calling_aet,
				called_aet = %rq.called_aet,
				contexts = self.contexts.len(),
				"Established new association"
			);
		} else {
			actions.push(Action::Reply(
				Pdu::AssociateRj(AssociateRj {
					result: REJECT_RESULT_PERMANENT,
					source: REJECT_SOURCE_SERVICE_USER,
					reason: REJECT_REASON_NO_REASON_GIVEN,
				})
				.to_bytes(),
			));
			self.state = AssociationState::Closed;
			actions.push(Action::Shutdown);
			info!(calling_aet = %rq.calling_aet, "Rejected association without acceptable presentation context");
		}
	}

	fn handle_pdv(
		&mut self,
		pdv: PresentationDataValue,
		actions: &mut Vec<Action>,
	) -> Result<(), AssociationError> {
		let context = self
			.contexts
			.iter()
			.find(|context| context.id == pdv.context_id && context.accepted)
			.ok_or(AssociationError::UnknownPresentationContext(pdv.context_id))?
			.clone();

		if pdv.is_command {
			if self.pending_store.is_some() {
				// A new command while a data set is still outstanding.
				return Err(AssociationError::OutOfOrder);
			}
			self.command_buffer.extend_from_slice(&pdv.data);
			if !pdv.is_last {
				return Ok(());
			}

			let command_bytes = self.command_buffer.split();
			let command = CommandSet::parse(&command_bytes)?;
			match command.command_field {
				COMMAND_FIELD_C_ECHO_RQ => {
					debug!(peer = %self.calling_aet, "Answering C-ECHO-RQ");
					let response = EchoResponse {
						message_id: command.message_id,
					};
					actions.push(Action::Reply(
						Pdu::PData(vec![PresentationDataValue {
							context_id: pdv.context_id,
							is_command: true,
							is_last: true,
							data: response.to_command_bytes(),
						}])
						.to_bytes(),
					));
					Ok(())
				}
				COMMAND_FIELD_C_STORE_RQ => {
					if !command.has_data_set {
						return Err(AssociationError::MissingDataSet);
					}
					self.pending_store = Some((pdv.context_id, command));
					Ok(())
				}
				other => Err(AssociationError::UnsupportedOperation(other)),
			}
		} else {
			if self.pending_store.is_none() {
				// A data set must follow its command set.
				return Err(AssociationError::OutOfOrder);
			}
			self.data_buffer.extend_from_slice(&pdv.data);
			if !pdv.is_last {
				return Ok(());
			}

			let (context_id, command) = self.pending_store.take().expect("pending store exists");
			let data = self.data_buffer.split().freeze();
			trace!(
				sop_instance_uid = command.affected_sop_instance_uid,
				abstract_syntax = context.abstract_syntax,
				bytes = data.len(),
				"Reassembled object transfer"
			);
			actions.push(Action::Store(ReceivedObject {
				context_id,
				message_id: command.message_id,
				sop_class_uid: command.affected_sop_class_uid,
				sop_instance_uid: command.affected_sop_instance_uid,
				transfer_syntax: context.transfer_syntax,
				data,
			}));
			Ok(())
		}
	}

	fn abort(&mut self, actions: &mut Vec<Action>) {
		self.discard_partial();
		actions.push(Action::Reply(
			Pdu::Abort(Abort {
				source: ABORT_SOURCE_SERVICE_PROVIDER,
				reason: ABORT_REASON_UNSPECIFIED,
			})
			.to_bytes(),
		));
		self.state = AssociationState::Closed;
		actions.push(Action::Shutdown);
	}

	fn discard_partial(&mut self) {
		self.command_buffer.clear();
		self.data_buffer.clear();
		self.pending_store = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::command::{STATUS_OUT_OF_RESOURCES, STATUS_SUCCESS};
	use crate::dimse::pdu::ProposedPresentationContext;
	use bytes::BufMut;
	use std::net::{IpAddr, Ipv4Addr};

	fn test_config() -> DimseServerConfig {
		DimseServerConfig {
			aet: String::from("DICOM-INTAKE"),
			interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 0,
			max_pdu_length: 262_144,
			idle_timeout: 60,
			bind_attempts: 1,
			bind_backoff: 1,
			abstract_syntaxes: Vec::new(),
		}
	}

	fn associate_rq(contexts: Vec<ProposedPresentationContext>) -> Bytes {
		Pdu::AssociateRq(AssociateRq {
			called_aet: AE::from("DICOM-INTAKE"),
			calling_aet: AE::from("MODALITY1"),
			application_context: UI::from(DICOM_APPLICATION_CONTEXT),
			presentation_contexts: contexts,
			max_pdu_length: Some(16384),
		})
		.to_bytes()
	}

	fn ct_context(id: u8) -> ProposedPresentationContext {
		ProposedPresentationContext {
			id,
			abstract_syntax: UI::from(uids::CT_IMAGE_STORAGE),
			transfer_syntaxes: vec![UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN)],
		}
	}

	fn compressed_context(id: u8) -> ProposedPresentationContext {
		ProposedPresentationContext {
			id,
			abstract_syntax: UI::from(uids::CT_IMAGE_STORAGE),
			// JPEG Baseline is not supported by this node.
			transfer_syntaxes: vec![UI::from("1.2.840.10008.1.2.4.50")],
		}
	}

	fn store_command(message_id: US) -> Bytes {
		use crate::dimse::command::COMMAND_FIELD_C_STORE_RQ;
		use dicom_dictionary_std::tags;

		// Hand-rolled C-STORE-RQ command set in implicit VR little endian.
		let mut body = BytesMut::new();
		for (tag, value) in [
			(tags::AFFECTED_SOP_CLASS_UID, Bytes::from_static(b"1.2.840.10008.5.1.4.1.1.2\0")),
			(tags::COMMAND_FIELD, Bytes::copy_from_slice(&COMMAND_FIELD_C_STORE_RQ.to_le_bytes())),
			(tags::MESSAGE_ID, Bytes::copy_from_slice(&message_id.to_le_bytes())),
			(tags::COMMAND_DATA_SET_TYPE, Bytes::copy_from_slice(&0x0102u16.to_le_bytes())),
			(tags::AFFECTED_SOP_INSTANCE_UID, Bytes::from_static(b"1.2.3.4\0")),
		] {
			body.put_u16_le(tag.group());
			body.put_u16_le(tag.element());
			body.put_u32_le(u32::try_from(value.len()).unwrap());
			body.put_slice(&value);
		}

		let mut command = BytesMut::new();
		command.put_u16_le(0x0000);
		command.put_u16_le(0x0000);
		command.put_u32_le(4);
		command.put_u32_le(u32::try_from(body.len()).unwrap());
		command.extend_from_slice(&body);
		command.freeze()
	}

	fn pdata(context_id: u8, is_command: bool, is_last: bool, data: Bytes) -> Bytes {
		Pdu::PData(vec![PresentationDataValue {
			context_id,
			is_command,
			is_last,
			data,
		}])
		.to_bytes()
	}

	fn established_association() -> Association {
		let mut association = Association::new(test_config());
		let actions = association.handle_input(&associate_rq(vec![ct_context(1)]));
		assert!(matches!(actions.first(), Some(Action::Reply(_))));
		assert_eq!(association.state(), AssociationState::Established);
		association
	}

	#[test]
	fn rejects_single_unsupported_context_keeps_association() {
		let mut association = Association::new(test_config());
		let actions =
			association.handle_input(&associate_rq(vec![ct_context(1), compressed_context(3)]));

		assert_eq!(association.state(), AssociationState::Established);
		let Some(Action::Reply(reply)) = actions.first() else {
			panic!("expected a reply");
		};

		let mut buf = BytesMut::from(reply.as_ref());
		let Some(Pdu::AssociateAc(ac)) = Pdu::decode(&mut buf, 262_144).unwrap() else {
			panic!("expected A-ASSOCIATE-AC");
		};
		assert_eq!(ac.results.len(), 2);
		assert_eq!(ac.results[0].result, ContextResult::Acceptance);
		assert_eq!(
			ac.results[0].transfer_syntax,
			uids::EXPLICIT_VR_LITTLE_ENDIAN
		);
		assert_eq!(
			ac.results[1].result,
			ContextResult::TransferSyntaxesNotSupported
		);
	}

	#[test]
	fn rejects_association_without_acceptable_context() {
		let mut association = Association::new(test_config());
		let actions = association.handle_input(&associate_rq(vec![compressed_context(1)]));

		assert_eq!(association.state(), AssociationState::Closed);
		let Some(Action::Reply(reply)) = actions.first() else {
			panic!("expected a reply");
		};
		let mut buf = BytesMut::from(reply.as_ref());
		assert!(matches!(
			Pdu::decode(&mut buf, 262_144).unwrap(),
			Some(Pdu::AssociateRj(_))
		));
		assert!(matches!(actions.last(), Some(Action::Shutdown)));
	}

	#[test]
	fn reassembles_fragmented_store_request() {
		let mut association = established_association();

		let command = store_command(42);
		let mut actions = Vec::new();
		actions.extend(association.handle_input(&pdata(1, true, true, command)));
		actions.extend(association.handle_input(&pdata(
			1,
			false,
			false,
			Bytes::from_static(b"first half"),
		)));
		actions.extend(association.handle_input(&pdata(
			1,
			false,
			true,
			Bytes::from_static(b"second half"),
		)));

		let objects: Vec<_> = actions
			.iter()
			.filter_map(|action| match action {
				Action::Store(object) => Some(object),
				_ => None,
			})
			.collect();
		assert_eq!(objects.len(), 1);
		let object = objects[0];
		assert_eq!(object.message_id, 42);
		assert_eq!(object.sop_instance_uid, "1.2.3.4");
		assert_eq!(object.transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
		assert_eq!(&object.data[..], b"first halfsecond half");

		// The acknowledgment carries the original message id.
		let ack = association.acknowledge(object, STATUS_SUCCESS);
		let mut buf = BytesMut::from(ack.as_ref());
		let Some(Pdu::PData(pdvs)) = Pdu::decode(&mut buf, 262_144).unwrap() else {
			panic!("expected P-DATA-TF acknowledgment");
		};
		let parsed = CommandSet::parse(&pdvs[0].data).unwrap();
		assert_eq!(parsed.message_id, 42);
	}

	#[test]
	fn byte_at_a_time_input_is_equivalent() {
		let mut wire = BytesMut::new();
		wire.extend_from_slice(&associate_rq(vec![ct_context(1)]));
		wire.extend_from_slice(&pdata(1, true, true, store_command(7)));
		wire.extend_from_slice(&pdata(1, false, true, Bytes::from_static(b"payload")));

		let mut association = Association::new(test_config());
		let mut actions = Vec::new();
		for byte in wire.iter() {
			actions.extend(association.handle_input(&[*byte]));
		}

		let stores = actions
			.iter()
			.filter(|action| matches!(action, Action::Store(_)))
			.count();
		assert_eq!(stores, 1);
		assert_eq!(association.state(), AssociationState::Established);
	}

	#[test]
	fn release_roundtrip() {
		let mut association = established_association();
		let actions = association.handle_input(&Pdu::ReleaseRq.to_bytes());

		let Some(Action::Reply(reply)) = actions.first() else {
			panic!("expected a reply");
		};
		let mut buf = BytesMut::from(reply.as_ref());
		assert!(matches!(
			Pdu::decode(&mut buf, 262_144).unwrap(),
			Some(Pdu::ReleaseRp)
		));
		assert!(matches!(actions.last(), Some(Action::Shutdown)));
		assert_eq!(association.state(), AssociationState::Closed);
	}

	#[test]
	fn oversized_pdu_aborts_without_dispatch() {
		let mut association = established_association();

		let mut wire = BytesMut::new();
		wire.put_u8(0x04);
		wire.put_u8(0);
		wire.put_u32(100_000_000);
		let actions = association.handle_input(&wire);

		assert_eq!(association.state(), AssociationState::Closed);
		assert!(actions
			.iter()
			.all(|action| !matches!(action, Action::Store(_))));
		let Some(Action::Reply(reply)) = actions.first() else {
			panic!("expected an abort reply");
		};
		let mut buf = BytesMut::from(reply.as_ref());
		assert!(matches!(
			Pdu::decode(&mut buf, 262_144).unwrap(),
			Some(Pdu::Abort(_))
		));
	}

	#[test]
	fn peer_abort_closes_silently() {
		let mut association = established_association();
		let actions = association.handle_input(
			&Pdu::Abort(Abort {
				source: 0,
				reason: 0,
			})
			.to_bytes(),
		);

		assert_eq!(association.state(), AssociationState::Closed);
		assert_eq!(actions.len(), 1);
		assert!(matches!(actions[0], Action::Shutdown));
	}

	#[test]
	fn data_before_command_aborts() {
		let mut association = established_association();
		let actions =
			association.handle_input(&pdata(1, false, true, Bytes::from_static(b"orphan")));

		assert_eq!(association.state(), AssociationState::Closed);
		assert!(actions
			.iter()
			.all(|action| !matches!(action, Action::Store(_))));
	}

	#[test]
	fn echo_is_answered_inline() {
		use dicom_dictionary_std::tags;

		let mut association = Association::new(test_config());
		association.handle_input(&associate_rq(vec![ProposedPresentationContext {
			id: 1,
			abstract_syntax: UI::from(uids::VERIFICATION),
			transfer_syntaxes: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		}]));

		// Hand-rolled C-ECHO-RQ.
		let mut body = BytesMut::new();
		for (tag, value) in [
			(tags::COMMAND_FIELD, COMMAND_FIELD_C_ECHO_RQ),
			(tags::MESSAGE_ID, 11),
			(tags::COMMAND_DATA_SET_TYPE, 0x0101),
		] {
			body.put_u16_le(tag.group());
			body.put_u16_le(tag.element());
			body.put_u32_le(2);
			body.put_u16_le(value);
		}
		let mut command = BytesMut::new();
		command.put_u16_le(0x0000);
		command.put_u16_le(0x0000);
		command.put_u32_le(4);
		command.put_u32_le(u32::try_from(body.len()).unwrap());
		command.extend_from_slice(&body);

		let actions = association.handle_input(&pdata(1, true, true, command.freeze()));
		let Some(Action::Reply(reply)) = actions.first() else {
			panic!("expected C-ECHO-RSP");
		};
		let mut buf = BytesMut::from(reply.as_ref());
		let Some(Pdu::PData(pdvs)) = Pdu::decode(&mut buf, 262_144).unwrap() else {
			panic!("expected P-DATA-TF");
		};
		let parsed = CommandSet::parse(&pdvs[0].data).unwrap();
		assert_eq!(parsed.message_id, 11);
		assert_eq!(association.state(), AssociationState::Established);
	}

	#[test]
	fn queue_failure_status_is_reportable() {
		let association = established_association();
		let object = ReceivedObject {
			context_id: 1,
			message_id: 3,
			sop_class_uid: UI::from(uids::CT_IMAGE_STORAGE),
			sop_instance_uid: UI::from("1.2.3"),
			transfer_syntax: UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			data: Bytes::new(),
		};

		let ack = association.acknowledge(&object, STATUS_OUT_OF_RESOURCES);
		let mut buf = BytesMut::from(ack.as_ref());
		let Some(Pdu::PData(pdvs)) = Pdu::decode(&mut buf, 262_144).unwrap() else {
			panic!("expected P-DATA-TF");
		};
		assert!(pdvs[0].is_command && pdvs[0].is_last);
	}
}
