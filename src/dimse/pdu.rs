//! Upper-layer PDU framing and encoding.
//!
//! Every PDU starts with a fixed 6-byte header: one byte PDU type, one
//! reserved byte and a four-byte big-endian length of the remainder.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part08/sect_9.3.html>

use crate::types::{AE, UI, UL};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const PDU_HEADER_LENGTH: usize = 6;

const PDU_TYPE_ASSOCIATE_RQ: u8 = 0x01;
const PDU_TYPE_ASSOCIATE_AC: u8 = 0x02;
const PDU_TYPE_ASSOCIATE_RJ: u8 = 0x03;
const PDU_TYPE_P_DATA_TF: u8 = 0x04;
const PDU_TYPE_RELEASE_RQ: u8 = 0x05;
const PDU_TYPE_RELEASE_RP: u8 = 0x06;
const PDU_TYPE_ABORT: u8 = 0x07;

const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;
const ITEM_MAXIMUM_LENGTH: u8 = 0x51;
const ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
const ITEM_IMPLEMENTATION_VERSION_NAME: u8 = 0x55;

/// The DICOM application context name, the only one defined by the standard.
pub const DICOM_APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

pub const ABORT_SOURCE_SERVICE_PROVIDER: u8 = 2;
pub const ABORT_REASON_UNSPECIFIED: u8 = 0;

pub const REJECT_RESULT_PERMANENT: u8 = 1;
pub const REJECT_SOURCE_SERVICE_USER: u8 = 1;
pub const REJECT_REASON_NO_REASON_GIVEN: u8 = 1;

#[derive(Debug, Error)]
pub enum PduError {
	#[error("PDU of {length} bytes exceeds the maximum of {max} bytes")]
	TooLarge { length: UL, max: UL },
	#[error("Unrecognized PDU type {0:#04x}")]
	UnrecognizedType(u8),
	#[error("PDU ends in the middle of a {0}")]
	Truncated(&'static str),
	#[error("Invalid presentation data value length {0}")]
	InvalidPdvLength(UL),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
	AssociateRq(AssociateRq),
	AssociateAc(AssociateAc),
	AssociateRj(AssociateRj),
	PData(Vec<PresentationDataValue>),
	ReleaseRq,
	ReleaseRp,
	Abort(Abort),
}

/// A-ASSOCIATE-RQ, the connection-request message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociateRq {
	pub called_aet: AE,
	pub calling_aet: AE,
	pub application_context: UI,
	pub presentation_contexts: Vec<ProposedPresentationContext>,
	/// Maximum PDU length announced by the peer, if any.
	pub max_pdu_length: Option<UL>,
}

/// One presentation context proposed by the requestor: an abstract syntax
/// paired with candidate transfer syntaxes in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposedPresentationContext {
	pub id: u8,
	pub abstract_syntax: UI,
	pub transfer_syntaxes: Vec<UI>,
}

/// A-ASSOCIATE-AC, the connection-accept message listing per-context results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociateAc {
	pub called_aet: AE,
	pub calling_aet: AE,
	pub application_context: UI,
	pub results: Vec<PresentationContextResult>,
	pub max_pdu_length: UL,
	pub implementation_class_uid: UI,
	pub implementation_version_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
	pub id: u8,
	pub result: ContextResult,
	/// The negotiated transfer syntax. Empty if the context was rejected.
	pub transfer_syntax: UI,
}

/// Result values of a presentation context item in an A-ASSOCIATE-AC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextResult {
	Acceptance,
	AbstractSyntaxNotSupported,
	TransferSyntaxesNotSupported,
}

impl ContextResult {
	const fn as_u8(self) -> u8 {
		match self {
			Self::Acceptance => 0,
			Self::AbstractSyntaxNotSupported => 3,
			Self::TransferSyntaxesNotSupported => 4,
		}
	}

	const fn from_u8(value: u8) -> Self {
		match value {
			3 => Self::AbstractSyntaxNotSupported,
			4 => Self::TransferSyntaxesNotSupported,
			_ => Self::Acceptance,
		}
	}
}

/// A-ASSOCIATE-RJ, the connection-reject message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRj {
	pub result: u8,
	pub source: u8,
	pub reason: u8,
}

/// A-ABORT. No response is expected in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
	pub source: u8,
	pub reason: u8,
}

/// One fragment of a logical DIMSE message inside a P-DATA-TF PDU.
///
/// The low bit of the message control header marks command vs. data set,
/// the second bit marks the last fragment of the logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationDataValue {
	pub context_id: u8,
	pub is_command: bool,
	pub is_last: bool,
	pub data: Bytes,
}

impl Pdu {
	/// Attempts to decode one PDU from the front of `buf`.
	///
	/// Returns `Ok(None)` until `buf` holds the complete PDU announced by the
	/// 6-byte header; the caller keeps accumulating socket reads. On success
	/// exactly the consumed bytes are removed from `buf`, so surplus bytes of
	/// a coalesced read remain for the next unit.
	pub fn decode(buf: &mut BytesMut, max_pdu_length: UL) -> Result<Option<Self>, PduError> {
		if buf.len() < PDU_HEADER_LENGTH {
			return Ok(None);
		}
		let pdu_type = buf[0];
		let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
		if length > max_pdu_length {
			return Err(PduError::TooLarge {
				length,
				max: max_pdu_length,
			});
		}
		let total = PDU_HEADER_LENGTH + length as usize;
		if buf.len() < total {
			return Ok(None);
		}

		let mut body = buf.split_to(total).freeze();
		body.advance(PDU_HEADER_LENGTH);
		Self::parse(pdu_type, body).map(Some)
	}

	fn parse(pdu_type: u8, body: Bytes) -> Result<Self, PduError> {
		match pdu_type {
			PDU_TYPE_ASSOCIATE_RQ => parse_associate_rq(body).map(Self::AssociateRq),
			PDU_TYPE_ASSOCIATE_AC => parse_associate_ac(body).map(Self::AssociateAc),
			PDU_TYPE_ASSOCIATE_RJ => parse_associate_rj(body).map(Self::AssociateRj),
			PDU_TYPE_P_DATA_TF => parse_pdata(body).map(Self::PData),
			PDU_TYPE_RELEASE_RQ => Ok(Self::ReleaseRq),
			PDU_TYPE_RELEASE_RP => Ok(Self::ReleaseRp),
			PDU_TYPE_ABORT => parse_abort(body).map(Self::Abort),
			other => Err(PduError::UnrecognizedType(other)),
		}
	}

	/// Encodes this PDU, including the 6-byte header, into `buf`.
	pub fn encode(&self, buf: &mut BytesMut) {
		let (pdu_type, body) = match self {
			Self::AssociateRq(rq) => (PDU_TYPE_ASSOCIATE_RQ, encode_associate_rq(rq)),
			Self::AssociateAc(ac) => (PDU_TYPE_ASSOCIATE_AC, encode_associate_ac(ac)),
			Self::AssociateRj(rj) => (
				PDU_TYPE_ASSOCIATE_RJ,
				BytesMut::from(&[0, rj.result, rj.source, rj.reason][..]),
			),
			Self::PData(pdvs) => (PDU_TYPE_P_DATA_TF, encode_pdata(pdvs)),
			Self::ReleaseRq => (PDU_TYPE_RELEASE_RQ, BytesMut::from(&[0u8; 4][..])),
			Self::ReleaseRp => (PDU_TYPE_RELEASE_RP, BytesMut::from(&[0u8; 4][..])),
			Self::Abort(abort) => (
				PDU_TYPE_ABORT,
				BytesMut::from(&[0, 0, abort.source, abort.reason][..]),
			),
		};

		buf.put_u8(pdu_type);
		buf.put_u8(0);
		buf.put_u32(u32::try_from(body.len()).expect("PDU body fits in u32"));
		buf.extend_from_slice(&body);
	}

	/// Convenience for one-shot encoding.
	pub fn to_bytes(&self) -> Bytes {
		let mut buf = BytesMut::new();
		self.encode(&mut buf);
		buf.freeze()
	}
}

fn take(buf: &mut Bytes, n: usize, what: &'static str) -> Result<Bytes, PduError> {
	if buf.remaining() < n {
		return Err(PduError::Truncated(what));
	}
	Ok(buf.split_to(n))
}

fn take_u8(buf: &mut Bytes, what: &'static str) -> Result<u8, PduError> {
	if buf.remaining() < 1 {
		return Err(PduError::Truncated(what));
	}
	Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes, what: &'static str) -> Result<u16, PduError> {
	if buf.remaining() < 2 {
		return Err(PduError::Truncated(what));
	}
	Ok(buf.get_u16())
}

fn take_string(buf: &mut Bytes, n: usize, what: &'static str) -> Result<String, PduError> {
	let raw = take(buf, n, what)?;
	Ok(String::from_utf8_lossy(&raw)
		.trim_end_matches([' ', '\0'])
		.to_string())
}

/// Parses the fixed part shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC:
/// protocol version, reserved bytes and the two 16-byte AE title fields.
fn parse_associate_fixed(buf: &mut Bytes) -> Result<(AE, AE), PduError> {
	let _protocol_version = take_u16(buf, "protocol version")?;
	take(buf, 2, "reserved bytes")?;
	let called_aet = take_string(buf, 16, "called AE title")?;
	let calling_aet = take_string(buf, 16, "calling AE title")?;
	take(buf, 32, "reserved bytes")?;
	Ok((called_aet, calling_aet))
}

fn parse_associate_rq(mut buf: Bytes) -> Result<AssociateRq, PduError> {
	let (called_aet, calling_aet) = parse_associate_fixed(&mut buf)?;
	let mut rq = AssociateRq {
		called_aet,
		calling_aet,
		..AssociateRq::default()
	};

	while buf.has_remaining() {
		let item_type = take_u8(&mut buf, "item header")?;
		take_u8(&mut buf, "item header")?;
		let length = take_u16(&mut buf, "item header")? as usize;
		let mut item = take(&mut buf, length, "item value")?;

		match item_type {
			ITEM_APPLICATION_CONTEXT => {
				rq.application_context = take_string(&mut item, length, "application context")?;
			}
			ITEM_PRESENTATION_CONTEXT_RQ => {
				rq.presentation_contexts
					.push(parse_proposed_context(&mut item)?);
			}
			ITEM_USER_INFORMATION => {
				rq.max_pdu_length = parse_user_information(&mut item)?.max_pdu_length;
			}
			// Unknown items are skipped; the TLV encoding makes this safe.
			_ => {}
		}
	}

	Ok(rq)
}

fn parse_proposed_context(item: &mut Bytes) -> Result<ProposedPresentationContext, PduError> {
	let id = take_u8(item, "presentation context")?;
	take(item, 3, "presentation context")?;

	let mut context = ProposedPresentationContext {
		id,
		..ProposedPresentationContext::default()
	};
	while item.has_remaining() {
		let sub_type = take_u8(item, "sub-item header")?;
		take_u8(item, "sub-item header")?;
		let length = take_u16(item, "sub-item header")? as usize;
		let mut value = take(item, length, "sub-item value")?;

		match sub_type {
			ITEM_ABSTRACT_SYNTAX => {
				context.abstract_syntax = take_string(&mut value, length, "abstract syntax")?;
			}
			ITEM_TRANSFER_SYNTAX => {
				context
					.transfer_syntaxes
					.push(take_string(&mut value, length, "transfer syntax")?);
			}
			_ => {}
		}
	}
	Ok(context)
}

#[derive(Debug, Default)]
struct UserInformation {
	max_pdu_length: Option<UL>,
}

fn parse_user_information(item: &mut Bytes) -> Result<UserInformation, PduError> {
	let mut info = UserInformation::default();
	while item.has_remaining() {
		let sub_type = take_u8(item, "user information")?;
		take_u8(item, "user information")?;
		let length = take_u16(item, "user information")? as usize;
		let mut value = take(item, length, "user information")?;

		if sub_type == ITEM_MAXIMUM_LENGTH && length == 4 {
			info.max_pdu_length = Some(value.get_u32());
		}
	}
	Ok(info)
}

fn parse_associate_ac(mut buf: Bytes) -> Result<AssociateAc, PduError> {
	let (called_aet, calling_aet) = parse_associate_fixed(&mut buf)?;
	let mut ac = AssociateAc {
		called_aet,
		calling_aet,
		..AssociateAc::default()
	};

	while buf.has_remaining() {
		let item_type = take_u8(&mut buf, "item header")?;
		take_u8(&mut buf, "item header")?;
		let length = take_u16(&mut buf, "item header")? as usize;
		let mut item = take(&mut buf, length, "item value")?;

		match item_type {
			ITEM_APPLICATION_CONTEXT => {
				ac.application_context = take_string(&mut item, length, "application context")?;
			}
			ITEM_PRESENTATION_CONTEXT_AC => {
				let id = take_u8(&mut item, "presentation context")?;
				take_u8(&mut item, "presentation context")?;
				let result = ContextResult::from_u8(take_u8(&mut item, "presentation context")?);
				take_u8(&mut item, "presentation context")?;

				let mut transfer_syntax = UI::new();
				while item.has_remaining() {
					let sub_type = take_u8(&mut item, "sub-item header")?;
					take_u8(&mut item, "sub-item header")?;
					let sub_length = take_u16(&mut item, "sub-item header")? as usize;
					let mut value = take(&mut item, sub_length, "sub-item value")?;
					if sub_type == ITEM_TRANSFER_SYNTAX {
						transfer_syntax = take_string(&mut value, sub_length, "transfer syntax")?;
					}
				}
				ac.results.push(PresentationContextResult {
					id,
					result,
					transfer_syntax,
				});
			}
			ITEM_USER_INFORMATION => {
				ac.max_pdu_length = parse_user_information(&mut item)?
					.max_pdu_length
					.unwrap_or_default();
			}
			_ => {}
		}
	}

	Ok(ac)
}

fn parse_associate_rj(mut buf: Bytes) -> Result<AssociateRj, PduError> {
	take_u8(&mut buf, "A-ASSOCIATE-RJ")?;
	Ok(AssociateRj {
		result: take_u8(&mut buf, "A-ASSOCIATE-RJ")?,
		source: take_u8(&mut buf, "A-ASSOCIATE-RJ")?,
		reason: take_u8(&mut buf, "A-ASSOCIATE-RJ")?,
	})
}

fn parse_abort(mut buf: Bytes) -> Result<Abort, PduError> {
	take(&mut buf, 2, "A-ABORT")?;
	Ok(Abort {
		source: take_u8(&mut buf, "A-ABORT")?,
		reason: take_u8(&mut buf, "A-ABORT")?,
	})
}

fn parse_pdata(mut buf: Bytes) -> Result<Vec<PresentationDataValue>, PduError> {
	let mut pdvs = Vec::new();
	while buf.has_remaining() {
		if buf.remaining() < 4 {
			return Err(PduError::Truncated("presentation data value"));
		}
		let length = buf.get_u32();
		if length < 2 || length as usize > buf.remaining() {
			return Err(PduError::InvalidPdvLength(length));
		}
		let context_id = buf.get_u8();
		let control = buf.get_u8();
		let data = buf.split_to(length as usize - 2);

		pdvs.push(PresentationDataValue {
			context_id,
			is_command: control & 0b01 != 0,
			is_last: control & 0b10 != 0,
			data,
		});
	}
	Ok(pdvs)
}

fn put_ae_title(buf: &mut BytesMut, aet: &str) {
	let mut field = [b' '; 16];
	let bytes = aet.as_bytes();
	let n = bytes.len().min(16);
	field[..n].copy_from_slice(&bytes[..n]);
	buf.put_slice(&field);
}

fn put_item(buf: &mut BytesMut, item_type: u8, value: &[u8]) {
	buf.put_u8(item_type);
	buf.put_u8(0);
	buf.put_u16(u16::try_from(value.len()).expect("item value fits in u16"));
	buf.put_slice(value);
}

fn encode_associate_fixed(buf: &mut BytesMut, called_aet: &str, calling_aet: &str) {
	buf.put_u16(0x0001);
	buf.put_u16(0);
	put_ae_title(buf, called_aet);
	put_ae_title(buf, calling_aet);
	buf.put_slice(&[0u8; 32]);
}

fn encode_associate_rq(rq: &AssociateRq) -> BytesMut {
	let mut buf = BytesMut::new();
	encode_associate_fixed(&mut buf, &rq.called_aet, &rq.calling_aet);
	put_item(
		&mut buf,
		ITEM_APPLICATION_CONTEXT,
		rq.application_context.as_bytes(),
	);

	for context in &rq.presentation_contexts {
		let mut item = BytesMut::new();
		item.put_u8(context.id);
		item.put_slice(&[0u8; 3]);
		put_item(
			&mut item,
			ITEM_ABSTRACT_SYNTAX,
			context.abstract_syntax.as_bytes(),
		);
		for transfer_syntax in &context.transfer_syntaxes {
			put_item(&mut item, ITEM_TRANSFER_SYNTAX, transfer_syntax.as_bytes());
		}
		put_item(&mut buf, ITEM_PRESENTATION_CONTEXT_RQ, &item);
	}

	if let Some(max_pdu_length) = rq.max_pdu_length {
		let mut info = BytesMut::new();
		put_item(&mut info, ITEM_MAXIMUM_LENGTH, &max_pdu_length.to_be_bytes());
		put_item(&mut buf, ITEM_USER_INFORMATION, &info);
	}

	buf
}

fn encode_associate_ac(ac: &AssociateAc) -> BytesMut {
	let mut buf = BytesMut::new();
	encode_associate_fixed(&mut buf, &ac.called_aet, &ac.calling_aet);
	put_item(
		&mut buf,
		ITEM_APPLICATION_CONTEXT,
		ac.application_context.as_bytes(),
	);

	for result in &ac.results {
		let mut item = BytesMut::new();
		item.put_u8(result.id);
		item.put_u8(0);
		item.put_u8(result.result.as_u8());
		item.put_u8(0);
		put_item(
			&mut item,
			ITEM_TRANSFER_SYNTAX,
			result.transfer_syntax.as_bytes(),
		);
		put_item(&mut buf, ITEM_PRESENTATION_CONTEXT_AC, &item);
	}

	let mut info = BytesMut::new();
	put_item(&mut info, ITEM_MAXIMUM_LENGTH, &ac.max_pdu_length.to_be_bytes());
	put_item(
		&mut info,
		ITEM_IMPLEMENTATION_CLASS_UID,
		ac.implementation_class_uid.as_bytes(),
	);
	put_item(
		&mut info,
		ITEM_IMPLEMENTATION_VERSION_NAME,
		ac.implementation_version_name.as_bytes(),
	);
	put_item(&mut buf, ITEM_USER_INFORMATION, &info);

	buf
}

fn encode_pdata(pdvs: &[PresentationDataValue]) -> BytesMut {
	let mut buf = BytesMut::new();
	for pdv in pdvs {
		buf.put_u32(u32::try_from(pdv.data.len() + 2).expect("PDV fits in u32"));
		buf.put_u8(pdv.context_id);
		let mut control = 0u8;
		if pdv.is_command {
			control |= 0b01;
		}
		if pdv.is_last {
			control |= 0b10;
		}
		buf.put_u8(control);
		buf.put_slice(&pdv.data);
	}
	buf
}
