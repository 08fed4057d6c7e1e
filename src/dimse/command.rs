//! Minimal DIMSE command set codec.
//!
//! Command sets are always encoded in implicit VR little endian, regardless of
//! the negotiated transfer syntax of the data set that may follow them.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>

use crate::types::{UI, US};
use bytes::{BufMut, Bytes, BytesMut};
use dicom_core::Tag;
use dicom_dictionary_std::{tags, uids};
use thiserror::Error;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_C_STORE_RQ: US = 0x0001;
pub const COMMAND_FIELD_C_STORE_RSP: US = 0x8001;
pub const COMMAND_FIELD_C_ECHO_RQ: US = 0x0030;
pub const COMMAND_FIELD_C_ECHO_RSP: US = 0x8030;

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if no data set follows.
/// Any other value announces a data set; AEs are free to pick one.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

pub const STATUS_SUCCESS: US = 0x0000;
/// Refused: out of resources. Returned when the ingestion queue refuses an object.
pub const STATUS_OUT_OF_RESOURCES: US = 0xA700;

#[derive(Debug, Error)]
pub enum CommandError {
	#[error("Command set is truncated")]
	Truncated,
	#[error("Missing mandatory command element {0}")]
	MissingElement(Tag),
}

/// The command fields the intake service acts upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
	pub command_field: US,
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub has_data_set: bool,
}

impl CommandSet {
	/// Parses a reassembled command set.
	///
	/// The declared command group length bounds the scan, separating the
	/// command portion from anything that may trail it. Elements outside
	/// group 0000 end the scan as well.
	pub fn parse(bytes: &[u8]) -> Result<Self, CommandError> {
		let mut pos = 0usize;
		let mut end = bytes.len();

		let mut command_field = None;
		let mut message_id = None;
		let mut sop_class_uid = UI::new();
		let mut sop_instance_uid = UI::new();
		let mut data_set_type = DATA_SET_MISSING;

		while pos + 8 <= end {
			let group = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
			let element = u16::from_le_bytes([bytes[pos + 2], bytes[pos + 3]]);
			let length =
				u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]])
					as usize;
			pos += 8;
			if group != 0x0000 {
				break;
			}
			if pos + length > end {
				return Err(CommandError::Truncated);
			}
			let value = &bytes[pos..pos + length];
			pos += length;

			match Tag(group, element) {
				tags::COMMAND_GROUP_LENGTH => {
					// The group length counts the bytes that follow it.
					end = end.min(pos + read_ul(value) as usize);
				}
				tags::AFFECTED_SOP_CLASS_UID => sop_class_uid = read_uid(value),
				tags::AFFECTED_SOP_INSTANCE_UID => sop_instance_uid = read_uid(value),
				tags::COMMAND_FIELD => command_field = Some(read_us(value)?),
				tags::MESSAGE_ID | tags::MESSAGE_ID_BEING_RESPONDED_TO => {
					message_id = Some(read_us(value)?);
				}
				tags::COMMAND_DATA_SET_TYPE => data_set_type = read_us(value)?,
				_ => {}
			}
		}

		Ok(Self {
			command_field: command_field
				.ok_or(CommandError::MissingElement(tags::COMMAND_FIELD))?,
			message_id: message_id.ok_or(CommandError::MissingElement(tags::MESSAGE_ID))?,
			affected_sop_class_uid: sop_class_uid,
			affected_sop_instance_uid: sop_instance_uid,
			has_data_set: data_set_type != DATA_SET_MISSING,
		})
	}
}

fn read_us(value: &[u8]) -> Result<US, CommandError> {
	if value.len() < 2 {
		return Err(CommandError::Truncated);
	}
	Ok(u16::from_le_bytes([value[0], value[1]]))
}

fn read_ul(value: &[u8]) -> u32 {
	let mut raw = [0u8; 4];
	let n = value.len().min(4);
	raw[..n].copy_from_slice(&value[..n]);
	u32::from_le_bytes(raw)
}

fn read_uid(value: &[u8]) -> UI {
	String::from_utf8_lossy(value)
		.trim_end_matches([' ', '\0'])
		.to_string()
}

/// C-STORE-RSP
#[derive(Debug, Clone)]
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl CompositeStoreResponse {
	pub fn to_command_bytes(&self) -> Bytes {
		let mut writer = CommandWriter::default();
		writer.uid(tags::AFFECTED_SOP_CLASS_UID, &self.sop_class_uid);
		writer.ushort(tags::COMMAND_FIELD, COMMAND_FIELD_C_STORE_RSP);
		writer.ushort(tags::MESSAGE_ID_BEING_RESPONDED_TO, self.message_id);
		writer.ushort(tags::COMMAND_DATA_SET_TYPE, DATA_SET_MISSING);
		writer.ushort(tags::STATUS, self.status);
		writer.uid(tags::AFFECTED_SOP_INSTANCE_UID, &self.sop_instance_uid);
		writer.finish()
	}
}

/// C-ECHO-RSP
#[derive(Debug, Clone)]
pub struct EchoResponse {
	pub message_id: US,
}

impl EchoResponse {
	pub fn to_command_bytes(&self) -> Bytes {
		let mut writer = CommandWriter::default();
		writer.uid(tags::AFFECTED_SOP_CLASS_UID, uids::VERIFICATION);
		writer.ushort(tags::COMMAND_FIELD, COMMAND_FIELD_C_ECHO_RSP);
		writer.ushort(tags::MESSAGE_ID_BEING_RESPONDED_TO, self.message_id);
		writer.ushort(tags::COMMAND_DATA_SET_TYPE, DATA_SET_MISSING);
		writer.ushort(tags::STATUS, STATUS_SUCCESS);
		writer.finish()
	}
}

/// Writes implicit VR little endian command elements and prefixes the result
/// with the mandatory command group length element.
#[derive(Debug, Default)]
struct CommandWriter {
	body: BytesMut,
}

impl CommandWriter {
	fn element(&mut self, tag: Tag, value: &[u8]) {
		self.body.put_u16_le(tag.group());
		self.body.put_u16_le(tag.element());
		self.body
			.put_u32_le(u32::try_from(value.len()).expect("element value fits in u32"));
		self.body.put_slice(value);
	}

	fn uid(&mut self, tag: Tag, value: &str) {
		// UI values are padded to even length with a trailing NUL.
		if value.len() % 2 == 0 {
			self.element(tag, value.as_bytes());
		} else {
			let mut padded = Vec::with_capacity(value.len() + 1);
			padded.extend_from_slice(value.as_bytes());
			padded.push(0x00);
			self.element(tag, &padded);
		}
	}

	fn ushort(&mut self, tag: Tag, value: US) {
		self.element(tag, &value.to_le_bytes());
	}

	fn finish(self) -> Bytes {
		let mut buf = BytesMut::with_capacity(self.body.len() + 12);
		buf.put_u16_le(tags::COMMAND_GROUP_LENGTH.group());
		buf.put_u16_le(tags::COMMAND_GROUP_LENGTH.element());
		buf.put_u32_le(4);
		buf.put_u32_le(u32::try_from(self.body.len()).expect("command set fits in u32"));
		buf.extend_from_slice(&self.body);
		buf.freeze()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn store_response_roundtrip() {
		let response = CompositeStoreResponse {
			message_id: 7,
			sop_class_uid: UI::from(uids::CT_IMAGE_STORAGE),
			sop_instance_uid: UI::from("1.2.3.4"),
			status: STATUS_SUCCESS,
		};

		let parsed = CommandSet::parse(&response.to_command_bytes()).unwrap();
		assert_eq!(parsed.command_field, COMMAND_FIELD_C_STORE_RSP);
		assert_eq!(parsed.message_id, 7);
		assert_eq!(parsed.affected_sop_class_uid, uids::CT_IMAGE_STORAGE);
		assert_eq!(parsed.affected_sop_instance_uid, "1.2.3.4");
		assert!(!parsed.has_data_set);
	}

	#[test]
	fn group_length_bounds_the_scan() {
		let response = EchoResponse { message_id: 1 }.to_command_bytes();
		let mut with_trailer = response.to_vec();
		// Garbage after the declared group length must not disturb parsing.
		with_trailer.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

		let parsed = CommandSet::parse(&with_trailer).unwrap();
		assert_eq!(parsed.command_field, COMMAND_FIELD_C_ECHO_RSP);
	}

	#[test]
	fn missing_command_field_is_an_error() {
		let err = CommandSet::parse(&[]).unwrap_err();
		assert!(matches!(
			err,
			CommandError::MissingElement(tag) if tag == tags::COMMAND_FIELD
		));
	}
}
