//! Streaming extraction of identifying metadata from received objects.
//!
//! The decoder performs one forward scan over the data-set bytes and only
//! materializes values for the fixed set of identifier tags below. Everything
//! else is skipped by its declared length, so a field is never populated from
//! a coincidental byte pattern and cost stays linear in the object size.

use crate::types::UI;
use chrono::NaiveDate;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::{tags, uids};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const ITEM: Tag = Tag(0xFFFE, 0xE000);
const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);

/// Data sets are tag-ordered, so nothing of interest follows this tag.
const LAST_TAG_OF_INTEREST: Tag = tags::SERIES_INSTANCE_UID;

/// Nesting bound for undefined-length sequences while skipping.
const MAX_SEQUENCE_DEPTH: u8 = 64;

/// The encodings this node negotiates and can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSyntax {
	ImplicitVrLittleEndian,
	ExplicitVrLittleEndian,
}

impl TransferSyntax {
	pub fn from_uid(uid: &str) -> Option<Self> {
		match uid {
			uids::IMPLICIT_VR_LITTLE_ENDIAN => Some(Self::ImplicitVrLittleEndian),
			uids::EXPLICIT_VR_LITTLE_ENDIAN => Some(Self::ExplicitVrLittleEndian),
			_ => None,
		}
	}
}

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("Object carries no StudyInstanceUID (0020,000D)")]
	MissingStudyInstanceUid,
	#[error("Transfer syntax '{0}' is not decodable")]
	UnsupportedTransferSyntax(UI),
	#[error("Data element at offset {0} is truncated")]
	TruncatedElement(usize),
	#[error("Sequence at offset {0} is malformed")]
	MalformedSequence(usize),
}

/// A patient name split on the standard `^` component separator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonName {
	pub family: String,
	pub given: String,
}

impl PersonName {
	fn parse(value: &str) -> Self {
		// Only the alphabetic component group is of interest.
		let alphabetic = value.split('=').next().unwrap_or_default();
		let mut components = alphabetic.split('^');
		Self {
			family: components.next().unwrap_or_default().trim().to_string(),
			given: components.next().unwrap_or_default().trim().to_string(),
		}
	}
}

/// The fixed identifier record extracted from one received object.
/// Absent fields stay empty; they are never guessed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedObject {
	pub source_patient_id: String,
	pub patient_name: Option<PersonName>,
	pub sex: String,
	pub birth_date: Option<NaiveDate>,
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	pub modality: String,
	pub study_date: Option<NaiveDate>,
	pub study_time: String,
	pub accession_number: String,
	pub study_description: String,
}

/// The built-in dictionary: value representations for the tags of interest.
/// Implicit VR data sets resolve their VR from here; everything else is
/// skipped without a VR.
const fn vr_of(tag: Tag) -> Option<VR> {
	match tag {
		tags::SOP_INSTANCE_UID | tags::STUDY_INSTANCE_UID | tags::SERIES_INSTANCE_UID => {
			Some(VR::UI)
		}
		tags::STUDY_DATE | tags::PATIENT_BIRTH_DATE => Some(VR::DA),
		tags::STUDY_TIME => Some(VR::TM),
		tags::ACCESSION_NUMBER => Some(VR::SH),
		tags::MODALITY | tags::PATIENT_SEX => Some(VR::CS),
		tags::STUDY_DESCRIPTION | tags::PATIENT_ID => Some(VR::LO),
		tags::PATIENT_NAME => Some(VR::PN),
		_ => None,
	}
}

/// Decodes the identifier record from `data`, encoded with `transfer_syntax`.
///
/// The scan ends as soon as the tag order passes the last tag of interest or
/// the buffer is exhausted. A missing StudyInstanceUID is fatal; any other
/// absent field simply stays empty.
pub fn decode(data: &[u8], transfer_syntax: &str) -> Result<DecodedObject, DecodeError> {
	let Some(syntax) = TransferSyntax::from_uid(transfer_syntax) else {
		return Err(DecodeError::UnsupportedTransferSyntax(UI::from(
			transfer_syntax,
		)));
	};

	let mut scanner = ElementScanner {
		buf: data,
		pos: 0,
		explicit_vr: syntax == TransferSyntax::ExplicitVrLittleEndian,
	};
	let mut decoded = DecodedObject::default();

	while let Some(element) = scanner.next_element()? {
		if element.tag > LAST_TAG_OF_INTEREST {
			break;
		}
		let Some(vr) = vr_of(element.tag) else {
			continue;
		};
		let text = decode_text(element.value);

		match (element.tag, vr) {
			(tags::PATIENT_ID, VR::LO) => decoded.source_patient_id = text,
			(tags::PATIENT_NAME, VR::PN) => decoded.patient_name = Some(PersonName::parse(&text)),
			(tags::PATIENT_SEX, VR::CS) => decoded.sex = text,
			(tags::PATIENT_BIRTH_DATE, VR::DA) => decoded.birth_date = parse_date(&text),
			(tags::STUDY_INSTANCE_UID, VR::UI) => decoded.study_instance_uid = text,
			(tags::SERIES_INSTANCE_UID, VR::UI) => decoded.series_instance_uid = text,
			(tags::SOP_INSTANCE_UID, VR::UI) => decoded.sop_instance_uid = text,
			(tags::MODALITY, VR::CS) => decoded.modality = text,
			(tags::STUDY_DATE, VR::DA) => decoded.study_date = parse_date(&text),
			(tags::STUDY_TIME, VR::TM) => decoded.study_time = text,
			(tags::ACCESSION_NUMBER, VR::SH) => decoded.accession_number = text,
			(tags::STUDY_DESCRIPTION, VR::LO) => decoded.study_description = text,
			_ => {}
		}

		if !decoded.study_instance_uid.is_empty() && element.tag == LAST_TAG_OF_INTEREST {
			break;
		}
	}

	if decoded.study_instance_uid.is_empty() {
		return Err(DecodeError::MissingStudyInstanceUid);
	}
	Ok(decoded)
}

fn decode_text(value: &[u8]) -> String {
	String::from_utf8_lossy(value)
		.trim_end_matches([' ', '\0'])
		.trim_start_matches(' ')
		.to_string()
}

/// DA values are decimal `YYYYMMDD` strings. Anything unparsable is treated
/// as absent rather than guessed.
fn parse_date(value: &str) -> Option<NaiveDate> {
	NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

struct RawElement<'a> {
	tag: Tag,
	value: &'a [u8],
}

struct ElementScanner<'a> {
	buf: &'a [u8],
	pos: usize,
	explicit_vr: bool,
}

impl<'a> ElementScanner<'a> {
	/// Yields the next data element, skipping over the content of elements
	/// with undefined length. Returns `None` at end-of-buffer.
	fn next_element(&mut self) -> Result<Option<RawElement<'a>>, DecodeError> {
		if self.buf.len().saturating_sub(self.pos) < 8 {
			return Ok(None);
		}

		let tag = self.read_tag();
		let length = self.read_length(tag)?;

		if length == UNDEFINED_LENGTH {
			// Only sequence-like elements carry undefined lengths; their
			// content is irrelevant here and is skipped item by item.
			self.skip_undefined_sequence(0)?;
			return Ok(Some(RawElement { tag, value: &[] }));
		}

		let length = length as usize;
		if self.buf.len().saturating_sub(self.pos) < length {
			return Err(DecodeError::TruncatedElement(self.pos));
		}
		let value = &self.buf[self.pos..self.pos + length];
		self.pos += length;
		Ok(Some(RawElement { tag, value }))
	}

	fn read_tag(&mut self) -> Tag {
		let group = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
		let element = u16::from_le_bytes([self.buf[self.pos + 2], self.buf[self.pos + 3]]);
		self.pos += 4;
		Tag(group, element)
	}

	fn read_length(&mut self, tag: Tag) -> Result<u32, DecodeError> {
		// Item and delimitation tags always use the 4-byte length form,
		// even in explicit VR data sets.
		if !self.explicit_vr || tag.group() == 0xFFFE {
			return self.read_u32();
		}

		if self.buf.len().saturating_sub(self.pos) < 4 {
			return Err(DecodeError::TruncatedElement(self.pos));
		}
		let vr = [self.buf[self.pos], self.buf[self.pos + 1]];
		self.pos += 2;
		match &vr {
			b"OB" | b"OD" | b"OF" | b"OL" | b"OV" | b"OW" | b"SQ" | b"UC" | b"UN" | b"UR"
			| b"UT" => {
				// Long form: two reserved bytes, then a 4-byte length.
				self.pos += 2;
				self.read_u32()
			}
			_ => {
				let length = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
				self.pos += 2;
				Ok(u32::from(length))
			}
		}
	}

	fn read_u32(&mut self) -> Result<u32, DecodeError> {
		if self.buf.len().saturating_sub(self.pos) < 4 {
			return Err(DecodeError::TruncatedElement(self.pos));
		}
		let value = u32::from_le_bytes([
			self.buf[self.pos],
			self.buf[self.pos + 1],
			self.buf[self.pos + 2],
			self.buf[self.pos + 3],
		]);
		self.pos += 4;
		Ok(value)
	}

	/// Skips the items of an undefined-length sequence up to and including
	/// its sequence delimitation item.
	fn skip_undefined_sequence(&mut self, depth: u8) -> Result<(), DecodeError> {
		if depth >= MAX_SEQUENCE_DEPTH {
			return Err(DecodeError::MalformedSequence(self.pos));
		}
		loop {
			if self.buf.len().saturating_sub(self.pos) < 8 {
				return Err(DecodeError::TruncatedElement(self.pos));
			}
			let tag = self.read_tag();
			let length = self.read_u32()?;
			match tag {
				SEQUENCE_DELIMITATION => return Ok(()),
				ITEM if length == UNDEFINED_LENGTH => self.skip_undefined_item(depth + 1)?,
				ITEM => {
					let length = length as usize;
					if self.buf.len().saturating_sub(self.pos) < length {
						return Err(DecodeError::TruncatedElement(self.pos));
					}
					self.pos += length;
				}
				_ => return Err(DecodeError::MalformedSequence(self.pos)),
			}
		}
	}

	/// Skips the nested data set of an undefined-length item up to and
	/// including its item delimitation tag.
	fn skip_undefined_item(&mut self, depth: u8) -> Result<(), DecodeError> {
		if depth >= MAX_SEQUENCE_DEPTH {
			return Err(DecodeError::MalformedSequence(self.pos));
		}
		loop {
			if self.buf.len().saturating_sub(self.pos) < 8 {
				return Err(DecodeError::TruncatedElement(self.pos));
			}
			// Peek: an item delimitation ends the nested data set.
			let group = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
			let element = u16::from_le_bytes([self.buf[self.pos + 2], self.buf[self.pos + 3]]);
			if Tag(group, element) == ITEM_DELIMITATION {
				self.pos += 8;
				return Ok(());
			}

			let tag = self.read_tag();
			let length = self.read_length(tag)?;
			if length == UNDEFINED_LENGTH {
				self.skip_undefined_sequence(depth + 1)?;
			} else {
				let length = length as usize;
				if self.buf.len().saturating_sub(self.pos) < length {
					return Err(DecodeError::TruncatedElement(self.pos));
				}
				self.pos += length;
			}
		}
	}
}
