// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Decoding of the 8-byte exec-exit ring buffer records.

use thiserror::Error;

/// Bytes a record must carry: parent tgid then current tgid, host order.
pub const RECORD_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
	#[error("record too short: {len} bytes, need {RECORD_LEN}")]
	TooShort { len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
	Little,
	Big,
}

impl ByteOrder {
	/// The byte order of this host, probed once from an integer's in-memory
	/// representation.
	pub fn native() -> Self {
		if 1u16.to_ne_bytes()[0] == 1 {
			ByteOrder::Little
		} else {
			ByteOrder::Big
		}
	}

	fn read_u32(self, bytes: [u8; 4]) -> u32 {
		match self {
			ByteOrder::Little => u32::from_le_bytes(bytes),
			ByteOrder::Big => u32::from_be_bytes(bytes),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecRecord {
	pub parent_tgid: u32,
	pub current_tgid: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordDecoder {
	order: ByteOrder,
}

impl Default for RecordDecoder {
	fn default() -> Self {
		Self::new()
	}
}

impl RecordDecoder {
	pub fn new() -> Self {
		Self::with_byte_order(ByteOrder::native())
	}

	pub fn with_byte_order(order: ByteOrder) -> Self {
		Self { order }
	}

	pub fn byte_order(&self) -> ByteOrder {
		self.order
	}

	/// Decode `[parent tgid][current tgid]`. Trailing bytes are ignored.
	pub fn decode(&self, record: &[u8]) -> Result<ExecRecord, DecodeError> {
		if record.len() < RECORD_LEN {
			return Err(DecodeError::TooShort { len: record.len() });
		}
		let word = |at: usize| [record[at], record[at + 1], record[at + 2], record[at + 3]];
		Ok(ExecRecord {
			parent_tgid: self.order.read_u32(word(0)),
			current_tgid: self.order.read_u32(word(4)),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn test_decode_little_endian() {
		let decoder = RecordDecoder::with_byte_order(ByteOrder::Little);
		let record = decoder.decode(&[0x10, 0x27, 0, 0, 0x39, 0x30, 0, 0]).unwrap();
		assert_eq!(
			record,
			ExecRecord {
				parent_tgid: 10_000,
				current_tgid: 12_345,
			}
		);
	}

	#[test]
	fn test_decode_big_endian() {
		let decoder = RecordDecoder::with_byte_order(ByteOrder::Big);
		let record = decoder.decode(&[0, 0, 0x27, 0x10, 0, 0, 0x30, 0x39]).unwrap();
		assert_eq!(record.parent_tgid, 10_000);
		assert_eq!(record.current_tgid, 12_345);
	}

	#[test]
	fn test_native_matches_target() {
		let expected = if cfg!(target_endian = "little") {
			ByteOrder::Little
		} else {
			ByteOrder::Big
		};
		assert_eq!(RecordDecoder::new().byte_order(), expected);
	}

	#[test]
	fn test_short_record() {
		let decoder = RecordDecoder::new();
		assert_eq!(decoder.decode(&[1, 2, 3]), Err(DecodeError::TooShort { len: 3 }));
		assert_eq!(decoder.decode(&[]), Err(DecodeError::TooShort { len: 0 }));
	}

	proptest! {
		#[test]
		fn short_records_always_fail(bytes in proptest::collection::vec(any::<u8>(), 0..RECORD_LEN)) {
			let len = bytes.len();
			prop_assert_eq!(RecordDecoder::new().decode(&bytes), Err(DecodeError::TooShort { len }));
		}

		#[test]
		fn decode_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), RECORD_LEN..32)) {
			let decoder = RecordDecoder::new();
			let first = decoder.decode(&bytes).unwrap();
			prop_assert_eq!(decoder.decode(&bytes).unwrap(), first);
		}

		#[test]
		fn native_decode_matches_ne_bytes(parent in any::<u32>(), current in any::<u32>()) {
			let mut bytes = parent.to_ne_bytes().to_vec();
			bytes.extend_from_slice(&current.to_ne_bytes());
			let record = RecordDecoder::new().decode(&bytes).unwrap();
			prop_assert_eq!(record.parent_tgid, parent);
			prop_assert_eq!(record.current_tgid, current);
		}
	}
}
