// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Kernel struct field offsets resolved from BTF.
//!
//! The tracer program dereferences `task_struct` directly, so it needs the
//! byte offsets of `tgid` and `real_parent` for the running kernel build.
//! These are read from the kernel's BTF blob once at startup instead of
//! being compiled in.

use std::borrow::Cow;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

pub const VMLINUX_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

pub const TASK_STRUCT: &str = "task_struct";
pub const TGID_FIELD: &str = "tgid";
pub const REAL_PARENT_FIELD: &str = "real_parent";

const BTF_MAGIC: u16 = 0xeb9f;
const BTF_HEADER_LEN: usize = 24;

const BTF_KIND_INT: u32 = 1;
const BTF_KIND_PTR: u32 = 2;
const BTF_KIND_ARRAY: u32 = 3;
const BTF_KIND_STRUCT: u32 = 4;
const BTF_KIND_UNION: u32 = 5;
const BTF_KIND_ENUM: u32 = 6;
const BTF_KIND_FWD: u32 = 7;
const BTF_KIND_TYPEDEF: u32 = 8;
const BTF_KIND_VOLATILE: u32 = 9;
const BTF_KIND_CONST: u32 = 10;
const BTF_KIND_RESTRICT: u32 = 11;
const BTF_KIND_FUNC: u32 = 12;
const BTF_KIND_FUNC_PROTO: u32 = 13;
const BTF_KIND_VAR: u32 = 14;
const BTF_KIND_DATASEC: u32 = 15;
const BTF_KIND_FLOAT: u32 = 16;
const BTF_KIND_DECL_TAG: u32 = 17;
const BTF_KIND_TYPE_TAG: u32 = 18;
const BTF_KIND_ENUM64: u32 = 19;

#[derive(Debug, Error)]
pub enum BtfError {
	#[error("failed to read BTF from {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid BTF magic {0:#06x}")]
	BadMagic(u16),

	#[error("truncated BTF data while reading {0}")]
	Truncated(&'static str),

	#[error("unknown BTF kind {kind} at type id {type_id}")]
	UnknownKind { kind: u32, type_id: u32 },

	#[error("invalid BTF string offset {0}")]
	InvalidString(u32),
}

/// Reasons the tracer cannot learn where `tgid`/`real_parent` live.
///
/// Every variant is fatal to tracer construction.
#[derive(Debug, Error)]
pub enum OffsetsUnavailable {
	#[error("kernel field offsets unavailable: {0}")]
	Metadata(#[from] BtfError),

	#[error("kernel field offsets unavailable: struct {0} not found in BTF")]
	StructNotFound(String),

	#[error("kernel field offsets unavailable: field {struct_name}.{field} not found")]
	FieldNotFound { struct_name: String, field: String },

	#[error("kernel field offsets unavailable: {struct_name}.{field} is a bitfield")]
	Bitfield { struct_name: String, field: String },

	#[error("kernel field offsets unavailable: {struct_name} nests anonymous members deeper than {}", MAX_TYPE_DEPTH)]
	TooDeep { struct_name: String, field: String },

	#[error("kernel field offsets unavailable: {struct_name}.{field} at byte {offset} exceeds 31 bits")]
	OutOfRange {
		struct_name: String,
		field: String,
		offset: u64,
	},
}

/// Bound on type-chain walks and anonymous member nesting.
pub const MAX_TYPE_DEPTH: usize = 32;

/// A resolved field of a kernel struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelFieldOffset {
	pub field: &'static str,
	pub offset: i32,
}

/// The two `task_struct` offsets the exec-exit program needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOffsets {
	pub tgid: KernelFieldOffset,
	pub real_parent: KernelFieldOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
	Little,
	Big,
}

#[derive(Debug, Clone, Copy)]
struct Member {
	name_off: u32,
	type_id: u32,
	offset: u32,
}

#[derive(Debug, Clone)]
struct TypeEntry {
	name_off: u32,
	kind: u32,
	kind_flag: bool,
	type_ref: u32,
	members: Vec<Member>,
}

/// Parsed kernel BTF: the type table and the string section.
#[derive(Debug)]
pub struct Btf {
	// index 0 is the implicit `void` type
	types: Vec<TypeEntry>,
	strings: Vec<u8>,
}

struct Cursor<'a> {
	data: &'a [u8],
	pos: usize,
	endian: Endian,
}

impl<'a> Cursor<'a> {
	fn u32(&mut self, what: &'static str) -> Result<u32, BtfError> {
		let bytes: [u8; 4] = self
			.data
			.get(self.pos..self.pos + 4)
			.and_then(|b| b.try_into().ok())
			.ok_or(BtfError::Truncated(what))?;
		self.pos += 4;
		Ok(match self.endian {
			Endian::Little => u32::from_le_bytes(bytes),
			Endian::Big => u32::from_be_bytes(bytes),
		})
	}

	fn skip(&mut self, len: usize, what: &'static str) -> Result<(), BtfError> {
		if self.pos + len > self.data.len() {
			return Err(BtfError::Truncated(what));
		}
		self.pos += len;
		Ok(())
	}
}

impl Btf {
	/// Load the running kernel's BTF.
	pub fn from_sys_fs() -> Result<Self, BtfError> {
		Self::from_path(Path::new(VMLINUX_BTF_PATH))
	}

	pub fn from_path(path: &Path) -> Result<Self, BtfError> {
		let data = std::fs::read(path).map_err(|source| BtfError::Read {
			path: path.display().to_string(),
			source,
		})?;
		Self::parse(&data)
	}

	pub fn parse(data: &[u8]) -> Result<Self, BtfError> {
		if data.len() < BTF_HEADER_LEN {
			return Err(BtfError::Truncated("header"));
		}

		let raw_magic = u16::from_le_bytes([data[0], data[1]]);
		let endian = if raw_magic == BTF_MAGIC {
			Endian::Little
		} else if raw_magic.swap_bytes() == BTF_MAGIC {
			Endian::Big
		} else {
			return Err(BtfError::BadMagic(raw_magic));
		};

		let mut header = Cursor {
			data,
			pos: 4,
			endian,
		};
		let hdr_len = header.u32("header")? as usize;
		let type_off = header.u32("header")? as usize;
		let type_len = header.u32("header")? as usize;
		let str_off = header.u32("header")? as usize;
		let str_len = header.u32("header")? as usize;

		let type_start = hdr_len + type_off;
		let type_section = data
			.get(type_start..type_start + type_len)
			.ok_or(BtfError::Truncated("type section"))?;
		let str_start = hdr_len + str_off;
		let strings = data
			.get(str_start..str_start + str_len)
			.ok_or(BtfError::Truncated("string section"))?
			.to_vec();

		let types = parse_types(type_section, endian)?;
		debug!(types = types.len(), "Parsed kernel BTF");

		Ok(Self { types, strings })
	}

	fn name(&self, offset: u32) -> Result<Cow<'_, str>, BtfError> {
		let start = offset as usize;
		let tail = self
			.strings
			.get(start..)
			.ok_or(BtfError::InvalidString(offset))?;
		let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
		Ok(String::from_utf8_lossy(&tail[..end]))
	}

	fn find_struct(&self, name: &str) -> Result<Option<&TypeEntry>, BtfError> {
		for entry in &self.types {
			if entry.kind == BTF_KIND_STRUCT && self.name(entry.name_off)? == name {
				return Ok(Some(entry));
			}
		}
		Ok(None)
	}

	/// Follow typedef/const/volatile/restrict/type-tag chains to the underlying type.
	fn resolve(&self, mut type_id: u32) -> Option<&TypeEntry> {
		for _ in 0..MAX_TYPE_DEPTH {
			let entry = self.types.get(type_id as usize)?;
			match entry.kind {
				BTF_KIND_TYPEDEF | BTF_KIND_VOLATILE | BTF_KIND_CONST | BTF_KIND_RESTRICT
				| BTF_KIND_TYPE_TAG => type_id = entry.type_ref,
				_ => return Some(entry),
			}
		}
		None
	}

	/// Search `entry` for `field`, descending into anonymous struct/union
	/// members. Returns the field's bit offset from the start of `entry`.
	fn member_bit_offset(
		&self,
		entry: &TypeEntry,
		field: &str,
		struct_name: &str,
		depth: usize,
	) -> Result<Option<u64>, OffsetsUnavailable> {
		if depth > MAX_TYPE_DEPTH {
			return Err(OffsetsUnavailable::TooDeep {
				struct_name: struct_name.to_string(),
				field: field.to_string(),
			});
		}
		for member in &entry.members {
			let (bit_offset, bitfield_size) = if entry.kind_flag {
				(member.offset & 0x00ff_ffff, member.offset >> 24)
			} else {
				(member.offset, 0)
			};

			if member.name_off == 0 {
				let nested = match self.resolve(member.type_id) {
					Some(t) if t.kind == BTF_KIND_STRUCT || t.kind == BTF_KIND_UNION => t,
					_ => continue,
				};
				if let Some(inner) = self.member_bit_offset(nested, field, struct_name, depth + 1)? {
					return Ok(Some(u64::from(bit_offset) + inner));
				}
				continue;
			}

			if self.name(member.name_off)? != field {
				continue;
			}
			if bitfield_size != 0 || bit_offset % 8 != 0 {
				return Err(OffsetsUnavailable::Bitfield {
					struct_name: struct_name.to_string(),
					field: field.to_string(),
				});
			}
			return Ok(Some(u64::from(bit_offset)));
		}
		Ok(None)
	}

	/// Byte offset of `struct_name.field`, which must fit in a signed 32-bit
	/// instruction immediate.
	pub fn field_offset(&self, struct_name: &str, field: &str) -> Result<i32, OffsetsUnavailable> {
		let entry = self
			.find_struct(struct_name)?
			.ok_or_else(|| OffsetsUnavailable::StructNotFound(struct_name.to_string()))?;
		let bits = self
			.member_bit_offset(entry, field, struct_name, 0)?
			.ok_or_else(|| OffsetsUnavailable::FieldNotFound {
				struct_name: struct_name.to_string(),
				field: field.to_string(),
			})?;
		checked_byte_offset(bits).ok_or_else(|| OffsetsUnavailable::OutOfRange {
			struct_name: struct_name.to_string(),
			field: field.to_string(),
			offset: bits / 8,
		})
	}
}

fn checked_byte_offset(bits: u64) -> Option<i32> {
	i32::try_from(bits / 8).ok()
}

fn parse_types(section: &[u8], endian: Endian) -> Result<Vec<TypeEntry>, BtfError> {
	let mut cursor = Cursor {
		data: section,
		pos: 0,
		endian,
	};
	let mut types = vec![TypeEntry {
		name_off: 0,
		kind: 0,
		kind_flag: false,
		type_ref: 0,
		members: Vec::new(),
	}];

	while cursor.pos < section.len() {
		let type_id = types.len() as u32;
		let name_off = cursor.u32("type")?;
		let info = cursor.u32("type")?;
		let type_ref = cursor.u32("type")?;

		let vlen = (info & 0xffff) as usize;
		let kind = (info >> 24) & 0x1f;
		let kind_flag = info >> 31 == 1;

		let mut members = Vec::new();
		match kind {
			BTF_KIND_STRUCT | BTF_KIND_UNION => {
				members.reserve(vlen);
				for _ in 0..vlen {
					members.push(Member {
						name_off: cursor.u32("member")?,
						type_id: cursor.u32("member")?,
						offset: cursor.u32("member")?,
					});
				}
			}
			BTF_KIND_INT | BTF_KIND_VAR | BTF_KIND_DECL_TAG => cursor.skip(4, "type data")?,
			BTF_KIND_ARRAY => cursor.skip(12, "array")?,
			BTF_KIND_ENUM | BTF_KIND_FUNC_PROTO => cursor.skip(8 * vlen, "type data")?,
			BTF_KIND_DATASEC | BTF_KIND_ENUM64 => cursor.skip(12 * vlen, "type data")?,
			BTF_KIND_PTR | BTF_KIND_FWD | BTF_KIND_TYPEDEF | BTF_KIND_VOLATILE | BTF_KIND_CONST
			| BTF_KIND_RESTRICT | BTF_KIND_FUNC | BTF_KIND_FLOAT | BTF_KIND_TYPE_TAG => {}
			_ => return Err(BtfError::UnknownKind { kind, type_id }),
		}

		types.push(TypeEntry {
			name_off,
			kind,
			kind_flag,
			type_ref,
			members,
		});
	}

	Ok(types)
}

/// Resolve `task_struct.tgid` and `task_struct.real_parent` from `btf`.
pub fn resolve_task_offsets(btf: &Btf) -> Result<TaskOffsets, OffsetsUnavailable> {
	let tgid = btf.field_offset(TASK_STRUCT, TGID_FIELD)?;
	let real_parent = btf.field_offset(TASK_STRUCT, REAL_PARENT_FIELD)?;
	debug!(tgid, real_parent, "Resolved task_struct offsets");
	Ok(TaskOffsets {
		tgid: KernelFieldOffset {
			field: TGID_FIELD,
			offset: tgid,
		},
		real_parent: KernelFieldOffset {
			field: REAL_PARENT_FIELD,
			offset: real_parent,
		},
	})
}

/// Load BTF from `path` and resolve the task offsets.
pub fn resolve(path: &Path) -> Result<TaskOffsets, OffsetsUnavailable> {
	let btf = Btf::from_path(path)?;
	resolve_task_offsets(&btf)
}
