// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! A small eBPF assembler.
//!
//! Programs are built as an ordered list of typed [`Insn`]s with symbolic
//! [`Label`]s as jump targets. [`ProgramBuilder::assemble`] resolves labels to
//! relative offsets and encodes the kernel's 8-byte `bpf_insn` layout.

use std::collections::HashMap;
use std::os::fd::RawFd;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
	#[error("jump to undefined label '{0}'")]
	UndefinedLabel(&'static str),

	#[error("label '{0}' defined more than once")]
	DuplicateLabel(&'static str),

	#[error("label '{0}' does not precede an instruction")]
	DanglingLabel(&'static str),

	#[error("jump to '{label}' spans {distance} instructions, beyond the 16-bit offset range")]
	JumpOutOfRange { label: &'static str, distance: i64 },

	#[error("program is empty")]
	Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
	R0 = 0,
	R1,
	R2,
	R3,
	R4,
	R5,
	R6,
	R7,
	R8,
	R9,
	/// Read-only frame pointer.
	R10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub &'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
	W,
	DW,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JmpCond {
	Eq,
	Ne,
}

/// Kernel helper functions called by the tracer program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Helper {
	GetCurrentTask = 35,
	ProbeReadKernel = 113,
	RingbufReserve = 131,
	RingbufSubmit = 132,
	RingbufDiscard = 133,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
	/// Marks a jump target; occupies no instruction slot.
	Label(Label),
	MovImm { dst: Reg, imm: i32 },
	MovReg { dst: Reg, src: Reg },
	AddImm { dst: Reg, imm: i32 },
	/// `dst = *(size *)(src + off)`
	LoadMem { dst: Reg, src: Reg, off: i16, size: Size },
	/// 64-bit immediate load of a map file descriptor; occupies two slots.
	LoadMapFd { dst: Reg, fd: RawFd },
	Call(Helper),
	/// Jump to `target` if `reg <cond> imm` (64-bit compare, `imm` sign-extended).
	JumpImm {
		cond: JmpCond,
		reg: Reg,
		imm: i32,
		target: Label,
	},
	Jump(Label),
	Exit,
}

impl Insn {
	fn slots(&self) -> usize {
		match self {
			Insn::Label(_) => 0,
			Insn::LoadMapFd { .. } => 2,
			_ => 1,
		}
	}
}

// Instruction classes, modes and operations from linux/bpf_common.h.
const BPF_LD: u8 = 0x00;
const BPF_LDX: u8 = 0x01;
const BPF_JMP: u8 = 0x05;
const BPF_ALU64: u8 = 0x07;

const BPF_W: u8 = 0x00;
const BPF_DW: u8 = 0x18;
const BPF_IMM: u8 = 0x00;
const BPF_MEM: u8 = 0x60;

const BPF_K: u8 = 0x00;
const BPF_X: u8 = 0x08;

const BPF_ADD: u8 = 0x00;
const BPF_MOV: u8 = 0xb0;

const BPF_JA: u8 = 0x00;
const BPF_JEQ: u8 = 0x10;
const BPF_JNE: u8 = 0x50;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;

const BPF_PSEUDO_MAP_FD: u8 = 1;

/// Wire encoding of one instruction slot (`struct bpf_insn`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawInsn {
	pub code: u8,
	/// `dst_reg:4, src_reg:4` bitfield in host bit order.
	pub regs: u8,
	pub off: i16,
	pub imm: i32,
}

impl RawInsn {
	fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
		#[cfg(target_endian = "little")]
		let regs = (src << 4) | (dst & 0x0f);
		#[cfg(target_endian = "big")]
		let regs = (dst << 4) | (src & 0x0f);
		Self {
			code,
			regs,
			off,
			imm,
		}
	}

	pub fn dst(&self) -> u8 {
		#[cfg(target_endian = "little")]
		return self.regs & 0x0f;
		#[cfg(target_endian = "big")]
		return self.regs >> 4;
	}

	pub fn src(&self) -> u8 {
		#[cfg(target_endian = "little")]
		return self.regs >> 4;
		#[cfg(target_endian = "big")]
		return self.regs & 0x0f;
	}
}

/// An ordered, label-addressed instruction sequence.
#[derive(Debug, Clone, Default)]
pub struct ProgramBuilder {
	insns: Vec<Insn>,
}

impl ProgramBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, insn: Insn) -> &mut Self {
		self.insns.push(insn);
		self
	}

	pub fn label(&mut self, label: Label) -> &mut Self {
		self.push(Insn::Label(label))
	}

	pub fn insns(&self) -> &[Insn] {
		&self.insns
	}

	fn label_slots(&self) -> Result<HashMap<Label, usize>, AsmError> {
		let total: usize = self.insns.iter().map(Insn::slots).sum();
		let mut slots = HashMap::new();
		let mut pc = 0;
		for insn in &self.insns {
			if let Insn::Label(label) = insn {
				if slots.insert(*label, pc).is_some() {
					return Err(AsmError::DuplicateLabel(label.0));
				}
				if pc >= total {
					return Err(AsmError::DanglingLabel(label.0));
				}
			}
			pc += insn.slots();
		}
		Ok(slots)
	}

	/// Resolve labels and encode the program.
	pub fn assemble(&self) -> Result<Vec<RawInsn>, AsmError> {
		let labels = self.label_slots()?;
		let mut out = Vec::with_capacity(self.insns.len() + 1);

		let jump_offset = |pc: usize, target: Label| -> Result<i16, AsmError> {
			let slot = *labels
				.get(&target)
				.ok_or(AsmError::UndefinedLabel(target.0))?;
			let distance = slot as i64 - (pc as i64 + 1);
			i16::try_from(distance).map_err(|_| AsmError::JumpOutOfRange {
				label: target.0,
				distance,
			})
		};

		for insn in &self.insns {
			let pc = out.len();
			match *insn {
				Insn::Label(_) => {}
				Insn::MovImm { dst, imm } => {
					out.push(RawInsn::new(BPF_ALU64 | BPF_MOV | BPF_K, dst as u8, 0, 0, imm))
				}
				Insn::MovReg { dst, src } => out.push(RawInsn::new(
					BPF_ALU64 | BPF_MOV | BPF_X,
					dst as u8,
					src as u8,
					0,
					0,
				)),
				Insn::AddImm { dst, imm } => {
					out.push(RawInsn::new(BPF_ALU64 | BPF_ADD | BPF_K, dst as u8, 0, 0, imm))
				}
				Insn::LoadMem {
					dst,
					src,
					off,
					size,
				} => {
					let size = match size {
						Size::W => BPF_W,
						Size::DW => BPF_DW,
					};
					out.push(RawInsn::new(
						BPF_LDX | BPF_MEM | size,
						dst as u8,
						src as u8,
						off,
						0,
					));
				}
				Insn::LoadMapFd { dst, fd } => {
					out.push(RawInsn::new(
						BPF_LD | BPF_IMM | BPF_DW,
						dst as u8,
						BPF_PSEUDO_MAP_FD,
						0,
						fd,
					));
					out.push(RawInsn::default());
				}
				Insn::Call(helper) => out.push(RawInsn::new(BPF_JMP | BPF_CALL, 0, 0, 0, helper as i32)),
				Insn::JumpImm {
					cond,
					reg,
					imm,
					target,
				} => {
					let op = match cond {
						JmpCond::Eq => BPF_JEQ,
						JmpCond::Ne => BPF_JNE,
					};
					let off = jump_offset(pc, target)?;
					out.push(RawInsn::new(BPF_JMP | op | BPF_K, reg as u8, 0, off, imm));
				}
				Insn::Jump(target) => {
					let off = jump_offset(pc, target)?;
					out.push(RawInsn::new(BPF_JMP | BPF_JA, 0, 0, off, 0));
				}
				Insn::Exit => out.push(RawInsn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0)),
			}
		}

		if out.is_empty() {
			return Err(AsmError::Empty);
		}
		Ok(out)
	}
}
