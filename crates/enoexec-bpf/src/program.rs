// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The exec-exit program.
//!
//! Runs on every `sys_exit_execve`. When the syscall returned `-ENOEXEC` it
//! emits an 8-byte record `[parent tgid][current tgid]` into the ring buffer.
//! The slot is reserved before any fallible kernel read, and every fallible
//! read jumps to a path that discards the reservation.

use std::os::fd::RawFd;

use crate::asm::{Helper, Insn, JmpCond, Label, ProgramBuilder, Reg, Size};
use crate::btf::TaskOffsets;

/// Offset of `long ret` in `trace_event_raw_sys_exit`.
pub const SYS_EXIT_RET_OFFSET: i16 = 16;

pub const ENOEXEC: i32 = 8;

/// Ring buffer payload size in bytes.
pub const RECORD_SIZE: i32 = 8;

/// Offset of the parent tgid within a record.
pub const PARENT_TGID_OFFSET: i32 = 0;

/// Offset of the current tgid within a record.
pub const CURRENT_TGID_OFFSET: i32 = 4;

pub const LICENSE: &str = "GPL";

pub const EXIT: Label = Label("exit");
pub const DISCARD: Label = Label("discard");

/// Build the exec-exit program against `ringbuf_fd` using the resolved
/// `task_struct` offsets.
///
/// Register use: r7 holds the syscall return, r9 the current task, r8 the
/// reserved slot. Stack slot `r10 - 8` receives the parent task pointer.
pub fn exec_exit_program(ringbuf_fd: RawFd, offsets: &TaskOffsets) -> ProgramBuilder {
	let tgid = offsets.tgid.offset;
	let real_parent = offsets.real_parent.offset;
	let mut b = ProgramBuilder::new();

	b.push(Insn::LoadMem {
		dst: Reg::R7,
		src: Reg::R1,
		off: SYS_EXIT_RET_OFFSET,
		size: Size::DW,
	})
	.push(Insn::JumpImm {
		cond: JmpCond::Ne,
		reg: Reg::R7,
		imm: -ENOEXEC,
		target: EXIT,
	});

	b.push(Insn::Call(Helper::GetCurrentTask))
		.push(Insn::MovReg { dst: Reg::R9, src: Reg::R0 });

	b.push(Insn::LoadMapFd {
		dst: Reg::R1,
		fd: ringbuf_fd,
	})
	.push(Insn::MovImm {
		dst: Reg::R2,
		imm: RECORD_SIZE,
	})
	.push(Insn::MovImm { dst: Reg::R3, imm: 0 })
	.push(Insn::Call(Helper::RingbufReserve))
	.push(Insn::JumpImm {
		cond: JmpCond::Eq,
		reg: Reg::R0,
		imm: 0,
		target: EXIT,
	})
	.push(Insn::MovReg { dst: Reg::R8, src: Reg::R0 });

	// slot[4..8] = current->tgid
	b.push(Insn::MovReg { dst: Reg::R1, src: Reg::R8 })
		.push(Insn::AddImm {
			dst: Reg::R1,
			imm: CURRENT_TGID_OFFSET,
		})
		.push(Insn::MovImm { dst: Reg::R2, imm: 4 })
		.push(Insn::MovReg { dst: Reg::R3, src: Reg::R9 })
		.push(Insn::AddImm { dst: Reg::R3, imm: tgid })
		.push(Insn::Call(Helper::ProbeReadKernel))
		.push(discard_unless_zero(Reg::R0));

	// *(r10 - 8) = current->real_parent
	b.push(Insn::MovReg { dst: Reg::R1, src: Reg::R10 })
		.push(Insn::AddImm { dst: Reg::R1, imm: -8 })
		.push(Insn::MovImm { dst: Reg::R2, imm: 8 })
		.push(Insn::MovReg { dst: Reg::R3, src: Reg::R9 })
		.push(Insn::AddImm {
			dst: Reg::R3,
			imm: real_parent,
		})
		.push(Insn::Call(Helper::ProbeReadKernel))
		.push(discard_unless_zero(Reg::R0))
		.push(Insn::LoadMem {
			dst: Reg::R3,
			src: Reg::R10,
			off: -8,
			size: Size::DW,
		})
		.push(Insn::JumpImm {
			cond: JmpCond::Eq,
			reg: Reg::R3,
			imm: 0,
			target: DISCARD,
		});

	// slot[0..4] = parent->tgid
	b.push(Insn::AddImm { dst: Reg::R3, imm: tgid })
		.push(Insn::MovReg { dst: Reg::R1, src: Reg::R8 })
		.push(Insn::AddImm {
			dst: Reg::R1,
			imm: PARENT_TGID_OFFSET,
		})
		.push(Insn::MovImm { dst: Reg::R2, imm: 4 })
		.push(Insn::Call(Helper::ProbeReadKernel))
		.push(discard_unless_zero(Reg::R0));

	b.push(Insn::MovReg { dst: Reg::R1, src: Reg::R8 })
		.push(Insn::MovImm { dst: Reg::R2, imm: 0 })
		.push(Insn::Call(Helper::RingbufSubmit))
		.push(Insn::Jump(EXIT));

	b.label(DISCARD)
		.push(Insn::MovReg { dst: Reg::R1, src: Reg::R8 })
		.push(Insn::MovImm { dst: Reg::R2, imm: 0 })
		.push(Insn::Call(Helper::RingbufDiscard));

	b.label(EXIT)
		.push(Insn::MovImm { dst: Reg::R0, imm: 0 })
		.push(Insn::Exit);

	b
}

fn discard_unless_zero(reg: Reg) -> Insn {
	Insn::JumpImm {
		cond: JmpCond::Ne,
		reg,
		imm: 0,
		target: DISCARD,
	}
}
