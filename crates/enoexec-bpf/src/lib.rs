// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Kernel side of the ENOEXEC detector.
//!
//! This crate provides:
//! - `task_struct` field offset resolution from kernel BTF
//! - A label-addressed eBPF assembler and the exec-exit program built with it
//! - Raw `bpf(2)` / perf event plumbing and a ring buffer reader
//! - The [`Tracer`] that owns and jointly releases all kernel handles

pub mod asm;
pub mod btf;
pub mod program;
pub mod ringbuf;
pub mod sys;
pub mod tracer;

pub use btf::{KernelFieldOffset, OffsetsUnavailable, TaskOffsets};
pub use ringbuf::{RingBufCloser, RingBufError};
pub use sys::raise_memlock_limit;
pub use tracer::{RecordHandler, Tracer, TracerError, TracerState, DEFAULT_RINGBUF_EVENTS};
