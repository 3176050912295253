// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tracer lifecycle: `Built -> Attached -> Running -> Closing -> Closed`,
//! with `Failed` reachable from any state.
//!
//! The tracer exclusively owns the ring buffer map, its reader, the loaded
//! program and the tracepoint link. Attach failures release whatever was
//! already created in reverse order; `close` releases every handle and
//! reports all failures together.

use std::fmt;
use std::ops::ControlFlow;
use std::os::fd::AsRawFd;
use std::path::Path;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::asm::AsmError;
use crate::btf::{self, OffsetsUnavailable, TaskOffsets};
use crate::program::{self, LICENSE};
use crate::ringbuf::{self, RingBufCloser, RingBufError, RingBufReader};
use crate::sys::{self, KernelFd, SysError};

pub type Result<T> = std::result::Result<T, TracerError>;

pub const RINGBUF_MAP_NAME: &str = "enoexec_events";
pub const PROGRAM_NAME: &str = "enoexec_exit";
pub const TRACEPOINT_CATEGORY: &str = "syscalls";
pub const TRACEPOINT_NAME: &str = "sys_exit_execve";

/// Default number of pending events the ring buffer holds.
pub const DEFAULT_RINGBUF_EVENTS: u32 = 256;

#[derive(Debug, Error)]
pub enum TracerError {
	#[error(transparent)]
	Offsets(#[from] OffsetsUnavailable),

	#[error("failed to assemble program: {0}")]
	Asm(#[from] AsmError),

	#[error(transparent)]
	Sys(#[from] SysError),

	#[error("ring buffer: {0}")]
	RingBuf(#[from] RingBufError),

	#[error("cannot {op} a tracer in state {state}")]
	InvalidState { op: &'static str, state: TracerState },

	#[error("failed to release tracer resources: {}", join(.0))]
	Close(Vec<SysError>),
}

fn join(errors: &[SysError]) -> String {
	errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
	Built,
	Attached,
	Running,
	Closing,
	Closed,
	Failed,
}

impl fmt::Display for TracerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			TracerState::Built => "built",
			TracerState::Attached => "attached",
			TracerState::Running => "running",
			TracerState::Closing => "closing",
			TracerState::Closed => "closed",
			TracerState::Failed => "failed",
		};
		f.write_str(s)
	}
}

/// Receives each raw record read from the ring buffer.
pub trait RecordHandler {
	/// Return `ControlFlow::Break` to stop the read loop.
	fn handle(&mut self, record: &[u8]) -> ControlFlow<()>;
}

impl<F> RecordHandler for F
where
	F: FnMut(&[u8]) -> ControlFlow<()>,
{
	fn handle(&mut self, record: &[u8]) -> ControlFlow<()> {
		self(record)
	}
}

pub struct Tracer {
	offsets: TaskOffsets,
	ringbuf_events: u32,
	state: TracerState,
	map: Option<KernelFd>,
	reader: Option<RingBufReader>,
	program: Option<KernelFd>,
	link: Option<KernelFd>,
}

impl Tracer {
	/// A tracer for already resolved offsets.
	pub fn new(offsets: TaskOffsets, ringbuf_events: u32) -> Self {
		Self {
			offsets,
			ringbuf_events,
			state: TracerState::Built,
			map: None,
			reader: None,
			program: None,
			link: None,
		}
	}

	/// Resolve `task_struct` offsets from the BTF blob at `btf_path`. Missing
	/// metadata is fatal.
	pub fn from_btf(btf_path: &Path, ringbuf_events: u32) -> Result<Self> {
		let offsets = btf::resolve(btf_path)?;
		info!(
			tgid = offsets.tgid.offset,
			real_parent = offsets.real_parent.offset,
			"Resolved task_struct offsets"
		);
		Ok(Self::new(offsets, ringbuf_events))
	}

	pub fn state(&self) -> TracerState {
		self.state
	}

	pub fn offsets(&self) -> &TaskOffsets {
		&self.offsets
	}

	/// Create the ring buffer, load the program and attach it to the
	/// exec-exit tracepoint.
	pub fn attach(&mut self) -> Result<()> {
		if self.state != TracerState::Built {
			return Err(TracerError::InvalidState {
				op: "attach",
				state: self.state,
			});
		}
		match self.try_attach() {
			Ok(()) => {
				self.state = TracerState::Attached;
				info!(tracepoint = TRACEPOINT_NAME, "Tracer attached");
				Ok(())
			}
			Err(e) => {
				error!(error = %e, "Tracer attach failed, rolling back");
				if let Err(errors) = self.release() {
					for e in errors {
						warn!(error = %e, "Rollback release failed");
					}
				}
				self.state = TracerState::Failed;
				Err(e)
			}
		}
	}

	fn try_attach(&mut self) -> Result<()> {
		let page_size = sys::page_size();
		let size = ringbuf::ring_buffer_size(self.ringbuf_events, page_size)?;

		let map = self.map.insert(sys::create_ringbuf(RINGBUF_MAP_NAME, size)?);
		let map_fd = map.as_raw_fd();
		self.reader = Some(RingBufReader::open(map, size, page_size)?);

		let insns = program::exec_exit_program(map_fd, &self.offsets).assemble()?;
		let program = self
			.program
			.insert(sys::load_tracepoint_program(PROGRAM_NAME, &insns, LICENSE)?);

		let id = sys::tracepoint_id(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)?;
		self.link = Some(sys::attach_tracepoint(program, id)?);
		Ok(())
	}

	/// A handle that unblocks [`Tracer::run`] from another thread.
	pub fn closer(&self) -> Option<RingBufCloser> {
		self.reader.as_ref().map(RingBufReader::closer)
	}

	/// Feed records to `handler` until the reader is closed or the handler
	/// breaks. Blocks the calling thread.
	pub fn run<H: RecordHandler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
		let reader = match (self.state, self.reader.as_mut()) {
			(TracerState::Attached, Some(reader)) => reader,
			_ => {
				return Err(TracerError::InvalidState {
					op: "run",
					state: self.state,
				})
			}
		};
		self.state = TracerState::Running;
		info!("Tracer running");

		loop {
			match reader.read() {
				Ok(record) => {
					if handler.handle(&record).is_break() {
						info!("Record handler stopped the tracer");
						return Ok(());
					}
				}
				Err(RingBufError::Closed) => {
					info!("Ring buffer closed, tracer stopping");
					return Ok(());
				}
				Err(e) => return Err(e.into()),
			}
		}
	}

	/// Release link, program, reader and map. Idempotent; every handle is
	/// visited even if an earlier one fails.
	pub fn close(&mut self) -> Result<()> {
		if self.state == TracerState::Closed {
			return Ok(());
		}
		let failed = self.state == TracerState::Failed;
		if !failed {
			self.state = TracerState::Closing;
		}
		let result = self.release();
		if !failed {
			self.state = TracerState::Closed;
		}
		info!(state = %self.state, "Tracer closed");
		result.map_err(TracerError::Close)
	}

	fn release(&mut self) -> std::result::Result<(), Vec<SysError>> {
		let mut errors = Vec::new();
		if let Some(link) = self.link.take() {
			errors.extend(link.close().err());
		}
		if let Some(program) = self.program.take() {
			errors.extend(program.close().err());
		}
		if let Some(reader) = self.reader.take() {
			if let Err(e) = reader.close() {
				errors.extend(e);
			}
		}
		if let Some(map) = self.map.take() {
			errors.extend(map.close().err());
		}
		if errors.is_empty() {
			Ok(())
		} else {
			Err(errors)
		}
	}
}

impl Drop for Tracer {
	fn drop(&mut self) {
		if let Err(errors) = self.release() {
			for e in errors {
				warn!(error = %e, "Failed to release tracer resource on drop");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::btf::KernelFieldOffset;

	fn tracer() -> Tracer {
		Tracer::new(
			TaskOffsets {
				tgid: KernelFieldOffset {
					field: "tgid",
					offset: 2452,
				},
				real_parent: KernelFieldOffset {
					field: "real_parent",
					offset: 2464,
				},
			},
			DEFAULT_RINGBUF_EVENTS,
		)
	}

	#[test]
	fn test_new_tracer_is_built() {
		let t = tracer();
		assert_eq!(t.state(), TracerState::Built);
		assert!(t.closer().is_none());
	}

	#[test]
	fn test_run_requires_attach() {
		let mut t = tracer();
		let mut handler = |_: &[u8]| ControlFlow::Continue(());
		assert!(matches!(
			t.run(&mut handler),
			Err(TracerError::InvalidState { op: "run", .. })
		));
	}

	#[test]
	fn test_close_is_idempotent() {
		let mut t = tracer();
		t.close().unwrap();
		assert_eq!(t.state(), TracerState::Closed);
		t.close().unwrap();
		assert_eq!(t.state(), TracerState::Closed);
	}

	#[test]
	fn test_attach_after_close_is_rejected() {
		let mut t = tracer();
		t.close().unwrap();
		assert!(matches!(
			t.attach(),
			Err(TracerError::InvalidState { op: "attach", .. })
		));
	}

	#[test]
	fn test_missing_btf_is_fatal() {
		let dir = tempfile::tempdir().unwrap();
		let result = Tracer::from_btf(&dir.path().join("vmlinux"), DEFAULT_RINGBUF_EVENTS);
		assert!(matches!(result, Err(TracerError::Offsets(_))));
	}

	/// A handle whose close always fails with EBADF.
	fn dead_fd(what: &'static str) -> KernelFd {
		KernelFd::new(-1, what)
	}

	#[test]
	fn test_close_reports_every_failed_handle() {
		let mut t = tracer();
		t.map = Some(dead_fd("ring buffer map"));
		t.program = Some(dead_fd("program"));
		t.link = Some(dead_fd("tracepoint link"));
		t.state = TracerState::Attached;

		let errors = match t.close() {
			Err(TracerError::Close(errors)) => errors,
			other => panic!("unexpected result: {other:?}"),
		};
		assert_eq!(errors.len(), 3);
		let what: Vec<_> = errors
			.iter()
			.map(|e| match e {
				SysError::Close { what, .. } => *what,
				other => panic!("unexpected error: {other}"),
			})
			.collect();
		assert_eq!(what, ["tracepoint link", "program", "ring buffer map"]);

		assert!(t.link.is_none() && t.program.is_none() && t.map.is_none() && t.reader.is_none());
		assert_eq!(t.state(), TracerState::Closed);
		t.close().unwrap();

		let msg = TracerError::Close(errors).to_string();
		assert!(msg.contains("program") && msg.contains("ring buffer map"));
	}

	#[test]
	fn test_failed_attach_releases_created_handles() {
		let mut t = Tracer::new(tracer().offsets, u32::MAX);
		t.map = Some(dead_fd("ring buffer map"));
		t.program = Some(dead_fd("program"));

		assert!(matches!(
			t.attach(),
			Err(TracerError::RingBuf(RingBufError::TooLarge { .. }))
		));
		assert_eq!(t.state(), TracerState::Failed);
		assert!(t.map.is_none() && t.program.is_none() && t.link.is_none());

		// a failed tracer can still be closed, and stays failed
		t.close().unwrap();
		assert_eq!(t.state(), TracerState::Failed);
	}
}
