// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Thin wrappers over `bpf(2)`, `perf_event_open(2)` and friends.
//!
//! Kernel handles are returned as [`KernelFd`], which closes on drop but can
//! also be closed explicitly so the caller observes the error.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::asm::RawInsn;

pub type Result<T> = std::result::Result<T, SysError>;

#[derive(Debug, Error)]
pub enum SysError {
	#[error("{op} failed: {source}")]
	Syscall {
		op: &'static str,
		#[source]
		source: io::Error,
	},

	#[error("program load rejected: {source}\n{log}")]
	ProgramLoad {
		#[source]
		source: io::Error,
		log: String,
	},

	#[error("tracepoint {category}/{name} not found under {tried:?}")]
	TracepointNotFound {
		category: &'static str,
		name: &'static str,
		tried: Vec<PathBuf>,
	},

	#[error("invalid tracepoint id in {path}: {value:?}")]
	InvalidTracepointId { path: PathBuf, value: String },

	#[error("failed to close {what}: {source}")]
	Close {
		what: &'static str,
		#[source]
		source: io::Error,
	},
}

impl SysError {
	fn last(op: &'static str) -> Self {
		SysError::Syscall {
			op,
			source: io::Error::last_os_error(),
		}
	}
}

/// Tracefs mount points, preferred first.
pub const TRACEFS_ROOTS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_PROG_LOAD: libc::c_long = 5;

const BPF_MAP_TYPE_RINGBUF: u32 = 27;
const BPF_PROG_TYPE_TRACEPOINT: u32 = 5;

const PERF_TYPE_TRACEPOINT: u32 = 2;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 8;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_SET_BPF: libc::c_ulong = 0x4004_2408;

const VERIFIER_LOG_SIZE: usize = 1 << 20;
const OBJ_NAME_LEN: usize = 16;

/// An owned kernel file descriptor.
#[derive(Debug)]
pub struct KernelFd {
	fd: RawFd,
	what: &'static str,
}

impl KernelFd {
	pub(crate) fn new(fd: RawFd, what: &'static str) -> Self {
		debug!(fd, what, "Acquired kernel handle");
		Self { fd, what }
	}

	pub fn what(&self) -> &'static str {
		self.what
	}

	/// Close the descriptor, reporting the kernel's verdict.
	pub fn close(self) -> Result<()> {
		let this = mem::ManuallyDrop::new(self);
		// SAFETY: `fd` is owned by this value and never used after this call.
		if unsafe { libc::close(this.fd) } != 0 {
			return Err(SysError::Close {
				what: this.what,
				source: io::Error::last_os_error(),
			});
		}
		debug!(fd = this.fd, what = this.what, "Released kernel handle");
		Ok(())
	}
}

impl AsRawFd for KernelFd {
	fn as_raw_fd(&self) -> RawFd {
		self.fd
	}
}

impl Drop for KernelFd {
	fn drop(&mut self) {
		// SAFETY: see `close`.
		unsafe { libc::close(self.fd) };
	}
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
	map_type: u32,
	key_size: u32,
	value_size: u32,
	max_entries: u32,
	map_flags: u32,
	inner_map_fd: u32,
	numa_node: u32,
	map_name: [u8; OBJ_NAME_LEN],
}

#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
	prog_type: u32,
	insn_cnt: u32,
	insns: u64,
	license: u64,
	log_level: u32,
	log_size: u32,
	log_buf: u64,
	kern_version: u32,
	prog_flags: u32,
	prog_name: [u8; OBJ_NAME_LEN],
}

/// `struct perf_event_attr`, first published revision (64 bytes).
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
	type_: u32,
	size: u32,
	config: u64,
	sample_period: u64,
	sample_type: u64,
	read_format: u64,
	flags: u64,
	wakeup_events: u32,
	bp_type: u32,
	config1: u64,
}

fn obj_name(name: &str) -> [u8; OBJ_NAME_LEN] {
	let mut out = [0u8; OBJ_NAME_LEN];
	for (dst, src) in out.iter_mut().zip(name.bytes().take(OBJ_NAME_LEN - 1)) {
		*dst = src;
	}
	out
}

fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<RawFd> {
	// SAFETY: `attr` is a repr(C) prefix of `union bpf_attr` and lives for the call.
	let ret = unsafe {
		libc::syscall(
			libc::SYS_bpf,
			cmd,
			attr as *mut T as *mut libc::c_void,
			mem::size_of::<T>() as libc::c_uint,
		)
	};
	if ret < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(ret as RawFd)
}

/// Create a `BPF_MAP_TYPE_RINGBUF` map with a data area of `size` bytes.
pub fn create_ringbuf(name: &str, size: u32) -> Result<KernelFd> {
	let mut attr = MapCreateAttr {
		map_type: BPF_MAP_TYPE_RINGBUF,
		max_entries: size,
		map_name: obj_name(name),
		..Default::default()
	};
	let fd = bpf(BPF_MAP_CREATE, &mut attr).map_err(|source| SysError::Syscall {
		op: "BPF_MAP_CREATE",
		source,
	})?;
	info!(name, size, "Created ring buffer map");
	Ok(KernelFd::new(fd, "ring buffer map"))
}

/// Load a tracepoint program. A rejected load is retried once with the
/// verifier log enabled so the rejection reason can be reported.
pub fn load_tracepoint_program(name: &str, insns: &[RawInsn], license: &str) -> Result<KernelFd> {
	let license = CString::new(license).map_err(|e| SysError::ProgramLoad {
		source: io::Error::new(io::ErrorKind::InvalidInput, e),
		log: String::new(),
	})?;
	let mut attr = ProgLoadAttr {
		prog_type: BPF_PROG_TYPE_TRACEPOINT,
		insn_cnt: insns.len() as u32,
		insns: insns.as_ptr() as u64,
		license: license.as_ptr() as u64,
		prog_name: obj_name(name),
		..Default::default()
	};

	let source = match bpf(BPF_PROG_LOAD, &mut attr) {
		Ok(fd) => {
			info!(name, insns = insns.len(), "Loaded program");
			return Ok(KernelFd::new(fd, "program"));
		}
		Err(e) => e,
	};

	warn!(name, error = %source, "Program load rejected, retrying with verifier log");
	let mut log = vec![0u8; VERIFIER_LOG_SIZE];
	attr.log_level = 1;
	attr.log_size = log.len() as u32;
	attr.log_buf = log.as_mut_ptr() as u64;
	match bpf(BPF_PROG_LOAD, &mut attr) {
		Ok(fd) => {
			info!(name, "Loaded program on verbose retry");
			Ok(KernelFd::new(fd, "program"))
		}
		Err(_) => {
			let end = log.iter().position(|b| *b == 0).unwrap_or(log.len());
			Err(SysError::ProgramLoad {
				source,
				log: String::from_utf8_lossy(&log[..end]).into_owned(),
			})
		}
	}
}

/// Look up the numeric id of a tracepoint in the first tracefs root that has it.
pub fn tracepoint_id(category: &'static str, name: &'static str) -> Result<u64> {
	tracepoint_id_in(TRACEFS_ROOTS.iter().map(Path::new), category, name)
}

pub(crate) fn tracepoint_id_in<'a>(
	roots: impl IntoIterator<Item = &'a Path>,
	category: &'static str,
	name: &'static str,
) -> Result<u64> {
	let mut tried = Vec::new();
	for root in roots {
		let path = root.join("events").join(category).join(name).join("id");
		match std::fs::read_to_string(&path) {
			Ok(value) => {
				return value
					.trim()
					.parse()
					.map_err(|_| SysError::InvalidTracepointId { path, value })
			}
			Err(e) => {
				debug!(path = %path.display(), error = %e, "Tracepoint id not readable");
				tried.push(path);
			}
		}
	}
	Err(SysError::TracepointNotFound {
		category,
		name,
		tried,
	})
}

/// Open a perf event for the tracepoint and attach the program to it.
/// The returned perf event fd is the link: closing it detaches the program.
pub fn attach_tracepoint(program: &KernelFd, tracepoint_id: u64) -> Result<KernelFd> {
	let attr = PerfEventAttr {
		type_: PERF_TYPE_TRACEPOINT,
		size: mem::size_of::<PerfEventAttr>() as u32,
		config: tracepoint_id,
		sample_period: 1,
		wakeup_events: 1,
		..Default::default()
	};
	// SAFETY: `attr` is a valid perf_event_attr for the duration of the call.
	let fd = unsafe {
		libc::syscall(
			libc::SYS_perf_event_open,
			&attr as *const PerfEventAttr,
			-1 as libc::pid_t,
			0 as libc::c_int,
			-1 as libc::c_int,
			PERF_FLAG_FD_CLOEXEC,
		)
	};
	if fd < 0 {
		return Err(SysError::last("perf_event_open"));
	}
	let link = KernelFd::new(fd as RawFd, "tracepoint link");

	// SAFETY: both fds are open for the duration of the calls.
	if unsafe { libc::ioctl(link.fd, PERF_EVENT_IOC_SET_BPF as _, program.fd) } != 0 {
		return Err(SysError::last("PERF_EVENT_IOC_SET_BPF"));
	}
	// SAFETY: as above.
	if unsafe { libc::ioctl(link.fd, PERF_EVENT_IOC_ENABLE as _, 0) } != 0 {
		return Err(SysError::last("PERF_EVENT_IOC_ENABLE"));
	}
	info!(tracepoint_id, "Attached program to tracepoint");
	Ok(link)
}

pub fn page_size() -> usize {
	// SAFETY: sysconf has no memory-safety preconditions.
	let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
	if size <= 0 {
		4096
	} else {
		size as usize
	}
}

/// Lift `RLIMIT_MEMLOCK`; kernels before 5.11 charge map memory against it.
pub fn raise_memlock_limit() -> Result<()> {
	let limit = libc::rlimit {
		rlim_cur: libc::RLIM_INFINITY,
		rlim_max: libc::RLIM_INFINITY,
	};
	// SAFETY: `limit` is a valid rlimit.
	if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) } != 0 {
		return Err(SysError::last("setrlimit(RLIMIT_MEMLOCK)"));
	}
	Ok(())
}
