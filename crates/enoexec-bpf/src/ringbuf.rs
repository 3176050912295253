// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! User-space consumer for a `BPF_MAP_TYPE_RINGBUF` map.
//!
//! The map is mmapped as a writable consumer page followed by a read-only
//! producer page and a data area mapped twice back to back, so records that
//! wrap the end of the ring can be read contiguously. Blocking reads wait on
//! epoll; a [`RingBufCloser`] wakes a blocked reader and makes it return
//! [`RingBufError::Closed`].

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::sys::{KernelFd, SysError};

pub type Result<T> = std::result::Result<T, RingBufError>;

#[derive(Debug, Error)]
pub enum RingBufError {
	#[error("ring buffer closed")]
	Closed,

	#[error("{op} failed: {source}")]
	Io {
		op: &'static str,
		#[source]
		source: io::Error,
	},

	#[error("ring buffer for {events} events exceeds the maximum map size")]
	TooLarge { events: u32 },
}

impl RingBufError {
	fn last(op: &'static str) -> Self {
		RingBufError::Io {
			op,
			source: io::Error::last_os_error(),
		}
	}
}

/// Per-record header the kernel prepends to every payload.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Bytes of ring capacity budgeted per pending 8-byte event.
pub const BYTES_PER_EVENT: u64 = 16;

const BUSY_BIT: u32 = 1 << 31;
const DISCARD_BIT: u32 = 1 << 30;

const TOKEN_RING: u64 = 0;
const TOKEN_WAKEUP: u64 = 1;

/// Data area size able to hold `events` pending records: `events * 16`
/// rounded up to a page multiple, then to a power of two as the kernel
/// requires for ring buffer maps.
pub fn ring_buffer_size(events: u32, page_size: usize) -> Result<u32> {
	let too_large = || RingBufError::TooLarge { events };
	let page = page_size as u64;
	let wanted = (events as u64 * BYTES_PER_EVENT).max(1);
	let pages = wanted.div_ceil(page) * page;
	let size = pages.checked_next_power_of_two().ok_or_else(too_large)?;
	u32::try_from(size).map_err(|_| too_large())
}

fn round_up_8(n: usize) -> usize {
	(n + 7) & !7
}

/// Shared view of the ring positions and data area.
struct Ring {
	consumer: *const AtomicU64,
	producer: *const AtomicU64,
	data: *const u8,
	mask: u64,
}

impl Ring {
	/// Pop the next committed record, skipping discarded ones. Returns `None`
	/// when the ring is empty or the next record is still being written.
	///
	/// # Safety
	///
	/// `consumer` and `producer` must point to live, 8-aligned positions and
	/// `data` to a live data area of `mask + 1` bytes followed by a second
	/// copy of itself.
	unsafe fn next_record(&self) -> Option<Vec<u8>> {
		let consumer = &*self.consumer;
		let producer = &*self.producer;
		let mut cons = consumer.load(Ordering::Acquire);
		let prod = producer.load(Ordering::Acquire);

		while cons < prod {
			let offset = (cons & self.mask) as usize;
			let header = &*(self.data.add(offset) as *const AtomicU32);
			let len = header.load(Ordering::Acquire);
			if len & BUSY_BIT != 0 {
				break;
			}

			let payload_len = (len & !(BUSY_BIT | DISCARD_BIT)) as usize;
			cons += round_up_8(payload_len + RECORD_HEADER_SIZE) as u64;

			if len & DISCARD_BIT == 0 {
				let payload =
					std::slice::from_raw_parts(self.data.add(offset + RECORD_HEADER_SIZE), payload_len).to_vec();
				consumer.store(cons, Ordering::Release);
				return Some(payload);
			}
			consumer.store(cons, Ordering::Release);
		}
		None
	}
}

struct Mapping {
	ptr: NonNull<libc::c_void>,
	len: usize,
}

impl Mapping {
	fn new(fd: &KernelFd, len: usize, prot: libc::c_int, offset: usize) -> Result<Self> {
		// SAFETY: mapping a BPF map fd; the kernel validates length and offset.
		let ptr = unsafe {
			libc::mmap(
				std::ptr::null_mut(),
				len,
				prot,
				libc::MAP_SHARED,
				fd.as_raw_fd(),
				offset as libc::off_t,
			)
		};
		if ptr == libc::MAP_FAILED {
			return Err(RingBufError::last("mmap"));
		}
		let ptr = NonNull::new(ptr).ok_or_else(|| RingBufError::last("mmap"))?;
		Ok(Self { ptr, len })
	}

	fn unmap(self) -> std::result::Result<(), SysError> {
		let this = std::mem::ManuallyDrop::new(self);
		// SAFETY: the region is owned by this value and no longer referenced.
		if unsafe { libc::munmap(this.ptr.as_ptr(), this.len) } != 0 {
			return Err(SysError::Close {
				what: "ring buffer mapping",
				source: io::Error::last_os_error(),
			});
		}
		Ok(())
	}
}

impl Drop for Mapping {
	fn drop(&mut self) {
		// SAFETY: see `unmap`.
		unsafe { libc::munmap(self.ptr.as_ptr(), self.len) };
	}
}

struct Wakeup {
	eventfd: OwnedFd,
	closed: AtomicBool,
}

/// Cloneable handle that unblocks and closes a [`RingBufReader`].
#[derive(Clone)]
pub struct RingBufCloser(Arc<Wakeup>);

impl RingBufCloser {
	pub fn close(&self) {
		if self.0.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		let one: u64 = 1;
		// SAFETY: writes 8 bytes from a live u64 to an owned eventfd.
		let n = unsafe {
			libc::write(
				self.0.eventfd.as_raw_fd(),
				&one as *const u64 as *const libc::c_void,
				std::mem::size_of::<u64>(),
			)
		};
		if n < 0 {
			debug!(error = %io::Error::last_os_error(), "Ring buffer wakeup write failed");
		}
		info!("Ring buffer reader closed");
	}

	pub fn is_closed(&self) -> bool {
		self.0.closed.load(Ordering::Acquire)
	}
}

pub struct RingBufReader {
	ring: Ring,
	consumer_page: Mapping,
	producer_area: Mapping,
	epoll: OwnedFd,
	wakeup: Arc<Wakeup>,
}

// SAFETY: the raw pointers reference the reader's own mappings, which move
// with it; the ring is only consumed through `&mut self`.
unsafe impl Send for RingBufReader {}

impl RingBufReader {
	/// Map the ring buffer behind `map`, whose data area is `size` bytes.
	pub fn open(map: &KernelFd, size: u32, page_size: usize) -> Result<Self> {
		let size = size as usize;
		let consumer_page = Mapping::new(map, page_size, libc::PROT_READ | libc::PROT_WRITE, 0)?;
		let producer_area = Mapping::new(map, page_size + 2 * size, libc::PROT_READ, page_size)?;

		// SAFETY: plain fd-returning syscalls.
		let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
		if epoll < 0 {
			return Err(RingBufError::last("epoll_create1"));
		}
		// SAFETY: `epoll` is a fresh fd owned by nothing else.
		let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

		// SAFETY: as above.
		let eventfd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
		if eventfd < 0 {
			return Err(RingBufError::last("eventfd"));
		}
		// SAFETY: as above.
		let eventfd = unsafe { OwnedFd::from_raw_fd(eventfd) };

		register(&epoll, map.as_raw_fd(), TOKEN_RING)?;
		register(&epoll, eventfd.as_raw_fd(), TOKEN_WAKEUP)?;

		let producer = producer_area.ptr.as_ptr() as *const u8;
		let ring = Ring {
			consumer: consumer_page.ptr.as_ptr() as *const AtomicU64,
			producer: producer as *const AtomicU64,
			// SAFETY: the producer area is page_size + 2 * size bytes long.
			data: unsafe { producer.add(page_size) },
			mask: size as u64 - 1,
		};

		debug!(size, page_size, "Mapped ring buffer");
		Ok(Self {
			ring,
			consumer_page,
			producer_area,
			epoll,
			wakeup: Arc::new(Wakeup {
				eventfd,
				closed: AtomicBool::new(false),
			}),
		})
	}

	pub fn closer(&self) -> RingBufCloser {
		RingBufCloser(Arc::clone(&self.wakeup))
	}

	/// Block until a record is available or the reader is closed.
	pub fn read(&mut self) -> Result<Vec<u8>> {
		let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
		loop {
			if self.wakeup.closed.load(Ordering::Acquire) {
				return Err(RingBufError::Closed);
			}
			// SAFETY: the mappings backing `ring` live as long as `self`.
			if let Some(record) = unsafe { self.ring.next_record() } {
				return Ok(record);
			}

			// SAFETY: `events` is a valid buffer of the given length.
			let n = unsafe {
				libc::epoll_wait(
					self.epoll.as_raw_fd(),
					events.as_mut_ptr(),
					events.len() as libc::c_int,
					-1,
				)
			};
			if n < 0 {
				let err = io::Error::last_os_error();
				if err.kind() == io::ErrorKind::Interrupted {
					continue;
				}
				return Err(RingBufError::Io {
					op: "epoll_wait",
					source: err,
				});
			}
		}
	}

	/// Unmap the ring. The wakeup fds are released on drop.
	pub fn close(self) -> std::result::Result<(), Vec<SysError>> {
		self.wakeup.closed.store(true, Ordering::Release);
		let mut errors = Vec::new();
		if let Err(e) = self.producer_area.unmap() {
			errors.push(e);
		}
		if let Err(e) = self.consumer_page.unmap() {
			errors.push(e);
		}
		if errors.is_empty() {
			Ok(())
		} else {
			Err(errors)
		}
	}
}

fn register(epoll: &OwnedFd, fd: libc::c_int, token: u64) -> Result<()> {
	let mut event = libc::epoll_event {
		events: libc::EPOLLIN as u32,
		u64: token,
	};
	// SAFETY: both fds are open and `event` is valid for the call.
	if unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) } != 0 {
		return Err(RingBufError::last("epoll_ctl"));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	const CAPACITY: usize = 256;

	/// A ring over heap memory laid out like the kernel's.
	struct FakeRing {
		consumer: Box<AtomicU64>,
		producer: Box<AtomicU64>,
		data: Vec<u64>,
	}

	impl FakeRing {
		fn new() -> Self {
			Self {
				consumer: Box::new(AtomicU64::new(0)),
				producer: Box::new(AtomicU64::new(0)),
				data: vec![0; 2 * CAPACITY / 8],
			}
		}

		fn push(&mut self, payload: &[u8], flags: u32) {
			let pos = self.producer.load(Ordering::Relaxed) as usize;
			let bytes = self.data.as_mut_ptr() as *mut u8;
			let header = payload.len() as u32 | flags;
			unsafe {
				std::ptr::copy_nonoverlapping(header.to_ne_bytes().as_ptr(), bytes.add(pos), 4);
				std::ptr::copy_nonoverlapping(payload.as_ptr(), bytes.add(pos + RECORD_HEADER_SIZE), payload.len());
			}
			let next = pos + round_up_8(payload.len() + RECORD_HEADER_SIZE);
			self.producer.store(next as u64, Ordering::Release);
		}

		fn ring(&self) -> Ring {
			Ring {
				consumer: &*self.consumer,
				producer: &*self.producer,
				data: self.data.as_ptr() as *const u8,
				mask: CAPACITY as u64 - 1,
			}
		}

		fn next(&self) -> Option<Vec<u8>> {
			unsafe { self.ring().next_record() }
		}
	}

	#[test]
	fn test_reads_records_in_order() {
		let mut ring = FakeRing::new();
		ring.push(&[1, 0, 0, 0, 2, 0, 0, 0], 0);
		ring.push(&[3, 0, 0, 0, 4, 0, 0, 0], 0);

		assert_eq!(ring.next().unwrap(), vec![1, 0, 0, 0, 2, 0, 0, 0]);
		assert_eq!(ring.next().unwrap(), vec![3, 0, 0, 0, 4, 0, 0, 0]);
		assert_eq!(ring.next(), None);
		assert_eq!(ring.consumer.load(Ordering::Relaxed), 32);
	}

	#[test]
	fn test_skips_discarded_records() {
		let mut ring = FakeRing::new();
		ring.push(&[9; 8], DISCARD_BIT);
		ring.push(&[7; 8], 0);

		assert_eq!(ring.next().unwrap(), vec![7; 8]);
		assert_eq!(ring.next(), None);
	}

	#[test]
	fn test_stops_at_busy_record() {
		let mut ring = FakeRing::new();
		ring.push(&[5; 8], BUSY_BIT);
		ring.push(&[6; 8], 0);

		assert_eq!(ring.next(), None);
		assert_eq!(ring.consumer.load(Ordering::Relaxed), 0);
	}

	#[test]
	fn test_odd_length_payload_is_padded() {
		let mut ring = FakeRing::new();
		ring.push(&[1, 2, 3], 0);
		ring.push(&[4; 8], 0);

		assert_eq!(ring.next().unwrap(), vec![1, 2, 3]);
		assert_eq!(ring.consumer.load(Ordering::Relaxed), 16);
		assert_eq!(ring.next().unwrap(), vec![4; 8]);
	}

	#[test]
	fn test_ring_buffer_size() {
		assert_eq!(ring_buffer_size(256, 4096).unwrap(), 4096);
		assert_eq!(ring_buffer_size(257, 4096).unwrap(), 8192);
		assert_eq!(ring_buffer_size(1000, 4096).unwrap(), 16384);
		assert_eq!(ring_buffer_size(0, 4096).unwrap(), 4096);
		assert_eq!(ring_buffer_size(256, 65536).unwrap(), 65536);
		assert!(matches!(
			ring_buffer_size(u32::MAX, 4096),
			Err(RingBufError::TooLarge { .. })
		));
	}

	proptest::proptest! {
		#[test]
		fn ring_buffer_size_holds_events(events in 1u32..10_000_000, shift in 12u32..17) {
			let page = 1usize << shift;
			let size = ring_buffer_size(events, page).unwrap() as u64;
			proptest::prop_assert!(size >= events as u64 * BYTES_PER_EVENT);
			proptest::prop_assert_eq!(size % page as u64, 0);
			proptest::prop_assert!(size.is_power_of_two());
		}
	}
}
