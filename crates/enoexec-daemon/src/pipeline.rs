// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-record processing between the ring buffer and the publish queue:
//! decode, suppress re-deliveries, attribute to a pod, enqueue.

use std::collections::{HashSet, VecDeque};
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use enoexec_bpf::RecordHandler;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::decoder::{ExecRecord, RecordDecoder};
use crate::event::EnoexecEvent;
use crate::identity::IdentityResolver;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Bounded, time-windowed set of recently seen records.
#[derive(Debug)]
pub struct RecentRecords {
	window: Duration,
	capacity: usize,
	seen: HashSet<ExecRecord>,
	order: VecDeque<(ExecRecord, Instant)>,
}

impl Default for RecentRecords {
	fn default() -> Self {
		Self::new(DEFAULT_DEDUP_WINDOW, DEFAULT_DEDUP_CAPACITY)
	}
}

impl RecentRecords {
	pub fn new(window: Duration, capacity: usize) -> Self {
		Self {
			window,
			capacity: capacity.max(1),
			seen: HashSet::new(),
			order: VecDeque::new(),
		}
	}

	fn expire(&mut self, now: Instant) {
		while let Some((old, at)) = self.order.front().copied() {
			if now.saturating_duration_since(at) < self.window {
				break;
			}
			self.order.pop_front();
			self.seen.remove(&old);
		}
	}

	/// Whether `record` was remembered within the window ending at `now`.
	pub fn seen_recently(&mut self, record: ExecRecord, now: Instant) -> bool {
		self.expire(now);
		self.seen.contains(&record)
	}

	/// Remember `record` as handled at `now`. Returns false if it already was.
	pub fn remember(&mut self, record: ExecRecord, now: Instant) -> bool {
		if self.seen_recently(record, now) {
			return false;
		}
		if self.order.len() >= self.capacity {
			if let Some((old, _)) = self.order.pop_front() {
				self.seen.remove(&old);
			}
		}
		self.seen.insert(record);
		self.order.push_back((record, now));
		true
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.order.is_empty()
	}
}

/// Producer side of the publish queue.
pub struct RecordPipeline {
	decoder: RecordDecoder,
	resolver: IdentityResolver,
	recent: RecentRecords,
	tx: mpsc::Sender<EnoexecEvent>,
	cancel: CancellationToken,
}

impl RecordPipeline {
	pub fn new(
		decoder: RecordDecoder,
		resolver: IdentityResolver,
		tx: mpsc::Sender<EnoexecEvent>,
		cancel: CancellationToken,
	) -> Self {
		Self {
			decoder,
			resolver,
			recent: RecentRecords::default(),
			tx,
			cancel,
		}
	}

	pub fn with_recent(mut self, recent: RecentRecords) -> Self {
		self.recent = recent;
		self
	}

	/// Handle one raw record. Breaks only when the queue is gone or the
	/// pipeline is cancelled; per-record failures are logged and skipped.
	pub async fn process(&mut self, raw: &[u8]) -> ControlFlow<()> {
		let record = match self.decoder.decode(raw) {
			Ok(record) => record,
			Err(e) => {
				warn!(error = %e, "Dropping undecodable record");
				return ControlFlow::Continue(());
			}
		};

		if self.recent.seen_recently(record, Instant::now()) {
			debug!(
				parent_tgid = record.parent_tgid,
				current_tgid = record.current_tgid,
				"Suppressing repeated record"
			);
			return ControlFlow::Continue(());
		}

		// Only attributed records are remembered, so a re-delivery of one
		// that failed to resolve gets another attempt.
		match self.resolver.resolve_record(record).await {
			Ok(Some(event)) => {
				self.recent.remember(record, Instant::now());
				self.enqueue(event).await
			}
			Ok(None) => {
				warn!(
					parent_tgid = record.parent_tgid,
					current_tgid = record.current_tgid,
					"Could not attribute ENOEXEC to a pod, dropping record"
				);
				ControlFlow::Continue(())
			}
			Err(e) => {
				error!(
					parent_tgid = record.parent_tgid,
					current_tgid = record.current_tgid,
					error = %e,
					"Container runtime lookup failed, dropping record"
				);
				ControlFlow::Continue(())
			}
		}
	}

	async fn enqueue(&self, event: EnoexecEvent) -> ControlFlow<()> {
		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => ControlFlow::Break(()),
			sent = self.tx.send(event) => {
				if sent.is_err() {
					warn!("Publish queue closed, stopping record pipeline");
					return ControlFlow::Break(());
				}
				ControlFlow::Continue(())
			}
		}
	}
}

/// Drives a [`RecordPipeline`] from the tracer's blocking read loop.
pub struct BlockingHandler {
	pipeline: RecordPipeline,
	runtime: Handle,
}

impl BlockingHandler {
	pub fn new(pipeline: RecordPipeline, runtime: Handle) -> Self {
		Self { pipeline, runtime }
	}
}

impl RecordHandler for BlockingHandler {
	fn handle(&mut self, record: &[u8]) -> ControlFlow<()> {
		self.runtime.block_on(self.pipeline.process(record))
	}
}
