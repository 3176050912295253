// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end runs of the orchestrator with a synthetic record source, a
//! synthetic procfs, an in-memory runtime and an in-memory cluster store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use anyhow::Result;
use enoexec_bpf::RecordHandler;
use enoexec_daemon::identity::{CgroupResolver, IdentityResolver};
use enoexec_daemon::publisher::{Publisher, PublisherConfig};
use enoexec_daemon::rate_limit::RateLimiter;
use enoexec_daemon::testing::{crio_cgroup, write_cgroup, MockSandboxLister, CONTAINER_HEX, POD_UID};
use enoexec_daemon::{EventSource, Orchestrator};
use enoexec_k8s::{ENoExecEvent, MockEventStore};
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "openshift-multiarch-tuning-operator";

/// Delivers records pushed through a std channel, as the ring buffer would.
struct ChannelSource {
	records: std_mpsc::Receiver<Vec<u8>>,
	stopped: Arc<AtomicBool>,
	closed: Arc<AtomicBool>,
	fail: bool,
}

impl EventSource for ChannelSource {
	fn stopper(&self) -> Box<dyn Fn() + Send + Sync> {
		let stopped = self.stopped.clone();
		Box::new(move || stopped.store(true, Ordering::SeqCst))
	}

	fn run(&mut self, handler: &mut dyn RecordHandler) -> Result<()> {
		if self.fail {
			anyhow::bail!("ring buffer read failed");
		}
		while !self.stopped.load(Ordering::SeqCst) {
			match self.records.recv_timeout(Duration::from_millis(10)) {
				Ok(record) => {
					if handler.handle(&record).is_break() {
						break;
					}
				}
				Err(std_mpsc::RecvTimeoutError::Timeout) => {}
				Err(std_mpsc::RecvTimeoutError::Disconnected) => std::thread::sleep(Duration::from_millis(10)),
			}
		}
		Ok(())
	}

	fn close(&mut self) -> Result<()> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}
}

fn raw(parent: u32, current: u32) -> Vec<u8> {
	let mut bytes = parent.to_ne_bytes().to_vec();
	bytes.extend_from_slice(&current.to_ne_bytes());
	bytes
}

struct Harness {
	_proc: tempfile::TempDir,
	store: Arc<MockEventStore>,
	records: std_mpsc::Sender<Vec<u8>>,
	closed: Arc<AtomicBool>,
	orchestrator: Orchestrator<ChannelSource>,
}

fn harness(fail: bool) -> Harness {
	let proc = tempfile::tempdir().unwrap();
	write_cgroup(proc.path(), 4242, &crio_cgroup()).unwrap();
	write_cgroup(proc.path(), 5151, "0::/system.slice/crio.service\n").unwrap();

	let lister = Arc::new(MockSandboxLister::new());
	lister.add_sandbox(POD_UID, "web-7d4f", "shop");
	let resolver = IdentityResolver::new(CgroupResolver::new(proc.path()), lister);

	let store = Arc::new(MockEventStore::new());
	let publisher = Publisher::new(
		store.clone(),
		RateLimiter::with_rate(10.0, 20),
		PublisherConfig {
			node_name: "worker-0".into(),
			namespace: NAMESPACE.into(),
			timeout: Duration::from_secs(5),
		},
	);

	let (tx, rx) = std_mpsc::channel();
	let closed = Arc::new(AtomicBool::new(false));
	let source = ChannelSource {
		records: rx,
		stopped: Arc::new(AtomicBool::new(false)),
		closed: closed.clone(),
		fail,
	};

	Harness {
		_proc: proc,
		store,
		records: tx,
		closed,
		orchestrator: Orchestrator::new(source, resolver, publisher, 256),
	}
}

async fn wait_for_records(store: &MockEventStore, count: usize) -> Vec<ENoExecEvent> {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let records: Vec<_> = store.records().into_iter().filter(|r| r.status.is_some()).collect();
		if records.len() >= count || tokio::time::Instant::now() > deadline {
			return records;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_record_publishes_exactly_one_event() {
	let h = harness(false);
	let cancel = CancellationToken::new();
	let run = tokio::spawn(h.orchestrator.run(cancel.clone()));

	for _ in 0..3 {
		h.records.send(raw(1, 4242)).unwrap();
	}

	let records = wait_for_records(&h.store, 1).await;
	assert_eq!(records.len(), 1);
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(h.store.records().len(), 1);
	assert_eq!(h.store.create_calls(), 1);

	let record = &records[0];
	assert_eq!(record.metadata.namespace.as_deref(), Some(NAMESPACE));
	let status = record.status.as_ref().unwrap();
	assert_eq!(status.node_name, "worker-0");
	assert_eq!(status.pod_name, "web-7d4f");
	assert_eq!(status.pod_namespace, "shop");
	assert_eq!(status.container_id, format!("cri-o://{CONTAINER_HEX}"));

	cancel.cancel();
	run.await.unwrap().unwrap();
	assert!(h.closed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_is_attributed_to_parent_when_child_is_not_in_a_pod() {
	let h = harness(false);
	let cancel = CancellationToken::new();
	let run = tokio::spawn(h.orchestrator.run(cancel.clone()));

	h.records.send(raw(4242, 5151)).unwrap();

	let records = wait_for_records(&h.store, 1).await;
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].status.as_ref().unwrap().pod_name, "web-7d4f");

	cancel.cancel();
	run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unattributable_and_malformed_records_are_dropped() {
	let h = harness(false);
	let cancel = CancellationToken::new();
	let run = tokio::spawn(h.orchestrator.run(cancel.clone()));

	h.records.send(vec![1, 2, 3]).unwrap();
	h.records.send(raw(5151, 9999)).unwrap();
	h.records.send(raw(1, 4242)).unwrap();

	let records = wait_for_records(&h.store, 1).await;
	assert_eq!(records.len(), 1);
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(h.store.create_calls(), 1);

	cancel.cancel();
	run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_idle_pipeline_and_closes_source() {
	let h = harness(false);
	let cancel = CancellationToken::new();
	let run = tokio::spawn(h.orchestrator.run(cancel.clone()));

	tokio::time::sleep(Duration::from_millis(50)).await;
	cancel.cancel();
	tokio::time::timeout(Duration::from_secs(5), run)
		.await
		.expect("orchestrator did not stop")
		.unwrap()
		.unwrap();
	assert!(h.closed.load(Ordering::SeqCst));
	assert!(h.store.records().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reader_failure_stops_everything() {
	let h = harness(true);
	let cancel = CancellationToken::new();

	let result = tokio::time::timeout(Duration::from_secs(5), h.orchestrator.run(cancel.clone()))
		.await
		.expect("orchestrator did not stop");
	assert!(result.is_err());
	assert!(cancel.is_cancelled());
	assert!(h.closed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_status_update_leaves_no_record() {
	let h = harness(false);
	h.store.fail_update_status(true);
	let cancel = CancellationToken::new();
	let run = tokio::spawn(h.orchestrator.run(cancel.clone()));

	h.records.send(raw(1, 4242)).unwrap();

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while h.store.create_calls() == 0 && tokio::time::Instant::now() < deadline {
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(h.store.create_calls(), 1);
	assert!(h.store.records().is_empty());

	cancel.cancel();
	run.await.unwrap().unwrap();
}
