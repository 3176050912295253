// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wires the tracer, the bounded publish queue and the publisher together.
//!
//! Two tasks run until cancellation: a blocking reader feeding records
//! through the [`RecordPipeline`], and the [`Publisher`]. On cancellation a
//! watcher closes the ring buffer reader so the blocking read returns; the
//! queue is closed only after both tasks have been joined.

use std::sync::Arc;

use anyhow::{Context, Result};
use enoexec_bpf::{RecordHandler, Tracer};
use enoexec_k8s::KubeEventStore;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cri::CriClient;
use crate::decoder::RecordDecoder;
use crate::identity::{CgroupResolver, IdentityResolver};
use crate::pipeline::{BlockingHandler, RecordPipeline};
use crate::publisher::{Publisher, PublisherConfig};
use crate::rate_limit::RateLimiter;

/// A blocking source of raw records.
pub trait EventSource: Send + 'static {
	/// A callback that makes a blocked [`EventSource::run`] return, callable
	/// from any thread.
	fn stopper(&self) -> Box<dyn Fn() + Send + Sync>;

	/// Feed records to `handler` until stopped.
	fn run(&mut self, handler: &mut dyn RecordHandler) -> Result<()>;

	/// Release all resources. Called once after `run` returns.
	fn close(&mut self) -> Result<()>;
}

impl EventSource for Tracer {
	fn stopper(&self) -> Box<dyn Fn() + Send + Sync> {
		let closer = self.closer();
		Box::new(move || {
			if let Some(closer) = &closer {
				closer.close();
			}
		})
	}

	fn run(&mut self, handler: &mut dyn RecordHandler) -> Result<()> {
		Ok(Tracer::run(self, handler)?)
	}

	fn close(&mut self) -> Result<()> {
		Ok(Tracer::close(self)?)
	}
}

pub struct Orchestrator<S> {
	source: S,
	resolver: IdentityResolver,
	publisher: Publisher,
	queue_capacity: usize,
}

impl<S: EventSource> Orchestrator<S> {
	pub fn new(source: S, resolver: IdentityResolver, publisher: Publisher, queue_capacity: usize) -> Self {
		Self {
			source,
			resolver,
			publisher,
			queue_capacity,
		}
	}

	/// Run until `cancel` fires or the source fails. The source is always
	/// closed before this returns.
	pub async fn run(self, cancel: CancellationToken) -> Result<()> {
		let (tx, rx) = mpsc::channel(self.queue_capacity);
		let pipeline = RecordPipeline::new(RecordDecoder::new(), self.resolver, tx, cancel.clone());

		let stop = self.source.stopper();
		let watcher = {
			let cancel = cancel.clone();
			tokio::spawn(async move {
				cancel.cancelled().await;
				info!("Cancellation requested, closing ring buffer reader");
				stop();
			})
		};

		let mut source = self.source;
		let runtime = Handle::current();
		let reader_cancel = cancel.clone();
		let reader = tokio::task::spawn_blocking(move || {
			let mut handler = BlockingHandler::new(pipeline, runtime);
			let result = source.run(&mut handler);
			drop(handler);
			if let Err(e) = &result {
				error!(error = %e, "Record reader failed, shutting down");
				reader_cancel.cancel();
			}
			(result, source.close())
		});
		let publisher = tokio::spawn(self.publisher.run(rx, cancel.clone()));

		let (reader, publisher) = tokio::join!(reader, publisher);
		watcher.abort();

		let mut rx = publisher.context("publisher task panicked")?;
		rx.close();
		let (result, closed) = reader.context("reader task panicked")?;
		if let Err(e) = closed {
			error!(error = %e, "Failed to release tracer resources");
		}
		info!(dropped = rx.len(), "Pipeline stopped");
		result
	}
}

/// Build every component from `config` and run until `cancel` fires.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
	if let Err(e) = enoexec_bpf::raise_memlock_limit() {
		warn!(error = %e, "Failed to raise RLIMIT_MEMLOCK");
	}

	let store = KubeEventStore::new()
		.await
		.context("failed to initialize cluster client")?;

	let mut tracer = Tracer::from_btf(&config.btf_path, config.ringbuf_events)
		.context("failed to resolve task_struct offsets")?;
	tracer.attach().context("failed to attach exec-exit tracer")?;

	let runtime = CriClient::connect_lazy(&config.runtime_endpoint, config.runtime_timeout);
	let resolver = IdentityResolver::new(CgroupResolver::new(&config.proc_root), Arc::new(runtime));

	let limiter = RateLimiter::with_rate(config.rate_limit_per_sec as f64, config.rate_limit_burst);
	let publisher = Publisher::new(
		Arc::new(store),
		limiter,
		PublisherConfig {
			node_name: config.node_name.clone(),
			namespace: config.namespace.clone(),
			timeout: config.publish_timeout,
		},
	);

	Orchestrator::new(tracer, resolver, publisher, config.queue_capacity)
		.run(cancel)
		.await
}
