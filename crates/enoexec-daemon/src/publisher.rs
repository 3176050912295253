// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turns resolved events into `ENoExecEvent` records.
//!
//! Each publish waits on the shared rate limiter, creates the record, reads
//! it back, then writes its status. If the read-back or status write fails
//! the record is deleted so no status-less record stays visible.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use enoexec_k8s::{ENoExecEvent, EventStore, K8sError, K8sResult};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::EnoexecEvent;
use crate::rate_limit::RateLimiter;

pub type Result<T> = std::result::Result<T, PublishError>;

#[derive(Debug, Error)]
pub enum PublishError {
	#[error("rate limited: no token within {0:?}")]
	RateLimited(Duration),

	#[error("failed to create record: {0}")]
	Create(#[source] K8sError),

	#[error("failed to verify record {name}: {source}")]
	Verify {
		name: String,
		#[source]
		source: K8sError,
	},

	#[error("failed to update status of record {name}: {source}")]
	StatusUpdate {
		name: String,
		#[source]
		source: K8sError,
	},

	#[error("publish cancelled")]
	Cancelled,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
	pub node_name: String,
	pub namespace: String,
	/// Bound on the limiter wait and on the whole write sequence.
	pub timeout: Duration,
}

pub struct Publisher {
	store: Arc<dyn EventStore>,
	limiter: RateLimiter,
	config: PublisherConfig,
}

enum Bounded<T> {
	Done(K8sResult<T>),
	Cancelled,
}

impl Publisher {
	pub fn new(store: Arc<dyn EventStore>, limiter: RateLimiter, config: PublisherConfig) -> Self {
		Self {
			store,
			limiter,
			config,
		}
	}

	/// Publish one event, returning the generated record name.
	pub async fn publish(&self, event: &EnoexecEvent, cancel: &CancellationToken) -> Result<String> {
		let deadline = Instant::now() + self.config.timeout;

		tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(PublishError::Cancelled),
			granted = tokio::time::timeout_at(deadline, self.limiter.acquire()) => {
				if granted.is_err() {
					return Err(PublishError::RateLimited(self.config.timeout));
				}
			}
		}

		let namespace = self.config.namespace.as_str();
		let name = uuid::Uuid::new_v4().to_string();
		let record = ENoExecEvent::named(&name);

		match bounded(deadline, cancel, self.store.create(namespace, &record)).await {
			Bounded::Done(Ok(_)) => debug!(%name, "Created record"),
			Bounded::Done(Err(K8sError::Timeout)) => {
				// The create may still land after the deadline.
				self.rollback(&name).await;
				return Err(PublishError::Create(K8sError::Timeout));
			}
			Bounded::Done(Err(e)) => return Err(PublishError::Create(e)),
			Bounded::Cancelled => {
				self.rollback(&name).await;
				return Err(PublishError::Cancelled);
			}
		}

		match bounded(deadline, cancel, self.store.get(namespace, &name)).await {
			Bounded::Done(Ok(_)) => {}
			Bounded::Done(Err(source)) => {
				self.rollback(&name).await;
				return Err(PublishError::Verify { name, source });
			}
			Bounded::Cancelled => {
				self.rollback(&name).await;
				return Err(PublishError::Cancelled);
			}
		}

		let status = event.status(&self.config.node_name);
		match bounded(deadline, cancel, self.store.update_status(namespace, &name, &status)).await {
			Bounded::Done(Ok(_)) => {}
			Bounded::Done(Err(source)) => {
				self.rollback(&name).await;
				return Err(PublishError::StatusUpdate { name, source });
			}
			Bounded::Cancelled => {
				self.rollback(&name).await;
				return Err(PublishError::Cancelled);
			}
		}

		info!(
			%name,
			pod = %event.pod_name,
			pod_namespace = %event.pod_namespace,
			container_id = %event.container_id,
			"Published ENoExecEvent"
		);
		Ok(name)
	}

	/// Best-effort delete of a record left without status. Runs with its own
	/// timeout and ignores cancellation.
	async fn rollback(&self, name: &str) {
		let namespace = self.config.namespace.as_str();
		match tokio::time::timeout(self.config.timeout, self.store.delete(namespace, name)).await {
			Ok(Ok(())) => warn!(%name, "Rolled back incomplete record"),
			Ok(Err(e)) if e.is_not_found() => debug!(%name, "Nothing to roll back"),
			Ok(Err(e)) => error!(%name, error = %e, "Failed to roll back incomplete record"),
			Err(_) => error!(%name, "Timed out rolling back incomplete record"),
		}
	}

	/// Publish queued events until the queue closes or `cancel` fires.
	/// Hands the receiver back so the caller decides when to close it.
	pub async fn run(
		self,
		mut rx: mpsc::Receiver<EnoexecEvent>,
		cancel: CancellationToken,
	) -> mpsc::Receiver<EnoexecEvent> {
		info!("Publisher running");
		loop {
			let event = tokio::select! {
				biased;
				_ = cancel.cancelled() => break,
				event = rx.recv() => match event {
					Some(event) => event,
					None => break,
				},
			};
			match self.publish(&event, &cancel).await {
				Ok(_) => {}
				Err(PublishError::Cancelled) => break,
				Err(e) => warn!(error = %e, pod = %event.pod_name, "Dropping event"),
			}
		}
		info!("Publisher stopped");
		rx
	}
}

async fn bounded<T>(
	deadline: Instant,
	cancel: &CancellationToken,
	op: impl Future<Output = K8sResult<T>>,
) -> Bounded<T> {
	tokio::select! {
		biased;
		_ = cancel.cancelled() => Bounded::Cancelled,
		result = tokio::time::timeout_at(deadline, op) => {
			Bounded::Done(result.unwrap_or(Err(K8sError::Timeout)))
		}
	}
}
