// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{K8sError, K8sResult};
use crate::store::EventStore;
use crate::types::{ENoExecEvent, ENoExecEventStatus};

/// In-memory [`EventStore`] with per-operation failure injection.
#[derive(Default)]
pub struct MockEventStore {
	records: Mutex<BTreeMap<(String, String), ENoExecEvent>>,
	create_calls: AtomicUsize,
	fail_create: AtomicBool,
	fail_get: AtomicBool,
	fail_update_status: AtomicBool,
	fail_delete: AtomicBool,
}

impl MockEventStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn fail_create(&self, fail: bool) {
		self.fail_create.store(fail, Ordering::SeqCst);
	}

	pub fn fail_get(&self, fail: bool) {
		self.fail_get.store(fail, Ordering::SeqCst);
	}

	pub fn fail_update_status(&self, fail: bool) {
		self.fail_update_status.store(fail, Ordering::SeqCst);
	}

	pub fn fail_delete(&self, fail: bool) {
		self.fail_delete.store(fail, Ordering::SeqCst);
	}

	/// Number of `create` calls, successful or not.
	pub fn create_calls(&self) -> usize {
		self.create_calls.load(Ordering::SeqCst)
	}

	/// Snapshot of all stored records.
	pub fn records(&self) -> Vec<ENoExecEvent> {
		self.lock().values().cloned().collect()
	}

	fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, String), ENoExecEvent>> {
		self.records.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn injected(flag: &AtomicBool, op: &str) -> K8sResult<()> {
		if flag.load(Ordering::SeqCst) {
			return Err(K8sError::ApiError {
				message: format!("injected {op} failure"),
			});
		}
		Ok(())
	}
}

fn key(namespace: &str, name: &str) -> (String, String) {
	(namespace.to_string(), name.to_string())
}

#[async_trait]
impl EventStore for MockEventStore {
	async fn create(&self, namespace: &str, event: &ENoExecEvent) -> K8sResult<ENoExecEvent> {
		self.create_calls.fetch_add(1, Ordering::SeqCst);
		Self::injected(&self.fail_create, "create")?;

		let name = event.metadata.name.clone().ok_or_else(|| K8sError::ApiError {
			message: "metadata.name is required".to_string(),
		})?;
		let mut records = self.lock();
		let k = key(namespace, &name);
		if records.contains_key(&k) {
			return Err(K8sError::ApiError {
				message: format!("enoexecevents \"{name}\" already exists"),
			});
		}
		let mut stored = event.clone();
		stored.metadata.namespace = Some(namespace.to_string());
		stored.status = None;
		records.insert(k, stored.clone());
		Ok(stored)
	}

	async fn get(&self, namespace: &str, name: &str) -> K8sResult<ENoExecEvent> {
		Self::injected(&self.fail_get, "get")?;
		self
			.lock()
			.get(&key(namespace, name))
			.cloned()
			.ok_or_else(|| K8sError::not_found(namespace, name))
	}

	async fn update_status(
		&self,
		namespace: &str,
		name: &str,
		status: &ENoExecEventStatus,
	) -> K8sResult<ENoExecEvent> {
		Self::injected(&self.fail_update_status, "update_status")?;
		let mut records = self.lock();
		let record = records
			.get_mut(&key(namespace, name))
			.ok_or_else(|| K8sError::not_found(namespace, name))?;
		record.status = Some(status.clone());
		Ok(record.clone())
	}

	async fn delete(&self, namespace: &str, name: &str) -> K8sResult<()> {
		Self::injected(&self.fail_delete, "delete")?;
		self
			.lock()
			.remove(&key(namespace, name))
			.map(|_| ())
			.ok_or_else(|| K8sError::not_found(namespace, name))
	}
}
