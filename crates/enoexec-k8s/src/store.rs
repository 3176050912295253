// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use async_trait::async_trait;

use crate::error::K8sResult;
use crate::types::{ENoExecEvent, ENoExecEventStatus};

/// Store for `ENoExecEvent` records.
///
/// This abstraction allows for easy mocking in tests while providing
/// a clean interface for the operations the publisher needs.
#[async_trait]
pub trait EventStore: Send + Sync {
	/// Create a record in the specified namespace.
	async fn create(&self, namespace: &str, event: &ENoExecEvent) -> K8sResult<ENoExecEvent>;

	/// Get a record by name. Returns `K8sError::NotFound` if absent.
	async fn get(&self, namespace: &str, name: &str) -> K8sResult<ENoExecEvent>;

	/// Write the status subresource of an existing record.
	async fn update_status(
		&self,
		namespace: &str,
		name: &str,
		status: &ENoExecEventStatus,
	) -> K8sResult<ENoExecEvent>;

	/// Delete a record by name.
	async fn delete(&self, namespace: &str, name: &str) -> K8sResult<()>;
}
