// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use enoexec_k8s::ENoExecEventStatus;

/// A resolved ENOEXEC failure, queued for publishing exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnoexecEvent {
	pub pod_name: String,
	pub pod_namespace: String,
	pub container_id: String,
}

impl EnoexecEvent {
	pub fn status(&self, node_name: &str) -> ENoExecEventStatus {
		ENoExecEventStatus {
			node_name: node_name.to_string(),
			pod_name: self.pod_name.clone(),
			pod_namespace: self.pod_namespace.clone(),
			container_id: self.container_id.clone(),
		}
	}
}
