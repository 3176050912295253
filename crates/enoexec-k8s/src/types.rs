// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// An exec attempt that failed with ENOEXEC on a node. All information lives
/// in the status subresource; `.spec` is empty.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
	group = "multiarch.openshift.io",
	version = "v1beta1",
	kind = "ENoExecEvent",
	plural = "enoexecevents",
	namespaced,
	status = "ENoExecEventStatus",
	schema = "disabled"
)]
pub struct ENoExecEventSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ENoExecEventStatus {
	#[serde(default)]
	pub node_name: String,
	#[serde(default)]
	pub pod_name: String,
	#[serde(default)]
	pub pod_namespace: String,
	#[serde(default, rename = "containerID")]
	pub container_id: String,
}

impl ENoExecEvent {
	/// A new, status-less record with the given name.
	pub fn named(name: &str) -> Self {
		ENoExecEvent::new(name, ENoExecEventSpec::default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use kube::Resource;

	#[test]
	fn test_resource_identity() {
		assert_eq!(ENoExecEvent::group(&()), "multiarch.openshift.io");
		assert_eq!(ENoExecEvent::version(&()), "v1beta1");
		assert_eq!(ENoExecEvent::kind(&()), "ENoExecEvent");
		assert_eq!(ENoExecEvent::plural(&()), "enoexecevents");
	}

	#[test]
	fn test_status_wire_names() {
		let status = ENoExecEventStatus {
			node_name: "worker-0".into(),
			pod_name: "web-7d4f".into(),
			pod_namespace: "shop".into(),
			container_id: "cri-o://abc".into(),
		};
		let json = serde_json::to_value(&status).unwrap();
		assert_eq!(
			json,
			serde_json::json!({
				"nodeName": "worker-0",
				"podName": "web-7d4f",
				"podNamespace": "shop",
				"containerID": "cri-o://abc",
			})
		);
	}

	#[test]
	fn test_named_has_no_status() {
		let event = ENoExecEvent::named("evt-1");
		assert_eq!(event.metadata.name.as_deref(), Some("evt-1"));
		assert!(event.status.is_none());
	}
}
