// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use kube::{
	api::{Api, DeleteParams, Patch, PatchParams, PostParams},
	Client,
};
use tracing::{debug, instrument};

use crate::error::{K8sError, K8sResult};
use crate::store::EventStore;
use crate::types::{ENoExecEvent, ENoExecEventStatus};

/// Production store implementation using the kube crate.
pub struct KubeEventStore {
	client: Client,
}

impl KubeEventStore {
	/// Create a new store that auto-discovers cluster configuration.
	///
	/// This will attempt to load config from:
	/// 1. In-cluster service account (when running in K8s)
	/// 2. KUBECONFIG environment variable
	/// 3. ~/.kube/config
	pub async fn new() -> K8sResult<Self> {
		let client = Client::try_default().await?;
		debug!("K8s client initialized");
		Ok(Self { client })
	}

	pub fn from_client(client: Client) -> Self {
		Self { client }
	}

	fn api(&self, namespace: &str) -> Api<ENoExecEvent> {
		Api::namespaced(self.client.clone(), namespace)
	}
}

fn map_not_found(err: kube::Error, namespace: &str, name: &str) -> K8sError {
	match err {
		kube::Error::Api(ref resp) if resp.code == 404 => K8sError::not_found(namespace, name),
		e => e.into(),
	}
}

#[async_trait]
impl EventStore for KubeEventStore {
	#[instrument(skip(self, event), fields(name = event.metadata.name.as_deref()))]
	async fn create(&self, namespace: &str, event: &ENoExecEvent) -> K8sResult<ENoExecEvent> {
		let created = self.api(namespace).create(&PostParams::default(), event).await?;
		Ok(created)
	}

	#[instrument(skip(self))]
	async fn get(&self, namespace: &str, name: &str) -> K8sResult<ENoExecEvent> {
		self
			.api(namespace)
			.get(name)
			.await
			.map_err(|e| map_not_found(e, namespace, name))
	}

	#[instrument(skip(self, status))]
	async fn update_status(
		&self,
		namespace: &str,
		name: &str,
		status: &ENoExecEventStatus,
	) -> K8sResult<ENoExecEvent> {
		let patch = serde_json::json!({ "status": status });
		self
			.api(namespace)
			.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
			.await
			.map_err(|e| map_not_found(e, namespace, name))
	}

	#[instrument(skip(self))]
	async fn delete(&self, namespace: &str, name: &str) -> K8sResult<()> {
		match self.api(namespace).delete(name, &DeleteParams::default()).await {
			Ok(_) => Ok(()),
			Err(e) => Err(map_not_found(e, namespace, name)),
		}
	}
}
