// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Minimal CRI `RuntimeService.ListPodSandbox` client over a unix socket.
//!
//! Only the messages and fields this daemon reads are declared; unknown
//! fields in responses are skipped by the decoder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Code;
use tower::service_fn;
use tracing::{debug, instrument};

pub const LIST_POD_SANDBOX_PATH: &str = "/runtime.v1.RuntimeService/ListPodSandbox";

/// Label the kubelet puts on every sandbox it creates.
pub const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";

#[derive(Debug, Error)]
pub enum RuntimeError {
	#[error("container runtime at {endpoint} unreachable: {message}")]
	Unreachable { endpoint: String, message: String },

	#[error("container runtime returned {code:?}: {message}")]
	Rpc { code: Code, message: String },
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListPodSandboxRequest {
	#[prost(message, optional, tag = "1")]
	pub filter: Option<PodSandboxFilter>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PodSandboxFilter {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(map = "string, string", tag = "3")]
	pub label_selector: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListPodSandboxResponse {
	#[prost(message, repeated, tag = "1")]
	pub items: Vec<PodSandbox>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PodSandbox {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(message, optional, tag = "2")]
	pub metadata: Option<PodSandboxMetadata>,
	#[prost(int32, tag = "3")]
	pub state: i32,
	#[prost(int64, tag = "4")]
	pub created_at: i64,
	#[prost(map = "string, string", tag = "5")]
	pub labels: HashMap<String, String>,
	#[prost(map = "string, string", tag = "6")]
	pub annotations: HashMap<String, String>,
	#[prost(string, tag = "7")]
	pub runtime_handler: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PodSandboxMetadata {
	#[prost(string, tag = "1")]
	pub name: String,
	#[prost(string, tag = "2")]
	pub uid: String,
	#[prost(string, tag = "3")]
	pub namespace: String,
	#[prost(uint32, tag = "4")]
	pub attempt: u32,
}

impl ListPodSandboxRequest {
	pub fn for_pod_uid(pod_uid: &str) -> Self {
		Self {
			filter: Some(PodSandboxFilter {
				label_selector: HashMap::from([(POD_UID_LABEL.to_string(), pod_uid.to_string())]),
				..Default::default()
			}),
		}
	}
}

/// The sandbox fields needed to attribute an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
	pub uid: String,
	pub name: String,
	pub namespace: String,
}

impl From<PodSandbox> for SandboxInfo {
	fn from(sandbox: PodSandbox) -> Self {
		let metadata = sandbox.metadata.unwrap_or_default();
		Self {
			uid: metadata.uid,
			name: metadata.name,
			namespace: metadata.namespace,
		}
	}
}

/// Lists pod sandboxes known to the local container runtime.
#[async_trait]
pub trait PodSandboxLister: Send + Sync {
	async fn list_pod_sandboxes(&self, pod_uid: &str) -> Result<Vec<SandboxInfo>, RuntimeError>;
}

/// CRI client over a lazily connected unix-socket channel.
#[derive(Clone)]
pub struct CriClient {
	channel: Channel,
	endpoint: PathBuf,
}

impl CriClient {
	/// Build a client for the socket at `endpoint`. No connection is made
	/// until the first call; each call is bounded by `timeout`.
	pub fn connect_lazy(endpoint: &Path, timeout: Duration) -> Self {
		let socket = endpoint.to_path_buf();
		// The authority is ignored; every connection goes to `socket`.
		let channel = Endpoint::from_static("http://[::]:50051")
			.connect_timeout(timeout)
			.timeout(timeout)
			.connect_with_connector_lazy(service_fn(move |_: Uri| {
				let socket = socket.clone();
				async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?)) }
			}));
		debug!(endpoint = %endpoint.display(), "Configured container runtime client");
		Self {
			channel,
			endpoint: endpoint.to_path_buf(),
		}
	}

	fn unreachable(&self, message: impl ToString) -> RuntimeError {
		RuntimeError::Unreachable {
			endpoint: self.endpoint.display().to_string(),
			message: message.to_string(),
		}
	}

	fn classify(&self, status: tonic::Status) -> RuntimeError {
		// Statuses synthesized from transport failures carry their cause;
		// statuses sent by the runtime do not.
		let transport = std::error::Error::source(&status).is_some();
		if transport || status.code() == Code::Unavailable {
			self.unreachable(status.message())
		} else {
			RuntimeError::Rpc {
				code: status.code(),
				message: status.message().to_string(),
			}
		}
	}
}

#[async_trait]
impl PodSandboxLister for CriClient {
	#[instrument(skip(self))]
	async fn list_pod_sandboxes(&self, pod_uid: &str) -> Result<Vec<SandboxInfo>, RuntimeError> {
		let mut grpc = tonic::client::Grpc::new(self.channel.clone());
		grpc.ready().await.map_err(|e| self.unreachable(e))?;

		let codec = ProstCodec::<ListPodSandboxRequest, ListPodSandboxResponse>::default();
		let response = grpc
			.unary(
				tonic::Request::new(ListPodSandboxRequest::for_pod_uid(pod_uid)),
				PathAndQuery::from_static(LIST_POD_SANDBOX_PATH),
				codec,
			)
			.await
			.map_err(|status| self.classify(status))?;

		let items = response.into_inner().items;
		debug!(count = items.len(), "Listed pod sandboxes");
		Ok(items.into_iter().map(SandboxInfo::from).collect())
	}
}
