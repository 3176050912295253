// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Maps a tgid to the pod and container it runs in.
//!
//! The pod UID and container ID are recovered from the process's cgroup path
//! as laid out by the kubelet's systemd cgroup driver, then the pod's name and
//! namespace are looked up through the container runtime.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::cri::{PodSandboxLister, RuntimeError};
use crate::decoder::ExecRecord;
use crate::event::EnoexecEvent;

static POD_UID_REGEX: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"pod([0-9a-f_]{36})\.slice").expect("static regex"));

static CONTAINER_SCOPE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^(crio|cri-containerd|docker)-([0-9a-f]{64})\.scope$").expect("static regex")
});

#[derive(Debug, Error)]
pub enum IdentityError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

/// Pod UID and container ID recovered from one process's cgroup path.
/// Either may be empty when the path does not carry it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessIdentity {
	pub pod_uid: String,
	pub container_id: String,
}

fn runtime_scheme(tag: &str) -> &'static str {
	match tag {
		"crio" => "cri-o",
		"cri-containerd" => "containerd",
		_ => "docker",
	}
}

/// Parse the contents of `/proc/<pid>/cgroup`.
pub fn parse_cgroup(contents: &str) -> ProcessIdentity {
	let joined: String = contents.lines().map(str::trim).collect();

	let pod_uid = POD_UID_REGEX
		.captures(&joined)
		.map(|c| c[1].replace('_', "-"))
		.unwrap_or_default();

	let last_segment = joined.rsplit('/').next().unwrap_or_default();
	let container_id = CONTAINER_SCOPE_REGEX
		.captures(last_segment)
		.map(|c| format!("{}://{}", runtime_scheme(&c[1]), &c[2]))
		.unwrap_or_default();

	ProcessIdentity {
		pod_uid,
		container_id,
	}
}

/// Reads cgroup membership from a procfs mount.
#[derive(Debug, Clone)]
pub struct CgroupResolver {
	proc_root: PathBuf,
}

impl CgroupResolver {
	pub fn new(proc_root: impl Into<PathBuf>) -> Self {
		Self {
			proc_root: proc_root.into(),
		}
	}

	pub fn proc_root(&self) -> &Path {
		&self.proc_root
	}

	pub fn resolve(&self, tgid: u32) -> Result<ProcessIdentity, IdentityError> {
		let path = self.proc_root.join(tgid.to_string()).join("cgroup");
		let contents = std::fs::read_to_string(&path).map_err(|source| IdentityError::Read { path, source })?;
		Ok(parse_cgroup(&contents))
	}
}

/// A pod's name and namespace; both empty when the runtime has no sandbox
/// for the UID (yet).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRef {
	pub name: String,
	pub namespace: String,
}

impl PodRef {
	pub fn is_found(&self) -> bool {
		!self.name.is_empty()
	}
}

pub struct IdentityResolver {
	cgroups: CgroupResolver,
	runtime: Arc<dyn PodSandboxLister>,
}

impl IdentityResolver {
	pub fn new(cgroups: CgroupResolver, runtime: Arc<dyn PodSandboxLister>) -> Self {
		Self { cgroups, runtime }
	}

	/// Look up the pod with `pod_uid`. A missing sandbox is not an error.
	pub async fn lookup(&self, pod_uid: &str) -> Result<PodRef, RuntimeError> {
		let sandboxes = self.runtime.list_pod_sandboxes(pod_uid).await?;
		Ok(sandboxes
			.into_iter()
			.find(|s| s.uid == pod_uid)
			.map(|s| PodRef {
				name: s.name,
				namespace: s.namespace,
			})
			.unwrap_or_default())
	}

	/// Attribute a record to a pod, trying the current task first and its
	/// parent second. `Ok(None)` means neither resolved.
	pub async fn resolve_record(&self, record: ExecRecord) -> Result<Option<EnoexecEvent>, RuntimeError> {
		for tgid in [record.current_tgid, record.parent_tgid] {
			let identity = match self.cgroups.resolve(tgid) {
				Ok(identity) => identity,
				Err(e) => {
					debug!(tgid, error = %e, "Process cgroup unavailable");
					continue;
				}
			};
			if identity.pod_uid.is_empty() {
				debug!(tgid, "Process is not in a pod cgroup");
				continue;
			}

			let pod = self.lookup(&identity.pod_uid).await?;
			if !pod.is_found() {
				debug!(tgid, pod_uid = %identity.pod_uid, "No pod sandbox for UID");
				continue;
			}

			return Ok(Some(EnoexecEvent {
				pod_name: pod.name,
				pod_namespace: pod.namespace,
				container_id: identity.container_id,
			}));
		}
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{crio_cgroup, write_cgroup, MockSandboxLister, CONTAINER_HEX, POD_UID, POD_UID_SLICE};

	#[test]
	fn test_parse_crio_cgroup() {
		let contents = format!(
			"0::/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod{POD_UID_SLICE}.slice/crio-{CONTAINER_HEX}.scope\n"
		);
		let identity = parse_cgroup(&contents);
		assert_eq!(identity.pod_uid, POD_UID);
		assert_eq!(identity.container_id, format!("cri-o://{CONTAINER_HEX}"));
	}

	#[test]
	fn test_parse_other_runtimes() {
		let containerd = format!("0::/kubepods.slice/pod{POD_UID_SLICE}.slice/cri-containerd-{CONTAINER_HEX}.scope");
		assert_eq!(
			parse_cgroup(&containerd).container_id,
			format!("containerd://{CONTAINER_HEX}")
		);
		let docker = format!("0::/kubepods.slice/pod{POD_UID_SLICE}.slice/docker-{CONTAINER_HEX}.scope");
		assert_eq!(parse_cgroup(&docker).container_id, format!("docker://{CONTAINER_HEX}"));
	}

	#[test]
	fn test_parse_host_process() {
		let identity = parse_cgroup("0::/system.slice/sshd.service\n");
		assert_eq!(identity, ProcessIdentity::default());
	}

	#[test]
	fn test_parse_conmon_scope_has_pod_but_no_container() {
		let contents = format!("0::/kubepods.slice/kubepods-pod{POD_UID_SLICE}.slice/crio-conmon-{CONTAINER_HEX}.scope");
		let identity = parse_cgroup(&contents);
		assert_eq!(identity.pod_uid, POD_UID);
		assert!(identity.container_id.is_empty());
	}

	#[test]
	fn test_parse_joins_v1_lines() {
		let contents = format!(
			"12:memory:/kubepods.slice/kubepods-pod{POD_UID_SLICE}.slice/crio-{CONTAINER_HEX}.scope\n1:name=systemd:/kubepods.slice/kubepods-pod{POD_UID_SLICE}.slice/crio-{CONTAINER_HEX}.scope\n"
		);
		let identity = parse_cgroup(&contents);
		assert_eq!(identity.pod_uid, POD_UID);
		assert_eq!(identity.container_id, format!("cri-o://{CONTAINER_HEX}"));
	}

	#[test]
	fn test_cgroup_resolver_reads_procfs() {
		let proc = tempfile::tempdir().unwrap();
		write_cgroup(proc.path(), 4242, &crio_cgroup()).unwrap();
		let identity = CgroupResolver::new(proc.path()).resolve(4242).unwrap();
		assert_eq!(identity.pod_uid, POD_UID);
	}

	#[test]
	fn test_cgroup_resolver_missing_process() {
		let proc = tempfile::tempdir().unwrap();
		assert!(matches!(
			CgroupResolver::new(proc.path()).resolve(1),
			Err(IdentityError::Read { .. })
		));
	}

	#[tokio::test]
	async fn test_lookup_requires_matching_uid() {
		let lister = MockSandboxLister::new();
		lister.add_sandbox("other-uid", "other", "ns");
		let resolver = IdentityResolver::new(CgroupResolver::new("/nonexistent"), Arc::new(lister));
		assert_eq!(resolver.lookup(POD_UID).await.unwrap(), PodRef::default());
	}

	#[tokio::test]
	async fn test_current_task_wins() {
		let proc = tempfile::tempdir().unwrap();
		write_cgroup(proc.path(), 200, &crio_cgroup()).unwrap();
		write_cgroup(proc.path(), 100, "0::/kubepods-podffffffff_ffff_ffff_ffff_ffffffffffff.slice/x.scope").unwrap();
		let lister = MockSandboxLister::new();
		lister.add_sandbox(POD_UID, "web", "shop");
		lister.add_sandbox("ffffffff-ffff-ffff-ffff-ffffffffffff", "parent", "shop");
		let resolver = IdentityResolver::new(CgroupResolver::new(proc.path()), Arc::new(lister));

		let event = resolver
			.resolve_record(ExecRecord {
				parent_tgid: 100,
				current_tgid: 200,
			})
			.await
			.unwrap()
			.unwrap();
		assert_eq!(event.pod_name, "web");
		assert_eq!(event.container_id, format!("cri-o://{CONTAINER_HEX}"));
	}

	#[tokio::test]
	async fn test_falls_back_to_parent() {
		let proc = tempfile::tempdir().unwrap();
		write_cgroup(proc.path(), 200, "0::/system.slice/containerd.service").unwrap();
		write_cgroup(proc.path(), 100, &crio_cgroup()).unwrap();
		let lister = MockSandboxLister::new();
		lister.add_sandbox(POD_UID, "web", "shop");
		let resolver = IdentityResolver::new(CgroupResolver::new(proc.path()), Arc::new(lister));

		let event = resolver
			.resolve_record(ExecRecord {
				parent_tgid: 100,
				current_tgid: 200,
			})
			.await
			.unwrap()
			.unwrap();
		assert_eq!(event.pod_name, "web");
		assert_eq!(event.pod_namespace, "shop");
		assert_eq!(event.container_id, format!("cri-o://{CONTAINER_HEX}"));
	}

	#[tokio::test]
	async fn test_unresolved_record() {
		let proc = tempfile::tempdir().unwrap();
		write_cgroup(proc.path(), 100, &crio_cgroup()).unwrap();
		let resolver = IdentityResolver::new(CgroupResolver::new(proc.path()), Arc::new(MockSandboxLister::new()));

		let result = resolver
			.resolve_record(ExecRecord {
				parent_tgid: 100,
				current_tgid: 200,
			})
			.await
			.unwrap();
		assert!(result.is_none());
	}

	#[tokio::test]
	async fn test_unreachable_runtime_is_an_error() {
		let proc = tempfile::tempdir().unwrap();
		write_cgroup(proc.path(), 200, &crio_cgroup()).unwrap();
		let lister = MockSandboxLister::new();
		lister.set_unreachable(true);
		let resolver = IdentityResolver::new(CgroupResolver::new(proc.path()), Arc::new(lister));

		let result = resolver
			.resolve_record(ExecRecord {
				parent_tgid: 100,
				current_tgid: 200,
			})
			.await;
		assert!(matches!(result, Err(RuntimeError::Unreachable { .. })));
	}
}
