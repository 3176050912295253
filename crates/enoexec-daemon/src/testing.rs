// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Test doubles for the container runtime and a synthetic procfs.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::cri::{PodSandboxLister, RuntimeError, SandboxInfo};

/// Pod UID as it appears in a systemd cgroup slice name.
pub const POD_UID_SLICE: &str = "15778196_6e1f_4b5d_8012_12c7bf5c04b3";
pub const POD_UID: &str = "15778196-6e1f-4b5d-8012-12c7bf5c04b3";
pub const CONTAINER_HEX: &str = "4015cec8d5a2fd3c6d4a0e1b2f3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e";

/// A crio cgroup v2 path for [`POD_UID`] / [`CONTAINER_HEX`].
pub fn crio_cgroup() -> String {
	format!(
		"0::/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod{POD_UID_SLICE}.slice/crio-{CONTAINER_HEX}.scope\n"
	)
}

/// Write `<proc_root>/<tgid>/cgroup`.
pub fn write_cgroup(proc_root: &Path, tgid: u32, contents: &str) -> io::Result<()> {
	let dir = proc_root.join(tgid.to_string());
	std::fs::create_dir_all(&dir)?;
	std::fs::write(dir.join("cgroup"), contents)
}

/// In-memory runtime that ignores label filters and returns every sandbox.
#[derive(Default)]
pub struct MockSandboxLister {
	sandboxes: Mutex<Vec<SandboxInfo>>,
	unreachable: AtomicBool,
	calls: AtomicUsize,
}

impl MockSandboxLister {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_sandbox(&self, uid: &str, name: &str, namespace: &str) {
		self.sandboxes
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(SandboxInfo {
				uid: uid.into(),
				name: name.into(),
				namespace: namespace.into(),
			});
	}

	pub fn set_unreachable(&self, unreachable: bool) {
		self.unreachable.store(unreachable, Ordering::SeqCst);
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl PodSandboxLister for MockSandboxLister {
	async fn list_pod_sandboxes(&self, _pod_uid: &str) -> Result<Vec<SandboxInfo>, RuntimeError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.unreachable.load(Ordering::SeqCst) {
			return Err(RuntimeError::Unreachable {
				endpoint: "mock".into(),
				message: "connection refused".into(),
			});
		}
		Ok(self
			.sandboxes
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone())
	}
}
