// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
	#[error("missing required environment variable: {0}")]
	MissingEnvVar(String),

	#[error("invalid value for {name}: {message}")]
	InvalidValue { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_RUNTIME_ENDPOINT: &str = "/var/run/crio/crio.sock";
pub const DEFAULT_PROC_ROOT: &str = "/proc";
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
	pub node_name: String,
	pub namespace: String,
	pub runtime_endpoint: PathBuf,
	pub proc_root: PathBuf,
	pub btf_path: PathBuf,
	pub queue_capacity: usize,
	pub ringbuf_events: u32,
	pub publish_timeout: Duration,
	pub rate_limit_per_sec: u32,
	pub rate_limit_burst: u32,
	pub runtime_timeout: Duration,
}

impl Config {
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	pub fn from_lookup<F>(lookup: F) -> Result<Self>
	where
		F: Fn(&str) -> Option<String>,
	{
		let env = Env(lookup);

		let node_name = env.require("ENOEXEC_NODE_NAME")?;
		let namespace = env.require("ENOEXEC_NAMESPACE")?;

		let runtime_endpoint = env.optional("ENOEXEC_RUNTIME_ENDPOINT", DEFAULT_RUNTIME_ENDPOINT);
		let runtime_endpoint = PathBuf::from(
			runtime_endpoint
				.strip_prefix("unix://")
				.unwrap_or(runtime_endpoint.as_str()),
		);
		let proc_root = PathBuf::from(env.optional("ENOEXEC_PROC_ROOT", DEFAULT_PROC_ROOT));
		let btf_path = PathBuf::from(env.optional("ENOEXEC_BTF_PATH", enoexec_bpf::btf::VMLINUX_BTF_PATH));

		let queue_capacity: usize = env.positive("ENOEXEC_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;
		let ringbuf_events: u32 = env.positive("ENOEXEC_RINGBUF_EVENTS", enoexec_bpf::DEFAULT_RINGBUF_EVENTS)?;
		let publish_timeout_ms: u64 = env.positive("ENOEXEC_PUBLISH_TIMEOUT_MS", 60_000)?;
		let rate_limit_per_sec: u32 = env.positive("ENOEXEC_RATE_LIMIT_PER_SEC", 10)?;
		let rate_limit_burst: u32 = env.positive("ENOEXEC_RATE_LIMIT_BURST", 20)?;
		let runtime_timeout_ms: u64 = env.positive("ENOEXEC_RUNTIME_TIMEOUT_MS", 5_000)?;

		Ok(Config {
			node_name,
			namespace,
			runtime_endpoint,
			proc_root,
			btf_path,
			queue_capacity,
			ringbuf_events,
			publish_timeout: Duration::from_millis(publish_timeout_ms),
			rate_limit_per_sec,
			rate_limit_burst,
			runtime_timeout: Duration::from_millis(runtime_timeout_ms),
		})
	}
}

struct Env<F>(F);

impl<F> Env<F>
where
	F: Fn(&str) -> Option<String>,
{
	fn require(&self, name: &str) -> Result<String> {
		match (self.0)(name) {
			Some(v) if !v.trim().is_empty() => Ok(v),
			_ => Err(ConfigError::MissingEnvVar(name.to_string())),
		}
	}

	fn optional(&self, name: &str, default: &str) -> String {
		(self.0)(name).unwrap_or_else(|| default.to_string())
	}

	fn parse<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T>
	where
		T::Err: std::fmt::Display,
	{
		match (self.0)(name) {
			Some(val) => val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
				name: name.to_string(),
				message: e.to_string(),
			}),
			None => Ok(default),
		}
	}

	fn positive<T>(&self, name: &str, default: T) -> Result<T>
	where
		T: std::str::FromStr + PartialEq + Default,
		T::Err: std::fmt::Display,
	{
		let value = self.parse(name, default)?;
		if value == T::default() {
			return Err(ConfigError::InvalidValue {
				name: name.to_string(),
				message: "must be greater than zero".into(),
			});
		}
		Ok(value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let vars: HashMap<String, String> = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		move |name| vars.get(name).cloned()
	}

	const REQUIRED: &[(&str, &str)] = &[
		("ENOEXEC_NODE_NAME", "worker-0"),
		("ENOEXEC_NAMESPACE", "openshift-multiarch-tuning-operator"),
	];

	#[test]
	fn test_defaults() {
		let config = Config::from_lookup(lookup(REQUIRED)).unwrap();
		assert_eq!(config.node_name, "worker-0");
		assert_eq!(config.runtime_endpoint, PathBuf::from("/var/run/crio/crio.sock"));
		assert_eq!(config.proc_root, PathBuf::from("/proc"));
		assert_eq!(config.btf_path, PathBuf::from("/sys/kernel/btf/vmlinux"));
		assert_eq!(config.queue_capacity, 256);
		assert_eq!(config.ringbuf_events, 256);
		assert_eq!(config.publish_timeout, Duration::from_secs(60));
		assert_eq!(config.rate_limit_per_sec, 10);
		assert_eq!(config.rate_limit_burst, 20);
		assert_eq!(config.runtime_timeout, Duration::from_secs(5));
	}

	#[test]
	fn test_missing_node_name() {
		let err = Config::from_lookup(lookup(&[("ENOEXEC_NAMESPACE", "ns")])).unwrap_err();
		assert_eq!(err, ConfigError::MissingEnvVar("ENOEXEC_NODE_NAME".into()));
	}

	#[test]
	fn test_blank_namespace_is_missing() {
		let err = Config::from_lookup(lookup(&[("ENOEXEC_NODE_NAME", "n"), ("ENOEXEC_NAMESPACE", "  ")])).unwrap_err();
		assert_eq!(err, ConfigError::MissingEnvVar("ENOEXEC_NAMESPACE".into()));
	}

	#[test]
	fn test_unix_scheme_is_stripped() {
		let mut vars = REQUIRED.to_vec();
		vars.push(("ENOEXEC_RUNTIME_ENDPOINT", "unix:///run/containerd/containerd.sock"));
		let config = Config::from_lookup(lookup(&vars)).unwrap();
		assert_eq!(
			config.runtime_endpoint,
			PathBuf::from("/run/containerd/containerd.sock")
		);
	}

	#[test]
	fn test_zero_queue_capacity_rejected() {
		let mut vars = REQUIRED.to_vec();
		vars.push(("ENOEXEC_QUEUE_CAPACITY", "0"));
		assert!(matches!(
			Config::from_lookup(lookup(&vars)),
			Err(ConfigError::InvalidValue { name, .. }) if name == "ENOEXEC_QUEUE_CAPACITY"
		));
	}

	#[test]
	fn test_unparsable_timeout_rejected() {
		let mut vars = REQUIRED.to_vec();
		vars.push(("ENOEXEC_PUBLISH_TIMEOUT_MS", "soon"));
		assert!(matches!(
			Config::from_lookup(lookup(&vars)),
			Err(ConfigError::InvalidValue { name, .. }) if name == "ENOEXEC_PUBLISH_TIMEOUT_MS"
		));
	}
}
