// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Cluster store abstraction for ENOEXEC event records.
//!
//! This crate provides:
//! - The `ENoExecEvent` custom resource type
//! - A trait-based store abstraction for testability
//! - Production implementation using the kube crate
//! - An in-memory store with failure injection

mod error;
mod kube_client;
mod mock;
mod store;
mod types;

pub use error::{K8sError, K8sResult};
pub use kube_client::KubeEventStore;
pub use mock::MockEventStore;
pub use store::EventStore;
pub use types::{ENoExecEvent, ENoExecEventSpec, ENoExecEventStatus};
