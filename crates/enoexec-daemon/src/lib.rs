// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! User-space half of the ENOEXEC detector: decodes tracer records,
//! attributes them to pods and publishes `ENoExecEvent` records.

pub mod config;
pub mod cri;
pub mod daemon;
pub mod decoder;
pub mod event;
pub mod identity;
pub mod pipeline;
pub mod publisher;
pub mod rate_limit;
pub mod testing;

pub use config::{Config, ConfigError};
pub use daemon::{EventSource, Orchestrator};
pub use event::EnoexecEvent;
