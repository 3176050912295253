// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use enoexec_daemon::{daemon, Config};

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with(tracing_subscriber::fmt::layer().json())
		.init();

	info!("Starting enoexec-daemon");

	let config = Config::from_env()?;
	info!(
		node_name = %config.node_name,
		namespace = %config.namespace,
		runtime_endpoint = %config.runtime_endpoint.display(),
		queue_capacity = config.queue_capacity,
		"Loaded configuration"
	);

	let cancel = CancellationToken::new();
	tokio::spawn(cancel_on_signal(cancel.clone()));

	daemon::run(config, cancel).await?;

	info!("Shut down cleanly");
	Ok(())
}

/// SIGINT and SIGTERM both raise the shutdown signal.
async fn cancel_on_signal(cancel: CancellationToken) {
	match signal(SignalKind::terminate()) {
		Ok(mut sigterm) => {
			tokio::select! {
				_ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
				_ = sigterm.recv() => info!("Received SIGTERM"),
			}
		}
		Err(e) => {
			warn!(error = %e, "Failed to install SIGTERM handler, listening for SIGINT only");
			if let Err(e) = tokio::signal::ctrl_c().await {
				warn!(error = %e, "Failed to listen for SIGINT");
				return;
			}
			info!("Received SIGINT");
		}
	}
	cancel.cancel();
}
