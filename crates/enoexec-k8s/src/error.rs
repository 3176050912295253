// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Result type alias for K8s operations.
pub type K8sResult<T> = Result<T, K8sError>;

/// Errors that can occur during K8s operations.
#[derive(Error, Debug)]
pub enum K8sError {
	#[error("K8s API error: {message}")]
	ApiError { message: String },

	#[error("ENoExecEvent not found: {namespace}/{name}")]
	NotFound { namespace: String, name: String },

	#[error("Operation timed out")]
	Timeout,
}

impl K8sError {
	pub fn not_found(namespace: &str, name: &str) -> Self {
		K8sError::NotFound {
			namespace: namespace.into(),
			name: name.into(),
		}
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, K8sError::NotFound { .. })
	}
}

impl From<kube::Error> for K8sError {
	fn from(err: kube::Error) -> Self {
		K8sError::ApiError {
			message: err.to_string(),
		}
	}
}
