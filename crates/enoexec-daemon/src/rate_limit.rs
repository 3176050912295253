// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Token bucket limiting the rate of cluster writes.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
	bucket: Mutex<TokenBucket>,
	refill_rate: f64, // tokens per second
	max_tokens: u32,  // max tokens in bucket
}

#[derive(Debug, Clone)]
struct TokenBucket {
	tokens: f64,
	last_refill: Instant,
}

impl RateLimiter {
	/// Create a limiter that starts full.
	///
	/// # Arguments
	/// * `refill_rate` - tokens per second
	/// * `max_tokens` - maximum tokens in bucket
	pub fn with_rate(refill_rate: f64, max_tokens: u32) -> Self {
		Self {
			bucket: Mutex::new(TokenBucket {
				tokens: max_tokens as f64,
				last_refill: Instant::now(),
			}),
			refill_rate,
			max_tokens,
		}
	}

	fn refill(&self, bucket: &mut TokenBucket) {
		let now = Instant::now();
		let elapsed = now.saturating_duration_since(bucket.last_refill);
		bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens as f64);
		bucket.last_refill = now;
	}

	/// Take a token if one is available.
	pub async fn try_acquire(&self) -> bool {
		let mut bucket = self.bucket.lock().await;
		self.refill(&mut bucket);
		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			true
		} else {
			false
		}
	}

	/// Wait until a token is available and take it. Callers bound the wait
	/// with a timeout.
	pub async fn acquire(&self) {
		loop {
			let wait = {
				let mut bucket = self.bucket.lock().await;
				self.refill(&mut bucket);
				if bucket.tokens >= 1.0 {
					bucket.tokens -= 1.0;
					debug!(remaining = bucket.tokens, "Rate limit token granted");
					return;
				}
				Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.refill_rate).unwrap_or(Duration::MAX)
			};
			tokio::time::sleep(wait).await;
		}
	}

	/// Whole tokens currently available.
	pub async fn remaining_tokens(&self) -> u32 {
		let mut bucket = self.bucket.lock().await;
		self.refill(&mut bucket);
		bucket.tokens as u32
	}
}
