//! Per-identifier exponential-backoff lockout, guarding unlock attempts
//! against each provider.
//!
//! Modeled on the `RateLimiter` in the wallet core this workspace borrows its
//! async/session style from, generalized from a single hardcoded limiter to
//! one keyed by an arbitrary identifier — here, the same provider id the key
//! store uses (§3 invariant: "rate-limit state is keyed identically to the
//! vault's provider key") — and persisted in the host's ephemeral store, so a
//! lockout survives a service-worker restart within the same session but not
//! a fresh install.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Millis};
use crate::errors::VaultError;
use crate::store::KvStore;

/// Failures allowed inside [`WINDOW_MS`] before a lockout is imposed.
pub const MAX_ATTEMPTS: u32 = 5;
/// The sliding window over which failures accumulate.
pub const WINDOW_MS: Millis = 15 * 60 * 1000;
/// The first lockout's duration.
pub const INITIAL_LOCKOUT_MS: Millis = 30 * 1000;
/// Each subsequent consecutive lockout doubles the previous one.
pub const LOCKOUT_MULTIPLIER: u32 = 2;
/// Lockouts never grow past this.
pub const MAX_LOCKOUT_MS: Millis = 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitStatus {
	Allowed { attempts_remaining: u32 },
	Locked { retry_after_ms: Millis },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RateLimitState {
	failed_attempts: u32,
	window_started_at: Millis,
	last_attempt_at: Millis,
	lockout_count: u32,
	locked_until: Millis,
}

pub struct RateLimiter<S: KvStore + ?Sized> {
	store: Arc<S>,
	clock: Arc<dyn Clock>,
}

impl<S: KvStore + ?Sized> RateLimiter<S> {
	pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
		RateLimiter { store, clock }
	}

	/// Exact storage key shape, part of the host's compatibility contract (§6).
	fn storage_key(identifier: &str) -> String {
		format!("rate_limit_{identifier}")
	}

	async fn load(&self, identifier: &str) -> Result<RateLimitState, VaultError> {
		match self.store.get(&Self::storage_key(identifier)).await? {
			Some(value) => Ok(serde_json::from_value(value)?),
			None => Ok(RateLimitState::default()),
		}
	}

	async fn save(&self, identifier: &str, state: &RateLimitState) -> Result<(), VaultError> {
		let value = serde_json::to_value(state)?;
		self.store.set(&Self::storage_key(identifier), value).await
	}

	/// Checks whether `identifier` is currently locked out, without
	/// recording an attempt.
	pub async fn check(&self, identifier: &str) -> Result<RateLimitStatus, VaultError> {
		let state = self.load(identifier).await?;
		Ok(self.status_for(&state))
	}

	fn status_for(&self, state: &RateLimitState) -> RateLimitStatus {
		let now = self.clock.now_ms();
		if state.locked_until > now {
			return RateLimitStatus::Locked {
				retry_after_ms: state.locked_until - now,
			};
		}

		let attempts_in_window = if now.saturating_sub(state.window_started_at) < WINDOW_MS {
			state.failed_attempts
		} else {
			0
		};
		RateLimitStatus::Allowed {
			attempts_remaining: MAX_ATTEMPTS.saturating_sub(attempts_in_window),
		}
	}

	/// Records a failed attempt, imposing or extending a lockout once
	/// [`MAX_ATTEMPTS`] is exceeded within the window.
	pub async fn record_failure(&self, identifier: &str) -> Result<RateLimitStatus, VaultError> {
		let mut state = self.load(identifier).await?;
		let now = self.clock.now_ms();

		if now.saturating_sub(state.window_started_at) >= WINDOW_MS {
			state.window_started_at = now;
			state.failed_attempts = 0;
		}

		state.failed_attempts += 1;
		state.last_attempt_at = now;

		if state.failed_attempts >= MAX_ATTEMPTS {
			let lockout_ms = (INITIAL_LOCKOUT_MS.saturating_mul(LOCKOUT_MULTIPLIER.pow(state.lockout_count) as u64)).min(MAX_LOCKOUT_MS);
			state.locked_until = now + lockout_ms;
			state.lockout_count += 1;
			state.failed_attempts = 0;
		}

		self.save(identifier, &state).await?;
		Ok(self.status_for(&state))
	}

	/// Clears all lockout/attempt bookkeeping for `identifier`.
	pub async fn record_success(&self, identifier: &str) -> Result<(), VaultError> {
		self.save(identifier, &RateLimitState::default()).await
	}
}

/// Renders a retry-after duration as a human-readable message (§4.5).
pub fn format_lockout_message(retry_after_ms: Millis) -> String {
	let seconds = retry_after_ms.div_ceil(1000);
	if seconds < 60 {
		let unit = if seconds == 1 { "second" } else { "seconds" };
		format!("Too many attempts. Try again in {seconds} {unit}.")
	} else {
		let minutes = seconds.div_ceil(60);
		let unit = if minutes == 1 { "minute" } else { "minutes" };
		format!("Too many attempts. Try again in {minutes} {unit}.")
	}
}
