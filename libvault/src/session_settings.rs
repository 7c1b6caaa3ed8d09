//! The vault's one persisted configuration surface: how long an unlocked
//! provider stays decrypted, how long the session may sit idle before it's
//! swept, and whether the session key survives a process restart.
//!
//! Settings are read on every session-cache operation, so [`SettingsCache`]
//! memoizes the last-loaded value in process memory and invalidates the
//! memo only when the durable store reports a change to the settings key —
//! the same read-through-memo-with-invalidation shape `obiverse-beewallet-core-spark`
//! uses for its session policy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::errors::VaultError;
use crate::store::KvStore;

/// Exact storage key, part of the host's compatibility contract (§6).
pub const SETTINGS_KEY: &str = "session_settings_v1";

pub const MIN_SESSION_EXPIRY_MINUTES: u32 = 5;
pub const MAX_SESSION_EXPIRY_MINUTES: u32 = 360;
pub const DEFAULT_SESSION_EXPIRY_MINUTES: u32 = 30;

pub const MIN_INACTIVITY_TIMEOUT_MINUTES: u32 = 5;
pub const MAX_INACTIVITY_TIMEOUT_MINUTES: u32 = 60;
pub const DEFAULT_INACTIVITY_TIMEOUT_MINUTES: u32 = 15;

const DEFAULT_PERSIST_SESSION: bool = false;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
	pub session_expiry_minutes: u32,
	pub inactivity_timeout_minutes: u32,
	pub persist_session: bool,
}

impl Default for SessionSettings {
	fn default() -> Self {
		SessionSettings {
			session_expiry_minutes: DEFAULT_SESSION_EXPIRY_MINUTES,
			inactivity_timeout_minutes: DEFAULT_INACTIVITY_TIMEOUT_MINUTES,
			persist_session: DEFAULT_PERSIST_SESSION,
		}
	}
}

impl SessionSettings {
	/// Reads a raw, possibly-tampered JSON blob into sanitized settings.
	/// Every field is independently defaulted or clamped: a corrupted or
	/// hand-edited settings blob can never put the vault into an invalid
	/// state (§4.7).
	fn from_raw(value: &Value) -> SessionSettings {
		let session_expiry_minutes = value
			.get("session_expiry_minutes")
			.and_then(Value::as_f64)
			.filter(|n| n.is_finite())
			.map(|n| n as i64)
			.unwrap_or(DEFAULT_SESSION_EXPIRY_MINUTES as i64);
		let inactivity_timeout_minutes = value
			.get("inactivity_timeout_minutes")
			.and_then(Value::as_f64)
			.filter(|n| n.is_finite())
			.map(|n| n as i64)
			.unwrap_or(DEFAULT_INACTIVITY_TIMEOUT_MINUTES as i64);
		let persist_session = value.get("persist_session").and_then(Value::as_bool).unwrap_or(DEFAULT_PERSIST_SESSION);

		SessionSettings {
			session_expiry_minutes: session_expiry_minutes.max(0) as u32,
			inactivity_timeout_minutes: inactivity_timeout_minutes.max(0) as u32,
			persist_session,
		}
		.sanitize()
	}

	/// Clamps every numeric field to its valid range independently. Applied
	/// unconditionally on every load and every save.
	pub fn sanitize(mut self) -> Self {
		self.session_expiry_minutes = self.session_expiry_minutes.clamp(MIN_SESSION_EXPIRY_MINUTES, MAX_SESSION_EXPIRY_MINUTES);
		self.inactivity_timeout_minutes = self
			.inactivity_timeout_minutes
			.clamp(MIN_INACTIVITY_TIMEOUT_MINUTES, MAX_INACTIVITY_TIMEOUT_MINUTES);
		self
	}

	pub fn session_expiry_ms(&self) -> u64 {
		u64::from(self.session_expiry_minutes) * 60 * 1000
	}

	pub fn inactivity_timeout_ms(&self) -> u64 {
		u64::from(self.inactivity_timeout_minutes) * 60 * 1000
	}

	/// Advisory only (§4.7): true once the configured expiry is long enough
	/// that a caller should warn the user about the exposure window. Not
	/// enforced anywhere in this crate.
	pub fn should_show_security_warning(&self) -> bool {
		self.session_expiry_minutes >= MAX_SESSION_EXPIRY_MINUTES
	}
}

pub struct SessionSettingsStore<D: KvStore + ?Sized> {
	store: Arc<D>,
}

impl<D: KvStore + ?Sized> SessionSettingsStore<D> {
	pub fn new(store: Arc<D>) -> Self {
		SessionSettingsStore { store }
	}

	pub async fn load(&self) -> Result<SessionSettings, VaultError> {
		match self.store.get(SETTINGS_KEY).await? {
			Some(value) => Ok(SessionSettings::from_raw(&value)),
			None => Ok(SessionSettings::default()),
		}
	}

	pub async fn save(&self, settings: SessionSettings) -> Result<SessionSettings, VaultError> {
		let sanitized = settings.sanitize();
		let value = serde_json::to_value(&sanitized)?;
		self.store.set(SETTINGS_KEY, value).await?;
		Ok(sanitized)
	}
}

/// Memoizes [`SessionSettingsStore::load`] in process memory, invalidating
/// the memo only when the durable store reports a change to
/// [`SETTINGS_KEY`] — settings are read on every session-cache operation, so
/// re-parsing JSON on every one of those would be wasted work (§4.6 "Settings
/// cache").
pub struct SettingsCache<D: KvStore + ?Sized> {
	store: SessionSettingsStore<D>,
	memo: Mutex<Option<SessionSettings>>,
	changes: Mutex<broadcast::Receiver<String>>,
}

impl<D: KvStore + ?Sized> SettingsCache<D> {
	pub fn new(durable: Arc<D>) -> Self {
		let changes = durable.subscribe();
		SettingsCache {
			store: SessionSettingsStore::new(durable),
			memo: Mutex::new(None),
			changes: Mutex::new(changes),
		}
	}

	/// Returns the memoized settings, re-reading from storage only if no
	/// memo exists yet or an externally observed change invalidated it.
	pub async fn get(&self) -> Result<SessionSettings, VaultError> {
		self.invalidate_on_external_change().await;

		let mut memo = self.memo.lock().await;
		if let Some(settings) = memo.as_ref() {
			return Ok(settings.clone());
		}
		let loaded = self.store.load().await?;
		*memo = Some(loaded.clone());
		Ok(loaded)
	}

	pub async fn save(&self, settings: SessionSettings) -> Result<SessionSettings, VaultError> {
		let saved = self.store.save(settings).await?;
		*self.memo.lock().await = Some(saved.clone());
		Ok(saved)
	}

	/// Drains any pending change notifications, dropping the memo if one of
	/// them names the settings key. A lagged receiver (too many changes
	/// queued between reads) is treated the same as "something changed" —
	/// the safe conservative choice is to re-read.
	async fn invalidate_on_external_change(&self) {
		let mut rx = self.changes.lock().await;
		let mut changed = false;
		loop {
			match rx.try_recv() {
				Ok(key) if key == SETTINGS_KEY => changed = true,
				Ok(_) => {}
				Err(broadcast::error::TryRecvError::Lagged(_)) => changed = true,
				Err(_) => break,
			}
		}
		if changed {
			*self.memo.lock().await = None;
		}
	}
}
