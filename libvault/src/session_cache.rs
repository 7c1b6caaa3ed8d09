//! The in-memory, per-provider unlocked-key cache.
//!
//! A plaintext API key never touches the host's ephemeral store directly.
//! Unlocking a provider decrypts it once from the durable vault (paying the
//! PBKDF2 cost) and re-seals it under a session key that exists only in this
//! process's memory; every subsequent read of that provider for the rest of
//! the session goes through the cheap session-key seal instead of PBKDF2
//! again. If the ephemeral store turns out to be less isolated than the host
//! promised, an attacker who reads it still only gets ciphertext they can't
//! open without the session key (§4.6).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use zeroize::Zeroizing;

use vaultcrypto::{derive_hkdf_bytes, Key};

use crate::alarms::{AlarmHandler, Alarms};
use crate::clock::{Clock, Millis};
use crate::errors::VaultError;
use crate::session_settings::{SessionSettings, SettingsCache};
use crate::store::{EphemeralStore, KvStore};

/// Exact storage keys, part of the host's compatibility contract (§6).
const CACHE_KEY: &str = "decrypted_keys_cache";
const PERSISTED_SESSION_KEY_KEY: &str = "persisted_session_key";
/// Exact alarm name (§6).
const INACTIVITY_ALARM: &str = "session-timeout";
const SESSION_KEY_PROTECTION_INFO: &[u8] = b"session-key-protection-v1";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry {
	#[serde(rename = "encryptedKey")]
	envelope: String,
	#[serde(rename = "expiresAt")]
	expires_at: Millis,
	provider: String,
}

#[derive(Serialize, Deserialize)]
struct CacheOnDisk {
	keys: BTreeMap<String, CacheEntry>,
	#[serde(rename = "lastActivity")]
	last_activity: Millis,
}

impl Default for CacheOnDisk {
	fn default() -> Self {
		CacheOnDisk {
			keys: BTreeMap::new(),
			last_activity: 0,
		}
	}
}

/// Wipes every cached entry from `ephemeral`. Shared by [`SessionCache::clear_all`]
/// and the inactivity alarm's handler, so both paths clear the cache the same way.
async fn clear_cache_entries<S: EphemeralStore + ?Sized>(ephemeral: &S) -> Result<(), VaultError> {
	let value = serde_json::to_value(CacheOnDisk::default())?;
	ephemeral.set(CACHE_KEY, value).await
}

#[derive(Serialize, Deserialize)]
struct WrappedSessionKey {
	#[serde(rename = "encryptedKey")]
	envelope: String,
	protector: String,
	#[serde(rename = "createdAt")]
	created_at: Millis,
}

pub struct SessionCache<D: KvStore + ?Sized, S: EphemeralStore + ?Sized, A: Alarms + ?Sized> {
	ephemeral: Arc<S>,
	alarms: Arc<A>,
	clock: Arc<dyn Clock>,
	installation_id: String,
	settings: Arc<SettingsCache<D>>,
	session_key: Mutex<Option<Key>>,
}

impl<D: KvStore + ?Sized, S: EphemeralStore + ?Sized, A: Alarms + ?Sized> SessionCache<D, S, A> {
	pub fn new(ephemeral: Arc<S>, alarms: Arc<A>, clock: Arc<dyn Clock>, installation_id: impl Into<String>, settings: Arc<SettingsCache<D>>) -> Self {
		SessionCache {
			ephemeral,
			alarms,
			clock,
			installation_id: installation_id.into(),
			settings,
			session_key: Mutex::new(None),
		}
	}

	/// Sets the ephemeral store to trusted-context access and establishes the
	/// session key: restored from a previous process if persistence is
	/// enabled and a valid wrapped entry exists, otherwise freshly generated.
	/// Must be called once before any other operation on this cache (§4.6).
	pub async fn initialize(&self) -> Result<(), VaultError> {
		self.ephemeral.set_access_level(true);
		let settings = self.settings.get().await?;

		let key = if settings.persist_session {
			match self.try_restore_session_key().await {
				Some(key) => key,
				None => {
					let _ = self.ephemeral.remove(PERSISTED_SESSION_KEY_KEY).await;
					let fresh = Self::generate_session_key()?;
					if self.persist_session_key(&fresh).await.is_err() {
						warn!("failed to persist session key, continuing in-memory only");
						let _ = self.ephemeral.remove(PERSISTED_SESSION_KEY_KEY).await;
					}
					fresh
				}
			}
		} else {
			Self::generate_session_key()?
		};

		*self.session_key.lock().await = Some(key);
		Ok(())
	}

	fn generate_session_key() -> Result<Key, VaultError> {
		Key::from_slice(&vaultcrypto::random_bytes(32)).ok_or(VaultError::EncryptionError)
	}

	async fn try_restore_session_key(&self) -> Option<Key> {
		let value = self.ephemeral.get(PERSISTED_SESSION_KEY_KEY).await.ok().flatten()?;
		let wrapped: WrappedSessionKey = serde_json::from_value(value).ok()?;
		let protector_bytes = data_encoding::HEXLOWER_PERMISSIVE.decode(wrapped.protector.as_bytes()).ok()?;
		let wrap_key = derive_hkdf_bytes(self.installation_id.as_bytes(), &protector_bytes, SESSION_KEY_PROTECTION_INFO, 256).ok()?;
		let plain = vaultcrypto::unseal(&wrapped.envelope, &wrap_key).ok()?;
		Key::from_slice(&plain)
	}

	async fn persist_session_key(&self, key: &Key) -> Result<(), VaultError> {
		let protector = vaultcrypto::random_bytes(32);
		let wrap_key = derive_hkdf_bytes(self.installation_id.as_bytes(), &protector, SESSION_KEY_PROTECTION_INFO, 256)?;
		let envelope = vaultcrypto::seal(&key.0, &wrap_key)?;

		let wrapped = WrappedSessionKey {
			envelope,
			protector: data_encoding::HEXLOWER_PERMISSIVE.encode(&protector),
			created_at: self.clock.now_ms(),
		};
		let value = serde_json::to_value(&wrapped)?;
		self.ephemeral.set(PERSISTED_SESSION_KEY_KEY, value).await
	}

	async fn load(&self) -> Result<CacheOnDisk, VaultError> {
		match self.ephemeral.get(CACHE_KEY).await? {
			Some(value) => Ok(serde_json::from_value(value)?),
			None => Ok(CacheOnDisk::default()),
		}
	}

	async fn save(&self, on_disk: &CacheOnDisk) -> Result<(), VaultError> {
		let value = serde_json::to_value(on_disk)?;
		self.ephemeral.set(CACHE_KEY, value).await
	}

	async fn rearm_inactivity_timer(&self, settings: &SessionSettings) -> Result<(), VaultError> {
		self.alarms.create(INACTIVITY_ALARM, settings.inactivity_timeout_ms()).await
	}

	/// Seals `plaintext` under the session key and caches it for `provider`,
	/// with an expiry computed from the current session settings. Re-arms the
	/// inactivity timer, since the cache is now non-empty.
	pub async fn cache_key(&self, provider: &str, plaintext: &str) -> Result<(), VaultError> {
		let settings = self.settings.get().await?;
		let envelope = {
			let key_slot = self.session_key.lock().await;
			let key = key_slot.as_ref().ok_or(VaultError::EncryptionError)?;
			vaultcrypto::seal(plaintext.as_bytes(), &key.0)?
		};

		let now = self.clock.now_ms();
		let mut on_disk = self.load().await?;
		on_disk.keys.insert(
			provider.to_string(),
			CacheEntry {
				envelope,
				expires_at: now + settings.session_expiry_ms(),
				provider: provider.to_string(),
			},
		);
		on_disk.last_activity = now;
		self.save(&on_disk).await?;
		self.rearm_inactivity_timer(&settings).await
	}

	/// Returns the cached plaintext for `provider`, or `None` if nothing is
	/// cached, the entry has expired, or the session key can no longer open
	/// it (e.g. lost to an un-persisted restart). Expiry is not extended by a
	/// successful read. A hit re-arms the inactivity timer.
	pub async fn get_cached_key(&self, provider: &str) -> Result<Option<Zeroizing<String>>, VaultError> {
		let mut on_disk = self.load().await?;
		let Some(entry) = on_disk.keys.get(provider).cloned() else {
			return Ok(None);
		};

		let now = self.clock.now_ms();
		if now >= entry.expires_at {
			on_disk.keys.remove(provider);
			self.save(&on_disk).await?;
			return Ok(None);
		}

		let plaintext = {
			let key_slot = self.session_key.lock().await;
			let key = key_slot.as_ref().ok_or(VaultError::EncryptionError)?;
			vaultcrypto::unseal(&entry.envelope, &key.0)
		};

		match plaintext {
			Ok(plain) => {
				let as_string = String::from_utf8(plain).map_err(|_| VaultError::InvalidData)?;
				on_disk.last_activity = now;
				self.save(&on_disk).await?;
				let settings = self.settings.get().await?;
				self.rearm_inactivity_timer(&settings).await?;
				Ok(Some(Zeroizing::new(as_string)))
			}
			Err(_) => {
				on_disk.keys.remove(provider);
				self.save(&on_disk).await?;
				Ok(None)
			}
		}
	}

	/// Removes one provider from the cache without disturbing the rest.
	pub async fn remove_cached_key(&self, provider: &str) -> Result<(), VaultError> {
		let mut on_disk = self.load().await?;
		on_disk.keys.remove(provider);
		self.save(&on_disk).await
	}

	/// Clears every cached entry and cancels the inactivity timer.
	pub async fn clear_all(&self) -> Result<(), VaultError> {
		clear_cache_entries(&*self.ephemeral).await?;
		self.alarms.clear(INACTIVITY_ALARM).await
	}

	/// Registers the inactivity alarm's handler with the host's alarm facility
	/// (§4.6, §6 `on_alarm`): when `"session-timeout"` fires, every cached
	/// entry is cleared exactly as [`Self::clear_all`] would, and `on_locked`
	/// runs afterward so the coordinator can tell the rest of the host about
	/// it. Must be called once, after `initialize`.
	pub async fn arm_auto_lock(&self, on_locked: Arc<dyn Fn() + Send + Sync>) -> Result<(), VaultError> {
		let ephemeral = self.ephemeral.clone();
		let alarms = self.alarms.clone();
		let handler: AlarmHandler = Arc::new(move || {
			let ephemeral = ephemeral.clone();
			let alarms = alarms.clone();
			let on_locked = on_locked.clone();
			Box::pin(async move {
				if let Err(err) = clear_cache_entries(&*ephemeral).await {
					warn!(error = %err, "auto-lock on inactivity alarm failed to clear the session cache");
					return;
				}
				let _ = alarms.clear(INACTIVITY_ALARM).await;
				on_locked();
			})
		});
		self.alarms.on_alarm(INACTIVITY_ALARM, handler).await
	}

	pub async fn has_unlocked_keys(&self) -> Result<bool, VaultError> {
		let on_disk = self.load().await?;
		let now = self.clock.now_ms();
		Ok(on_disk.keys.values().any(|entry| entry.expires_at > now))
	}

	/// Providers currently cached and unexpired, sorted by name.
	pub async fn unlocked_providers(&self) -> Result<Vec<String>, VaultError> {
		let on_disk = self.load().await?;
		let now = self.clock.now_ms();
		let mut providers: Vec<String> = on_disk.keys.values().filter(|entry| entry.expires_at > now).map(|entry| entry.provider.clone()).collect();
		providers.sort();
		Ok(providers)
	}

	/// A side-effect-free check of whether `provider` is currently cached and
	/// unexpired. Used by queries (e.g. `list_providers`) that must not reset
	/// the inactivity timer just by asking.
	pub async fn is_unlocked(&self, provider: &str) -> Result<bool, VaultError> {
		let on_disk = self.load().await?;
		let now = self.clock.now_ms();
		Ok(on_disk.keys.get(provider).is_some_and(|entry| entry.expires_at > now))
	}

	/// Pushes `provider`'s expiry out by a fresh `session_expiry_minutes`
	/// window. Returns `false` if the entry is missing or already expired.
	/// Offered for completeness; not wired from the coordinator's public
	/// surface (§9 open question).
	pub async fn extend_session(&self, provider: &str) -> Result<bool, VaultError> {
		let settings = self.settings.get().await?;
		let mut on_disk = self.load().await?;
		let now = self.clock.now_ms();

		let Some(entry) = on_disk.keys.get_mut(provider) else {
			return Ok(false);
		};
		if now >= entry.expires_at {
			on_disk.keys.remove(provider);
			self.save(&on_disk).await?;
			return Ok(false);
		}

		entry.expires_at = now + settings.session_expiry_ms();
		on_disk.last_activity = now;
		self.save(&on_disk).await?;
		self.rearm_inactivity_timer(&settings).await?;
		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::alarms::InMemoryAlarms;
	use crate::clock::FakeClock;
	use crate::session_settings::{SessionSettingsStore, SETTINGS_KEY};
	use crate::store::InMemoryStore;

	fn make_cache(clock: Arc<FakeClock>) -> SessionCache<InMemoryStore, InMemoryStore, InMemoryAlarms> {
		let durable = Arc::new(InMemoryStore::new());
		let ephemeral = Arc::new(InMemoryStore::new());
		let alarms = Arc::new(InMemoryAlarms::new(clock.clone()));
		let settings = Arc::new(SettingsCache::new(durable));
		SessionCache::new(ephemeral, alarms, clock, "install-123", settings)
	}

	#[tokio::test]
	async fn cache_then_read_round_trips() {
		let cache = make_cache(Arc::new(FakeClock::new(0)));
		cache.initialize().await.unwrap();
		cache.cache_key("openai", "sk-proj-abc123").await.unwrap();

		let got = cache.get_cached_key("openai").await.unwrap().unwrap();
		assert_eq!(&*got, "sk-proj-abc123");
	}

	#[tokio::test]
	async fn get_cached_key_is_none_before_anything_is_cached() {
		let cache = make_cache(Arc::new(FakeClock::new(0)));
		cache.initialize().await.unwrap();
		assert!(cache.get_cached_key("openai").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn entry_expires_at_the_configured_session_length() {
		let clock = Arc::new(FakeClock::new(0));
		let cache = make_cache(clock.clone());
		cache.initialize().await.unwrap();
		cache.cache_key("openai", "sk-proj-abc123").await.unwrap();

		clock.advance(30 * 60 * 1000 - 1);
		assert!(cache.get_cached_key("openai").await.unwrap().is_some());

		clock.advance(2);
		assert!(cache.get_cached_key("openai").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn clear_all_removes_every_entry() {
		let cache = make_cache(Arc::new(FakeClock::new(0)));
		cache.initialize().await.unwrap();
		cache.cache_key("openai", "key-a").await.unwrap();
		cache.cache_key("anthropic", "key-b").await.unwrap();

		cache.clear_all().await.unwrap();

		assert!(cache.get_cached_key("openai").await.unwrap().is_none());
		assert!(cache.get_cached_key("anthropic").await.unwrap().is_none());
		assert!(cache.unlocked_providers().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn remove_cached_key_removes_only_that_provider() {
		let cache = make_cache(Arc::new(FakeClock::new(0)));
		cache.initialize().await.unwrap();
		cache.cache_key("openai", "key-a").await.unwrap();
		cache.cache_key("anthropic", "key-b").await.unwrap();

		cache.remove_cached_key("openai").await.unwrap();

		assert!(cache.get_cached_key("openai").await.unwrap().is_none());
		assert!(cache.get_cached_key("anthropic").await.unwrap().is_some());
	}

	#[tokio::test]
	async fn initialize_sets_ephemeral_store_to_trusted_only() {
		let clock = Arc::new(FakeClock::new(0));
		let durable = Arc::new(InMemoryStore::new());
		let ephemeral = Arc::new(InMemoryStore::new());
		let alarms = Arc::new(InMemoryAlarms::new(clock.clone()));
		let settings = Arc::new(SettingsCache::new(durable));
		let cache = SessionCache::new(ephemeral.clone(), alarms, clock, "install-123", settings);

		cache.initialize().await.unwrap();
		assert!(ephemeral.is_trusted_contexts_only());
	}

	#[tokio::test]
	async fn persisted_session_key_survives_reinitialization_with_persistence_enabled() {
		let clock = Arc::new(FakeClock::new(0));
		let durable = Arc::new(InMemoryStore::new());
		let ephemeral = Arc::new(InMemoryStore::new());
		durable
			.set(
				SETTINGS_KEY,
				serde_json::to_value(SessionSettings {
					persist_session: true,
					..SessionSettings::default()
				})
				.unwrap(),
			)
			.await
			.unwrap();

		let settings_store = SessionSettingsStore::new(durable.clone());
		assert!(settings_store.load().await.unwrap().persist_session);

		let settings_a = Arc::new(SettingsCache::new(durable.clone()));
		let cache_a = SessionCache::new(ephemeral.clone(), Arc::new(InMemoryAlarms::new(clock.clone())), clock.clone(), "install-123", settings_a);
		cache_a.initialize().await.unwrap();
		cache_a.cache_key("openai", "sk-proj-abc123").await.unwrap();

		let settings_b = Arc::new(SettingsCache::new(durable));
		let cache_b = SessionCache::new(ephemeral, Arc::new(InMemoryAlarms::new(clock.clone())), clock, "install-123", settings_b);
		cache_b.initialize().await.unwrap();

		let got = cache_b.get_cached_key("openai").await.unwrap().unwrap();
		assert_eq!(&*got, "sk-proj-abc123");
	}

	#[tokio::test]
	async fn without_persistence_a_new_instance_cannot_read_the_old_entry() {
		let clock = Arc::new(FakeClock::new(0));
		let durable = Arc::new(InMemoryStore::new());
		let ephemeral = Arc::new(InMemoryStore::new());

		let settings_a = Arc::new(SettingsCache::new(durable.clone()));
		let cache_a = SessionCache::new(ephemeral.clone(), Arc::new(InMemoryAlarms::new(clock.clone())), clock.clone(), "install-123", settings_a);
		cache_a.initialize().await.unwrap();
		cache_a.cache_key("openai", "sk-proj-abc123").await.unwrap();

		let settings_b = Arc::new(SettingsCache::new(durable));
		let cache_b = SessionCache::new(ephemeral, Arc::new(InMemoryAlarms::new(clock.clone())), clock, "install-123", settings_b);
		cache_b.initialize().await.unwrap();

		assert!(cache_b.get_cached_key("openai").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn extend_session_pushes_out_expiry() {
		let clock = Arc::new(FakeClock::new(0));
		let cache = make_cache(clock.clone());
		cache.initialize().await.unwrap();
		cache.cache_key("openai", "sk-proj-abc123").await.unwrap();

		clock.advance(29 * 60 * 1000);
		assert!(cache.extend_session("openai").await.unwrap());

		clock.advance(29 * 60 * 1000);
		assert!(cache.get_cached_key("openai").await.unwrap().is_some());
	}

	#[tokio::test]
	async fn extend_session_returns_false_for_missing_provider() {
		let cache = make_cache(Arc::new(FakeClock::new(0)));
		cache.initialize().await.unwrap();
		assert!(!cache.extend_session("openai").await.unwrap());
	}

	#[tokio::test]
	async fn inactivity_alarm_is_armed_on_cache_write() {
		let clock = Arc::new(FakeClock::new(0));
		let durable = Arc::new(InMemoryStore::new());
		let ephemeral = Arc::new(InMemoryStore::new());
		let alarms = Arc::new(InMemoryAlarms::new(clock.clone()));
		let settings = Arc::new(SettingsCache::new(durable));
		let cache = SessionCache::new(ephemeral, alarms.clone(), clock, "install-123", settings);

		cache.initialize().await.unwrap();
		cache.cache_key("openai", "sk-proj-abc123").await.unwrap();

		assert_eq!(alarms.scheduled_at(INACTIVITY_ALARM).await.unwrap(), Some(15 * 60 * 1000));
	}

	#[tokio::test]
	async fn unlocked_providers_excludes_expired_entries() {
		let clock = Arc::new(FakeClock::new(0));
		let cache = make_cache(clock.clone());
		cache.initialize().await.unwrap();
		cache.cache_key("openai", "key-a").await.unwrap();

		clock.advance(30 * 60 * 1000 + 1);
		assert!(cache.unlocked_providers().await.unwrap().is_empty());
		assert!(!cache.has_unlocked_keys().await.unwrap());
	}

	#[tokio::test]
	async fn arm_auto_lock_clears_the_cache_and_notifies_when_the_alarm_fires() {
		let clock = Arc::new(FakeClock::new(0));
		let durable = Arc::new(InMemoryStore::new());
		let ephemeral = Arc::new(InMemoryStore::new());
		let alarms = Arc::new(InMemoryAlarms::new(clock.clone()));
		let settings = Arc::new(SettingsCache::new(durable));
		let cache = SessionCache::new(ephemeral, alarms.clone(), clock.clone(), "install-123", settings);

		cache.initialize().await.unwrap();
		let locked = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let locked_handle = locked.clone();
		cache.arm_auto_lock(Arc::new(move || locked_handle.store(true, std::sync::atomic::Ordering::SeqCst))).await.unwrap();

		cache.cache_key("openai", "sk-proj-abc123").await.unwrap();
		assert!(cache.get_cached_key("openai").await.unwrap().is_some());

		clock.advance(15 * 60 * 1000);
		alarms.fire_due().await;

		assert!(locked.load(std::sync::atomic::Ordering::SeqCst));
		assert!(cache.get_cached_key("openai").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn is_unlocked_does_not_reset_the_inactivity_timer() {
		let clock = Arc::new(FakeClock::new(0));
		let durable = Arc::new(InMemoryStore::new());
		let ephemeral = Arc::new(InMemoryStore::new());
		let alarms = Arc::new(InMemoryAlarms::new(clock.clone()));
		let settings = Arc::new(SettingsCache::new(durable));
		let cache = SessionCache::new(ephemeral, alarms.clone(), clock.clone(), "install-123", settings);

		cache.initialize().await.unwrap();
		cache.cache_key("openai", "sk-proj-abc123").await.unwrap();
		let armed_at = alarms.scheduled_at(INACTIVITY_ALARM).await.unwrap();

		clock.advance(1_000);
		assert!(cache.is_unlocked("openai").await.unwrap());
		assert_eq!(alarms.scheduled_at(INACTIVITY_ALARM).await.unwrap(), armed_at);
	}
}
