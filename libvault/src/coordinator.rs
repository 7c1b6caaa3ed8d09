//! The façade most callers actually use: orchestrates the rate limiter, the
//! session cache, and the secure key vault into the handful of compound
//! operations a caller needs (unlock, save a key, change a provider's
//! password) without ever needing to sequence those three itself.

use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::alarms::Alarms;
use crate::clock::Clock;
use crate::device_binding::DeviceBinding;
use crate::errors::{CoordinatorError, VaultError};
use crate::format;
use crate::key_store::KeyStore;
use crate::rate_limiter::{format_lockout_message, RateLimitStatus, RateLimiter};
use crate::revocation::RevocationDetector;
use crate::session_cache::SessionCache;
use crate::session_settings::SettingsCache;
use crate::store::{EphemeralStore, KvStore};
use crate::vault::SecureKeyVault;

/// Lowercases and trims a caller-supplied provider id, so `"OpenAI"` and
/// `" openai "` always key the same record (§3 "case-normalized (lower) for
/// keying").
fn normalize_provider(provider: &str) -> String {
	provider.trim().to_lowercase()
}

/// Events a caller can subscribe to instead of polling `is_unlocked`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
	SessionLocked,
	SessionUnlocked(String),
}

pub trait EventSink: Send + Sync {
	fn emit(&self, event: SessionEvent);
}

/// Discards every event. The default when a caller doesn't need them.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
	fn emit(&self, _event: SessionEvent) {}
}

/// The shape `list_providers` reports: enough to render a list without ever
/// decrypting anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderSummary {
	pub provider: String,
	pub is_unlocked: bool,
	pub created_at: u64,
	pub last_used_at: Option<u64>,
}

/// Input to [`Coordinator::save_key`] (§4.9).
pub struct SaveKeyRequest<'a> {
	pub provider: &'a str,
	pub api_key: &'a str,
	pub password: &'a str,
	pub confirm_password: &'a str,
}

pub struct Coordinator<D, E, A>
where
	D: KvStore + ?Sized,
	E: EphemeralStore + ?Sized,
	A: Alarms + ?Sized,
{
	vault: SecureKeyVault<D>,
	key_store: Arc<KeyStore<D>>,
	device_binding: Arc<DeviceBinding<D>>,
	rate_limiter: RateLimiter<E>,
	session_cache: SessionCache<D, E, A>,
	revocation: RevocationDetector<D>,
	event_sink: Arc<dyn EventSink>,
}

impl<D, E, A> Coordinator<D, E, A>
where
	D: KvStore + ?Sized,
	E: EphemeralStore + ?Sized,
	A: Alarms + ?Sized,
{
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		durable: Arc<D>,
		ephemeral: Arc<E>,
		alarms: Arc<A>,
		clock: Arc<dyn Clock>,
		installation_id: impl Into<String>,
		event_sink: Arc<dyn EventSink>,
	) -> Self {
		let installation_id = installation_id.into();
		let device_binding = Arc::new(DeviceBinding::new(durable.clone(), installation_id.clone()));
		let key_store = Arc::new(KeyStore::new(durable.clone()));
		let vault = SecureKeyVault::new(durable.clone(), device_binding.clone(), clock.clone());
		let rate_limiter = RateLimiter::new(ephemeral.clone(), clock.clone());
		let settings = Arc::new(SettingsCache::new(durable.clone()));
		let session_cache = SessionCache::new(ephemeral, alarms, clock, installation_id, settings);
		let revocation = RevocationDetector::new(key_store.clone(), device_binding.clone());

		Coordinator {
			vault,
			key_store,
			device_binding,
			rate_limiter,
			session_cache,
			revocation,
			event_sink,
		}
	}

	/// Prepares the session cache: must be called once before any other
	/// operation (§4.6 session key lifecycle). Cheap and idempotent to retry
	/// if it fails, but not to call twice in a row while the first call's
	/// session key is still in use.
	pub async fn initialize(&self) -> Result<(), CoordinatorError> {
		self.session_cache.initialize().await?;

		let event_sink = self.event_sink.clone();
		self.session_cache
			.arm_auto_lock(Arc::new(move || event_sink.emit(SessionEvent::SessionLocked)))
			.await?;
		Ok(())
	}

	/// Unlocks `provider`: checks the rate limiter, returns a cached
	/// plaintext if one is already unlocked, otherwise decrypts it from the
	/// vault and caches the result (§4.9).
	pub async fn unlock(&self, provider: &str, password: &str) -> Result<Zeroizing<String>, CoordinatorError> {
		let provider = normalize_provider(provider);

		if let RateLimitStatus::Locked { retry_after_ms } = self.rate_limiter.check(&provider).await? {
			return Err(CoordinatorError::RateLimited { retry_after_ms });
		}

		if let Some(cached) = self.session_cache.get_cached_key(&provider).await? {
			self.rate_limiter.record_success(&provider).await?;
			return Ok(cached);
		}

		match self.vault.get_key(&provider, password.as_bytes()).await {
			Ok(plaintext) => {
				self.rate_limiter.record_success(&provider).await?;
				self.session_cache.cache_key(&provider, &plaintext).await?;
				self.event_sink.emit(SessionEvent::SessionUnlocked(provider));
				Ok(plaintext)
			}
			Err(VaultError::DecryptionError) => {
				let status = self.rate_limiter.record_failure(&provider).await?;
				warn!(provider = %provider, "unlock failed: wrong password");
				Err(match status {
					RateLimitStatus::Allowed { attempts_remaining } => CoordinatorError::WrongPassword {
						attempts_remaining: Some(attempts_remaining),
						retry_after_ms: None,
					},
					RateLimitStatus::Locked { retry_after_ms } => CoordinatorError::WrongPassword {
						attempts_remaining: Some(0),
						retry_after_ms: Some(retry_after_ms),
					},
				})
			}
			Err(VaultError::KeyNotFound) => Err(CoordinatorError::KeyNotFound),
			Err(other) => Err(other.into()),
		}
	}

	/// Removes only `provider` from the session cache.
	pub async fn lock(&self, provider: &str) -> Result<(), CoordinatorError> {
		let provider = normalize_provider(provider);
		self.session_cache.remove_cached_key(&provider).await?;
		debug!(provider = %provider, "provider locked");
		Ok(())
	}

	/// Clears every cached provider.
	pub async fn lock_all(&self) -> Result<(), CoordinatorError> {
		self.session_cache.clear_all().await?;
		self.event_sink.emit(SessionEvent::SessionLocked);
		debug!("vault locked");
		Ok(())
	}

	pub async fn is_unlocked(&self, provider: &str) -> Result<bool, CoordinatorError> {
		let provider = normalize_provider(provider);
		Ok(self.session_cache.is_unlocked(&provider).await?)
	}

	/// Validates, encrypts, and stores `api_key` for the request's provider,
	/// then immediately caches it — the caller that just saved a key expects
	/// to be able to use it right away (§4.9).
	pub async fn save_key(&self, request: SaveKeyRequest<'_>) -> Result<(), CoordinatorError> {
		if request.password != request.confirm_password {
			return Err(CoordinatorError::PasswordsMismatch);
		}

		let strength = format::score_password(request.password);
		if !strength.meets_requirements() {
			return Err(CoordinatorError::InvalidPassword {
				requirements: strength.failing_requirements,
			});
		}

		let provider = normalize_provider(request.provider);
		let validated = format::validate_api_key_format(&provider, request.api_key).map_err(|hint| CoordinatorError::InvalidApiKey { hint })?;

		self.vault.save_key(&provider, &validated.sanitized_key, request.password.as_bytes()).await?;
		self.session_cache.cache_key(&provider, &validated.sanitized_key).await?;
		self.event_sink.emit(SessionEvent::SessionUnlocked(provider));
		Ok(())
	}

	pub async fn has_key(&self, provider: &str) -> Result<bool, CoordinatorError> {
		Ok(self.vault.has_key(&normalize_provider(provider)).await?)
	}

	/// Returns the cached plaintext for `provider` if it's currently
	/// unlocked; never attempts decryption from the durable vault.
	pub async fn get_unlocked_key(&self, provider: &str) -> Result<Option<Zeroizing<String>>, CoordinatorError> {
		Ok(self.session_cache.get_cached_key(&normalize_provider(provider)).await?)
	}

	/// Deletes the stored key for `provider` and drops it from the session
	/// cache if present.
	pub async fn delete_key(&self, provider: &str) -> Result<(), CoordinatorError> {
		let provider = normalize_provider(provider);
		self.vault.remove_key(&provider).await?;
		self.session_cache.remove_cached_key(&provider).await?;
		Ok(())
	}

	/// All configured providers with their unlock state, sorted by name.
	pub async fn list_providers(&self) -> Result<Vec<ProviderSummary>, CoordinatorError> {
		let metadata = self.vault.list_providers().await?;
		let mut summaries = Vec::with_capacity(metadata.len());
		for entry in metadata {
			let is_unlocked = self.session_cache.is_unlocked(&entry.provider).await?;
			summaries.push(ProviderSummary {
				provider: entry.provider,
				is_unlocked,
				created_at: entry.created_at,
				last_used_at: entry.last_used_at,
			});
		}
		Ok(summaries)
	}

	/// Re-encrypts `provider`'s key under `new_password`, after verifying
	/// `current_password` (via the same path [`Self::unlock`] uses, so it's
	/// rate-limited identically) and checking that `new_password` meets the
	/// strength bar and matches its confirmation.
	pub async fn change_password(&self, provider: &str, current_password: &str, new_password: &str, confirm_new_password: &str) -> Result<(), CoordinatorError> {
		if new_password != confirm_new_password {
			return Err(CoordinatorError::PasswordsMismatch);
		}

		let strength = format::score_password(new_password);
		if !strength.meets_requirements() {
			return Err(CoordinatorError::InvalidPassword {
				requirements: strength.failing_requirements,
			});
		}

		let provider = normalize_provider(provider);
		let plaintext = self.unlock(&provider, current_password).await?;

		self.vault.reencrypt_key(&provider, &plaintext, new_password.as_bytes()).await?;
		self.session_cache.cache_key(&provider, &plaintext).await?;

		info!(provider = %provider, "provider password changed");
		Ok(())
	}

	/// Runs orphan detection and removes anything found. See
	/// [`RevocationDetector`].
	pub async fn cleanup_orphaned_keys(&self) -> Result<Vec<String>, CoordinatorError> {
		Ok(self.revocation.cleanup_orphaned_keys().await?)
	}

	/// Scans for orphaned providers without removing anything.
	pub async fn check_for_orphaned_keys(&self) -> crate::revocation::OrphanReport {
		self.revocation.check_for_orphaned_keys().await
	}

	/// True once a device salt has been persisted for this installation.
	pub async fn is_device_bound(&self) -> Result<bool, CoordinatorError> {
		Ok(self.device_binding.is_bound().await?)
	}

	/// All providers the vault has a stored record for, regardless of lock
	/// state. Used by orphan cleanup and diagnostics.
	pub async fn stored_providers(&self) -> Result<Vec<String>, CoordinatorError> {
		let mut providers: Vec<String> = self.key_store.all().await?.into_keys().collect();
		providers.sort();
		Ok(providers)
	}
}

/// Renders a [`CoordinatorError::RateLimited`]/[`CoordinatorError::WrongPassword`]
/// with a retry-after into a user-facing string.
pub fn describe_lockout(error: &CoordinatorError) -> Option<String> {
	match error {
		CoordinatorError::RateLimited { retry_after_ms } => Some(format_lockout_message(*retry_after_ms)),
		CoordinatorError::WrongPassword {
			retry_after_ms: Some(retry_after_ms),
			..
		} => Some(format_lockout_message(*retry_after_ms)),
		_ => None,
	}
}
