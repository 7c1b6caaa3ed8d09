//! The secure key vault: the only place in the crate that ever holds a
//! decrypted API key, and only for as long as it takes to hand it back to the
//! caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::device_binding::DeviceBinding;
use crate::errors::VaultError;
use crate::key_store::{KeyStore, StoredKeyRecord};
use crate::store::KvStore;

/// Every `get_key` call takes at least this long, successful or not, so an
/// attacker timing responses cannot distinguish "no such provider", "wrong
/// password", and "correct password" by how fast the vault answers (§4.3,
/// §7).
pub const GET_KEY_TIMING_FLOOR: Duration = Duration::from_millis(400);

/// Metadata about a stored key, safe to expose without ever decrypting it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyMetadata {
	pub provider: String,
	pub created_at: u64,
	pub last_used_at: Option<u64>,
}

pub struct SecureKeyVault<S: KvStore + ?Sized> {
	key_store: KeyStore<S>,
	device_binding: Arc<DeviceBinding<S>>,
	clock: Arc<dyn Clock>,
}

impl<S: KvStore + ?Sized> SecureKeyVault<S> {
	pub fn new(store: Arc<S>, device_binding: Arc<DeviceBinding<S>>, clock: Arc<dyn Clock>) -> Self {
		SecureKeyVault {
			key_store: KeyStore::new(store),
			device_binding,
			clock,
		}
	}

	/// Encrypts `api_key` under `password` (combined with the device secret)
	/// and stores it, overwriting any existing record for `provider`.
	pub async fn save_key(&self, provider: &str, api_key: &str, password: &[u8]) -> Result<(), VaultError> {
		let compound = self.device_binding.compound_password(password).await?;
		let envelope = vaultcrypto::encrypt(api_key.as_bytes(), &compound.0)?;

		self.key_store
			.put(
				provider,
				StoredKeyRecord {
					envelope,
					created_at: self.clock.now_ms(),
					last_used_at: None,
				},
			)
			.await
	}

	/// Decrypts and returns the stored key for `provider`, or
	/// [`VaultError::DecryptionError`] if `password` is wrong, or
	/// [`VaultError::KeyNotFound`] if nothing is stored for `provider`.
	///
	/// Every code path through this function waits out
	/// [`GET_KEY_TIMING_FLOOR`] before returning.
	pub async fn get_key(&self, provider: &str, password: &[u8]) -> Result<Zeroizing<String>, VaultError> {
		let started = Instant::now();
		let result = self.get_key_inner(provider, password).await;

		let elapsed = started.elapsed();
		if elapsed < GET_KEY_TIMING_FLOOR {
			tokio::time::sleep(GET_KEY_TIMING_FLOOR - elapsed).await;
		}

		result
	}

	async fn get_key_inner(&self, provider: &str, password: &[u8]) -> Result<Zeroizing<String>, VaultError> {
		let record = self.key_store.get(provider).await?.ok_or(VaultError::KeyNotFound)?;
		let compound = self.device_binding.compound_password(password).await?;
		let plaintext = vaultcrypto::decrypt(&record.envelope, &compound.0)?;

		let as_string = String::from_utf8(plaintext).map_err(|_| VaultError::InvalidData)?;
		self.key_store.touch_last_used(provider, self.clock.now_ms()).await?;

		Ok(Zeroizing::new(as_string))
	}

	/// Re-seals an already-decrypted plaintext under a new password, keeping
	/// the existing record's `created_at`/`last_used_at` instead of
	/// resetting them the way [`Self::save_key`] would. Used when changing
	/// the vault password, where the underlying key hasn't actually changed.
	pub async fn reencrypt_key(&self, provider: &str, plaintext: &str, new_password: &[u8]) -> Result<(), VaultError> {
		let existing = self.key_store.get(provider).await?.ok_or(VaultError::KeyNotFound)?;
		let compound = self.device_binding.compound_password(new_password).await?;
		let envelope = vaultcrypto::encrypt(plaintext.as_bytes(), &compound.0)?;

		self.key_store
			.put(
				provider,
				StoredKeyRecord {
					envelope,
					created_at: existing.created_at,
					last_used_at: existing.last_used_at,
				},
			)
			.await
	}

	pub async fn remove_key(&self, provider: &str) -> Result<(), VaultError> {
		self.key_store.remove(provider).await
	}

	pub async fn has_key(&self, provider: &str) -> Result<bool, VaultError> {
		self.key_store.contains(provider).await
	}

	pub async fn get_metadata(&self, provider: &str) -> Result<Option<KeyMetadata>, VaultError> {
		Ok(self.key_store.get(provider).await?.map(|record| KeyMetadata {
			provider: provider.to_string(),
			created_at: record.created_at,
			last_used_at: record.last_used_at,
		}))
	}

	/// Metadata for every stored provider, sorted by provider name for a
	/// stable listing.
	pub async fn list_providers(&self) -> Result<Vec<KeyMetadata>, VaultError> {
		let mut records: Vec<_> = self
			.key_store
			.all()
			.await?
			.into_iter()
			.map(|(provider, record)| KeyMetadata {
				provider,
				created_at: record.created_at,
				last_used_at: record.last_used_at,
			})
			.collect();
		records.sort_by(|a, b| a.provider.cmp(&b.provider));
		Ok(records)
	}
}
