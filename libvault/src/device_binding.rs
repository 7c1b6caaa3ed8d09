//! Binds the vault's encryption to the current device, so a copy of the
//! durable store alone — without the installation-specific salt that lives
//! alongside it — is not enough to derive the keys that protect it.
//!
//! `device_secret = HKDF(installation_id, device_salt, "device-binding-v2", 256 bits)`
//! `compound_password = HKDF(user_password, device_secret, "compound-password-v2", 512 bits)`
//!
//! The device salt is the only one of these persisted; `device_secret` and
//! `compound_password` are re-derived on demand and held only in memory,
//! zeroized on drop.

use std::sync::Arc;

use tokio::sync::Mutex;

use vaultcrypto::{derive_hkdf_bytes, CompoundPassword, Key};

use crate::errors::VaultError;
use crate::store::KvStore;

/// Exact storage key, part of the host's compatibility contract (§6).
const DEVICE_SALT_KEY: &str = "device_binding_salt";
const DEVICE_BINDING_INFO: &[u8] = b"device-binding-v2";
const COMPOUND_PASSWORD_INFO: &[u8] = b"compound-password-v2";

pub struct DeviceBinding<S: KvStore + ?Sized> {
	store: Arc<S>,
	installation_id: String,
	cached_secret: Mutex<Option<Key>>,
}

impl<S: KvStore + ?Sized> DeviceBinding<S> {
	pub fn new(store: Arc<S>, installation_id: impl Into<String>) -> Self {
		DeviceBinding {
			store,
			installation_id: installation_id.into(),
			cached_secret: Mutex::new(None),
		}
	}

	/// Reads the persisted device salt, generating and persisting one on
	/// first use. Idempotent across calls once a salt exists.
	async fn device_salt(&self) -> Result<Vec<u8>, VaultError> {
		if let Some(existing) = self.store.get(DEVICE_SALT_KEY).await? {
			let encoded = existing.as_str().ok_or_else(|| VaultError::StorageError("device salt was not a string".into()))?;
			return data_encoding::BASE64.decode(encoded.as_bytes()).map_err(|_| VaultError::InvalidData);
		}

		let salt = vaultcrypto::random_bytes(32);
		let encoded = data_encoding::BASE64.encode(&salt);
		self.store.set(DEVICE_SALT_KEY, serde_json::Value::String(encoded)).await?;
		Ok(salt)
	}

	/// The device secret, derived once per process and cached in memory
	/// thereafter. Re-deriving is cheap, but caching avoids paying for it on
	/// every `get_key` call.
	pub async fn device_secret(&self) -> Result<Key, VaultError> {
		{
			let cached = self.cached_secret.lock().await;
			if let Some(key) = cached.as_ref() {
				return Ok(key.clone());
			}
		}

		let salt = self.device_salt().await?;
		let bytes = derive_hkdf_bytes(self.installation_id.as_bytes(), &salt, DEVICE_BINDING_INFO, 256)?;
		let key = Key::from_slice(&bytes).ok_or(VaultError::EncryptionError)?;

		*self.cached_secret.lock().await = Some(key.clone());
		Ok(key)
	}

	/// Combines `password` with the device secret into the 512-bit compound
	/// password actually fed to the key vault's PBKDF2 envelope.
	pub async fn compound_password(&self, password: &[u8]) -> Result<CompoundPassword, VaultError> {
		let device_secret = self.device_secret().await?;
		let bytes = derive_hkdf_bytes(password, &device_secret.0, COMPOUND_PASSWORD_INFO, 512)?;
		CompoundPassword::from_slice(&bytes).ok_or(VaultError::EncryptionError)
	}

	/// True once a device salt has been persisted. Used by the revocation
	/// detector to distinguish "freshly installed, never bound" from
	/// "reinstalled, salt lost" (§4.8).
	pub async fn is_bound(&self) -> Result<bool, VaultError> {
		Ok(self.store.get(DEVICE_SALT_KEY).await?.is_some())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::InMemoryStore;

	#[tokio::test]
	async fn device_secret_is_stable_across_calls() {
		let binding = DeviceBinding::new(Arc::new(InMemoryStore::new()), "install-123");
		let a = binding.device_secret().await.unwrap();
		let b = binding.device_secret().await.unwrap();
		assert_eq!(a, b);
	}

	#[tokio::test]
	async fn different_installations_derive_different_secrets() {
		let store_a = Arc::new(InMemoryStore::new());
		let store_b = Arc::new(InMemoryStore::new());
		let a = DeviceBinding::new(store_a, "install-a").device_secret().await.unwrap();
		let b = DeviceBinding::new(store_b, "install-b").device_secret().await.unwrap();
		assert_ne!(a, b);
	}

	#[tokio::test]
	async fn compound_password_binds_password_and_device() {
		let binding = DeviceBinding::new(Arc::new(InMemoryStore::new()), "install-123");
		let a = binding.compound_password(b"hunter2").await.unwrap();
		let b = binding.compound_password(b"hunter3").await.unwrap();
		assert_ne!(a, b);
	}

	#[tokio::test]
	async fn is_bound_reflects_salt_persistence() {
		let binding = DeviceBinding::new(Arc::new(InMemoryStore::new()), "install-123");
		assert!(!binding.is_bound().await.unwrap());
		binding.device_secret().await.unwrap();
		assert!(binding.is_bound().await.unwrap());
	}
}
