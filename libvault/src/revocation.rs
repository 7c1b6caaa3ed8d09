//! Detects stored keys that outlived the device binding they were encrypted
//! under — the signature of a reinstall that restored the durable key store
//! from a backup without restoring the device salt alongside it. Those
//! records can never decrypt again: the next `device_secret()` call mints a
//! fresh salt, and the compound password it produces won't match the one the
//! orphaned envelopes were sealed with.

use std::sync::Arc;

use tracing::warn;

use crate::device_binding::DeviceBinding;
use crate::errors::VaultError;
use crate::key_store::KeyStore;
use crate::store::KvStore;

/// Result of a scan for orphaned provider records (§4.8).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrphanReport {
	pub has_orphans: bool,
	pub providers: Vec<String>,
	pub human_message: Option<String>,
}

impl OrphanReport {
	fn none() -> Self {
		OrphanReport {
			has_orphans: false,
			providers: Vec::new(),
			human_message: None,
		}
	}

	fn found(mut providers: Vec<String>) -> Self {
		providers.sort();
		let human_message = Some(format!(
			"{count} stored key{plural} can no longer be decrypted on this device and must be re-entered.",
			count = providers.len(),
			plural = if providers.len() == 1 { "" } else { "s" }
		));
		OrphanReport {
			has_orphans: !providers.is_empty(),
			providers,
			human_message,
		}
	}
}

pub struct RevocationDetector<S: KvStore + ?Sized> {
	key_store: Arc<KeyStore<S>>,
	device_binding: Arc<DeviceBinding<S>>,
}

impl<S: KvStore + ?Sized> RevocationDetector<S> {
	pub fn new(key_store: Arc<KeyStore<S>>, device_binding: Arc<DeviceBinding<S>>) -> Self {
		RevocationDetector { key_store, device_binding }
	}

	/// Scans for orphaned providers: records exist in the key store, but no
	/// device salt has ever been bound in this installation. Calling this
	/// does not itself generate a salt — only [`DeviceBinding::device_secret`]
	/// does that. A storage fault degrades silently to "no orphans" rather
	/// than surfacing an error (§4.8) — this check runs opportunistically and
	/// must never be the reason a caller sees a hard failure.
	pub async fn check_for_orphaned_keys(&self) -> OrphanReport {
		let is_bound = match self.device_binding.is_bound().await {
			Ok(bound) => bound,
			Err(err) => {
				warn!(error = %err, "orphan check could not read device binding, assuming none");
				return OrphanReport::none();
			}
		};
		if is_bound {
			return OrphanReport::none();
		}

		match self.key_store.all().await {
			Ok(keys) => OrphanReport::found(keys.into_keys().collect()),
			Err(err) => {
				warn!(error = %err, "orphan check could not read key store, assuming none");
				OrphanReport::none()
			}
		}
	}

	/// Removes every orphaned provider's record from the key store. Safe to
	/// call unconditionally; a no-op if nothing is orphaned. Unlike the scan
	/// itself, an actual removal failure is propagated — the caller asked for
	/// cleanup to happen, and silently pretending it did would leave
	/// unrecoverable ciphertext lying around with no record of the attempt.
	pub async fn cleanup_orphaned_keys(&self) -> Result<Vec<String>, VaultError> {
		let report = self.check_for_orphaned_keys().await;
		for provider in &report.providers {
			self.key_store.remove(provider).await?;
		}
		if !report.providers.is_empty() {
			warn!(count = report.providers.len(), "removed orphaned provider keys with no matching device binding");
		}
		Ok(report.providers)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::key_store::StoredKeyRecord;
	use crate::store::InMemoryStore;

	fn record() -> StoredKeyRecord {
		StoredKeyRecord {
			envelope: "envelope".to_string(),
			provider: String::new(),
			created_at: 0,
			last_used_at: None,
		}
	}

	#[tokio::test]
	async fn no_orphans_when_device_is_bound() {
		let store = Arc::new(InMemoryStore::new());
		let key_store = Arc::new(KeyStore::new(store.clone()));
		let device_binding = Arc::new(DeviceBinding::new(store, "install-123"));

		key_store.put("openai", record()).await.unwrap();
		device_binding.device_secret().await.unwrap();

		let detector = RevocationDetector::new(key_store, device_binding);
		let report = detector.check_for_orphaned_keys().await;
		assert!(!report.has_orphans);
		assert!(report.providers.is_empty());
		assert!(report.human_message.is_none());
	}

	#[tokio::test]
	async fn keys_are_orphaned_when_device_salt_is_missing() {
		let store = Arc::new(InMemoryStore::new());
		let key_store = Arc::new(KeyStore::new(store.clone()));
		let device_binding = Arc::new(DeviceBinding::new(store, "install-123"));

		key_store.put("openai", record()).await.unwrap();
		key_store.put("anthropic", record()).await.unwrap();

		let detector = RevocationDetector::new(key_store, device_binding);
		let report = detector.check_for_orphaned_keys().await;
		assert!(report.has_orphans);
		assert_eq!(report.providers, vec!["anthropic".to_string(), "openai".to_string()]);
		assert!(report.human_message.unwrap().contains("2 stored keys"));
	}

	#[tokio::test]
	async fn single_orphan_uses_singular_wording() {
		let store = Arc::new(InMemoryStore::new());
		let key_store = Arc::new(KeyStore::new(store.clone()));
		let device_binding = Arc::new(DeviceBinding::new(store, "install-123"));

		key_store.put("openai", record()).await.unwrap();

		let detector = RevocationDetector::new(key_store, device_binding);
		let report = detector.check_for_orphaned_keys().await;
		assert!(report.human_message.unwrap().contains("1 stored key "));
	}

	#[tokio::test]
	async fn cleanup_removes_orphaned_records() {
		let store = Arc::new(InMemoryStore::new());
		let key_store = Arc::new(KeyStore::new(store.clone()));
		let device_binding = Arc::new(DeviceBinding::new(store, "install-123"));

		key_store.put("openai", record()).await.unwrap();

		let detector = RevocationDetector::new(key_store.clone(), device_binding);
		let removed = detector.cleanup_orphaned_keys().await.unwrap();

		assert_eq!(removed, vec!["openai".to_string()]);
		assert!(!key_store.contains("openai").await.unwrap());
	}

	#[tokio::test]
	async fn cleanup_is_a_no_op_with_nothing_stored() {
		let store = Arc::new(InMemoryStore::new());
		let key_store = Arc::new(KeyStore::new(store.clone()));
		let device_binding = Arc::new(DeviceBinding::new(store, "install-123"));

		let detector = RevocationDetector::new(key_store, device_binding);
		assert!(detector.cleanup_orphaned_keys().await.unwrap().is_empty());
	}
}
