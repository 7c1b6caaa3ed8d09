//! Durable, provider-keyed table of encrypted API key envelopes.
//!
//! Serialized as a `BTreeMap` rather than the `HashMap` it's queried through
//! at runtime, so two stores holding the same keys always serialize to the
//! same bytes — the same trick `libfortress`'s `DatabaseObjectMap` uses to
//! keep its on-disk format byte-stable regardless of insertion order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::errors::VaultError;
use crate::store::KvStore;

/// Exact storage key, part of the host's compatibility contract (§6).
const KEY_STORE_KEY: &str = "secure_api_keys_v2";
const SCHEMA_VERSION: u32 = 2;

/// One provider's encrypted API key plus the metadata `list_providers`
/// reports without ever touching the plaintext (§4.9).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredKeyRecord {
	#[serde(rename = "encryptedKey")]
	pub envelope: String,
	pub provider: String,
	#[serde(rename = "createdAt")]
	pub created_at: Millis,
	#[serde(rename = "lastUsed", skip_serializing_if = "Option::is_none")]
	pub last_used_at: Option<Millis>,
}

#[derive(Serialize, Deserialize)]
struct OnDisk {
	version: u32,
	keys: BTreeMap<String, StoredKeyRecord>,
}

impl Default for OnDisk {
	fn default() -> Self {
		OnDisk {
			version: SCHEMA_VERSION,
			keys: BTreeMap::new(),
		}
	}
}

/// Loads the whole table into memory, mutates it, and writes it back whole on
/// every change. Simple and correct at the scale this vault operates at: one
/// record per configured provider, not one per API call.
pub struct KeyStore<S: KvStore + ?Sized> {
	store: Arc<S>,
}

impl<S: KvStore + ?Sized> KeyStore<S> {
	pub fn new(store: Arc<S>) -> Self {
		KeyStore { store }
	}

	async fn load(&self) -> Result<OnDisk, VaultError> {
		match self.store.get(KEY_STORE_KEY).await? {
			Some(value) => {
				let mut on_disk: OnDisk = serde_json::from_value(value)?;
				// The only migration path the schema currently has: re-stamp
				// the version. Re-encrypting under newer parameters requires
				// the user password and is deferred to the next save (§4.4).
				if on_disk.version < SCHEMA_VERSION {
					on_disk.version = SCHEMA_VERSION;
				}
				Ok(on_disk)
			}
			None => Ok(OnDisk::default()),
		}
	}

	async fn save(&self, on_disk: &OnDisk) -> Result<(), VaultError> {
		let value = serde_json::to_value(on_disk)?;
		self.store.set(KEY_STORE_KEY, value).await
	}

	pub async fn get(&self, provider: &str) -> Result<Option<StoredKeyRecord>, VaultError> {
		Ok(self.load().await?.keys.get(provider).cloned())
	}

	pub async fn contains(&self, provider: &str) -> Result<bool, VaultError> {
		Ok(self.load().await?.keys.contains_key(provider))
	}

	pub async fn put(&self, provider: &str, mut record: StoredKeyRecord) -> Result<(), VaultError> {
		record.provider = provider.to_string();
		let mut on_disk = self.load().await?;
		on_disk.keys.insert(provider.to_string(), record);
		self.save(&on_disk).await
	}

	pub async fn remove(&self, provider: &str) -> Result<(), VaultError> {
		let mut on_disk = self.load().await?;
		on_disk.keys.remove(provider);
		self.save(&on_disk).await
	}

	pub async fn touch_last_used(&self, provider: &str, at: Millis) -> Result<(), VaultError> {
		let mut on_disk = self.load().await?;
		if let Some(record) = on_disk.keys.get_mut(provider) {
			record.last_used_at = Some(at);
			self.save(&on_disk).await?;
		}
		Ok(())
	}

	/// All providers with a stored record, as an unordered map — callers that
	/// need stable ordering should sort themselves.
	pub async fn all(&self) -> Result<HashMap<String, StoredKeyRecord>, VaultError> {
		Ok(self.load().await?.keys.into_iter().collect())
	}

	/// True if the store has never been written to at all (as opposed to
	/// having been written and then emptied). Used by the revocation detector
	/// to decide whether an empty key list is "nothing saved yet" or
	/// something worth double-checking.
	pub async fn exists(&self) -> Result<bool, VaultError> {
		Ok(self.store.get(KEY_STORE_KEY).await?.is_some())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::InMemoryStore;

	fn record(envelope: &str) -> StoredKeyRecord {
		StoredKeyRecord {
			envelope: envelope.to_string(),
			provider: String::new(),
			created_at: 1_000,
			last_used_at: None,
		}
	}

	#[tokio::test]
	async fn put_then_get() {
		let store = KeyStore::new(Arc::new(InMemoryStore::new()));
		store.put("openai", record("envelope-a")).await.unwrap();
		let got = store.get("openai").await.unwrap().unwrap();
		assert_eq!(got.envelope, "envelope-a");
		assert_eq!(got.provider, "openai");
	}

	#[tokio::test]
	async fn remove_deletes_the_record() {
		let store = KeyStore::new(Arc::new(InMemoryStore::new()));
		store.put("openai", record("envelope-a")).await.unwrap();
		store.remove("openai").await.unwrap();
		assert!(store.get("openai").await.unwrap().is_none());
		assert!(!store.contains("openai").await.unwrap());
	}

	#[tokio::test]
	async fn touch_last_used_updates_only_that_field() {
		let store = KeyStore::new(Arc::new(InMemoryStore::new()));
		store.put("openai", record("envelope-a")).await.unwrap();
		store.touch_last_used("openai", 2_000).await.unwrap();

		let got = store.get("openai").await.unwrap().unwrap();
		assert_eq!(got.envelope, "envelope-a");
		assert_eq!(got.last_used_at, Some(2_000));
	}

	#[tokio::test]
	async fn put_overwrites_existing_record_for_same_provider() {
		let store = KeyStore::new(Arc::new(InMemoryStore::new()));
		store.put("openai", record("envelope-a")).await.unwrap();
		store.put("openai", record("envelope-b")).await.unwrap();

		let all = store.all().await.unwrap();
		assert_eq!(all.len(), 1);
		assert_eq!(all["openai"].envelope, "envelope-b");
	}

	#[tokio::test]
	async fn exists_reflects_whether_anything_was_ever_written() {
		let store = KeyStore::new(Arc::new(InMemoryStore::new()));
		assert!(!store.exists().await.unwrap());
		store.put("openai", record("envelope-a")).await.unwrap();
		assert!(store.exists().await.unwrap());
		store.remove("openai").await.unwrap();
		assert!(store.exists().await.unwrap());
	}
}
