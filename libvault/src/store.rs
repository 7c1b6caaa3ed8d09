//! Abstract key-value store the host provides in two flavors: a durable
//! namespace that survives process restarts, and an ephemeral namespace that
//! survives only the current session. Neither namespace is trusted to be
//! perfectly isolated from other contexts in the host process — that's why
//! the session cache layers its own encryption on top (§4.6).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::VaultError;

/// A host-provided key-value namespace.
///
/// `subscribe` mirrors the host's `on_change` listener: every successful
/// `set`/`remove` broadcasts the affected key so callers (e.g. the session
/// cache's settings memo) can invalidate cached reads.
#[async_trait]
pub trait KvStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<Value>, VaultError>;
	async fn set(&self, key: &str, value: Value) -> Result<(), VaultError>;
	async fn remove(&self, key: &str) -> Result<(), VaultError>;
	fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// The ephemeral namespace additionally exposes a best-effort access-control
/// setter. A defensive secondary encryption layer exists precisely because
/// this isolation cannot be fully trusted (§4.2, §4.6).
pub trait EphemeralStore: KvStore {
	fn set_access_level(&self, trusted_contexts_only: bool);
}

/// In-memory [`KvStore`], used by tests and as the reference implementation
/// when no real host store is available.
pub struct InMemoryStore {
	data: Mutex<HashMap<String, Value>>,
	changes: broadcast::Sender<String>,
	trusted_only: Mutex<bool>,
}

impl Default for InMemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryStore {
	pub fn new() -> Self {
		let (changes, _) = broadcast::channel(64);
		InMemoryStore {
			data: Mutex::new(HashMap::new()),
			changes,
			trusted_only: Mutex::new(false),
		}
	}

	/// Whether [`EphemeralStore::set_access_level`] was last called with
	/// `true`. Exposed for tests asserting the session cache sets this on
	/// initialize.
	pub fn is_trusted_contexts_only(&self) -> bool {
		*self.trusted_only.lock().expect("store lock poisoned")
	}
}

#[async_trait]
impl KvStore for InMemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Value>, VaultError> {
		Ok(self.data.lock().expect("store lock poisoned").get(key).cloned())
	}

	async fn set(&self, key: &str, value: Value) -> Result<(), VaultError> {
		self.data.lock().expect("store lock poisoned").insert(key.to_string(), value);
		let _ = self.changes.send(key.to_string());
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<(), VaultError> {
		self.data.lock().expect("store lock poisoned").remove(key);
		let _ = self.changes.send(key.to_string());
		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<String> {
		self.changes.subscribe()
	}
}

impl EphemeralStore for InMemoryStore {
	fn set_access_level(&self, trusted_contexts_only: bool) {
		*self.trusted_only.lock().expect("store lock poisoned") = trusted_contexts_only;
	}
}
