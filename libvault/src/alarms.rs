//! Delayed, named, idempotent callbacks — the host's alarm facility, used by
//! the session cache to lock after a period of inactivity (§4.6) without
//! keeping a timer thread of its own alive.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::Millis;
use crate::errors::VaultError;

/// A callback registered against an alarm name, run when the host's
/// scheduler dispatches it (§6 `on_alarm(name, handler)`).
pub type AlarmHandler = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[async_trait]
pub trait Alarms: Send + Sync {
	/// Schedules `name` to fire `delay_ms` from now, replacing any existing
	/// alarm of the same name.
	async fn create(&self, name: &str, delay_ms: Millis) -> Result<(), VaultError>;

	/// Cancels a previously scheduled alarm. A no-op if none exists.
	async fn clear(&self, name: &str) -> Result<(), VaultError>;

	/// The alarm's fire time, if it's still pending.
	async fn scheduled_at(&self, name: &str) -> Result<Option<Millis>, VaultError>;

	/// Registers `handler` to run when the host fires `name`, replacing any
	/// handler previously registered under that name.
	async fn on_alarm(&self, name: &str, handler: AlarmHandler) -> Result<(), VaultError>;
}

/// In-memory [`Alarms`] for tests: records fire times against a [`Clock`]
/// rather than real time, so tests can assert "the inactivity alarm is N ms
/// out" without ever sleeping.
///
/// [`Clock`]: crate::clock::Clock
pub struct InMemoryAlarms {
	pending: Mutex<HashMap<String, Millis>>,
	handlers: Mutex<HashMap<String, AlarmHandler>>,
	clock: Arc<dyn crate::clock::Clock>,
}

impl InMemoryAlarms {
	pub fn new(clock: Arc<dyn crate::clock::Clock>) -> Self {
		InMemoryAlarms {
			pending: Mutex::new(HashMap::new()),
			handlers: Mutex::new(HashMap::new()),
			clock,
		}
	}

	/// Alarms whose fire time has already passed, per the injected clock.
	pub fn due(&self) -> Vec<String> {
		let now = self.clock.now_ms();
		self.pending
			.lock()
			.expect("alarms lock poisoned")
			.iter()
			.filter(|(_, &at)| at <= now)
			.map(|(name, _)| name.clone())
			.collect()
	}

	/// Plays the host's scheduler: every alarm whose fire time has passed is
	/// removed (alarms are one-shot) and its registered handler, if any, is
	/// awaited. A real host calls the registered handler itself the moment
	/// its own timer elapses; tests call this after advancing the clock to
	/// observe that effect deterministically instead of sleeping for real.
	pub async fn fire_due(&self) {
		for name in self.due() {
			self.pending.lock().expect("alarms lock poisoned").remove(&name);
			let handler = self.handlers.lock().expect("alarms lock poisoned").get(&name).cloned();
			if let Some(handler) = handler {
				handler().await;
			}
		}
	}
}

#[async_trait]
impl Alarms for InMemoryAlarms {
	async fn create(&self, name: &str, delay_ms: Millis) -> Result<(), VaultError> {
		let fire_at = self.clock.now_ms() + delay_ms;
		self.pending.lock().expect("alarms lock poisoned").insert(name.to_string(), fire_at);
		Ok(())
	}

	async fn clear(&self, name: &str) -> Result<(), VaultError> {
		self.pending.lock().expect("alarms lock poisoned").remove(name);
		Ok(())
	}

	async fn scheduled_at(&self, name: &str) -> Result<Option<Millis>, VaultError> {
		Ok(self.pending.lock().expect("alarms lock poisoned").get(name).copied())
	}

	async fn on_alarm(&self, name: &str, handler: AlarmHandler) -> Result<(), VaultError> {
		self.handlers.lock().expect("alarms lock poisoned").insert(name.to_string(), handler);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::FakeClock;
	use std::sync::Arc;

	#[tokio::test]
	async fn create_then_clear() {
		let clock = Arc::new(FakeClock::new(0));
		let alarms = InMemoryAlarms::new(clock.clone());

		alarms.create("lock-session", 1_000).await.unwrap();
		assert_eq!(alarms.scheduled_at("lock-session").await.unwrap(), Some(1_000));

		alarms.clear("lock-session").await.unwrap();
		assert_eq!(alarms.scheduled_at("lock-session").await.unwrap(), None);
	}

	#[tokio::test]
	async fn create_replaces_existing_alarm() {
		let clock = Arc::new(FakeClock::new(0));
		let alarms = InMemoryAlarms::new(clock.clone());

		alarms.create("lock-session", 1_000).await.unwrap();
		alarms.create("lock-session", 5_000).await.unwrap();
		assert_eq!(alarms.scheduled_at("lock-session").await.unwrap(), Some(5_000));
	}

	#[tokio::test]
	async fn due_reflects_clock_advance() {
		let clock = Arc::new(FakeClock::new(0));
		let alarms = InMemoryAlarms::new(clock.clone());
		alarms.create("lock-session", 1_000).await.unwrap();

		assert!(alarms.due().is_empty());
		clock.advance(1_000);
		assert_eq!(alarms.due(), vec!["lock-session".to_string()]);
	}

	#[tokio::test]
	async fn fire_due_invokes_the_registered_handler_and_consumes_the_alarm() {
		let clock = Arc::new(FakeClock::new(0));
		let alarms = InMemoryAlarms::new(clock.clone());
		let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));

		let fired_handle = fired.clone();
		let handler: AlarmHandler = Arc::new(move || {
			let fired_handle = fired_handle.clone();
			Box::pin(async move {
				fired_handle.store(true, std::sync::atomic::Ordering::SeqCst);
			})
		});
		alarms.on_alarm("lock-session", handler).await.unwrap();
		alarms.create("lock-session", 1_000).await.unwrap();

		alarms.fire_due().await;
		assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));

		clock.advance(1_000);
		alarms.fire_due().await;
		assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
		assert_eq!(alarms.scheduled_at("lock-session").await.unwrap(), None);
	}

	#[tokio::test]
	async fn fire_due_is_a_no_op_for_an_alarm_with_no_registered_handler() {
		let clock = Arc::new(FakeClock::new(0));
		let alarms = InMemoryAlarms::new(clock.clone());
		alarms.create("lock-session", 1_000).await.unwrap();

		clock.advance(1_000);
		alarms.fire_due().await;
		assert_eq!(alarms.scheduled_at("lock-session").await.unwrap(), None);
	}
}
