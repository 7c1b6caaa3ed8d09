//! Injectable time source.
//!
//! Everything that reasons about windows and expiry in business-logic terms
//! (rate-limit windows, session inactivity timers, lockout expiry) reads the
//! current time through this trait instead of `SystemTime::now()` directly,
//! so tests can advance time deterministically instead of sleeping for real.
//!
//! The one deliberate exception is the timing-attack floor in
//! `SecureKeyVault::get_key` (§4.3, §7), which measures real wall-clock
//! elapsed time with `std::time::Instant` — that defense only means anything
//! if it is the actual clock the CPU is running on.

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

pub trait Clock: Send + Sync {
	fn now_ms(&self) -> Millis;
}

/// Real time, backed by the system clock.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> Millis {
		std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.expect("system clock before epoch")
			.as_millis() as Millis
	}
}

/// A clock a test can advance by hand.
#[cfg(any(test, feature = "test-util"))]
pub struct FakeClock {
	now: std::sync::atomic::AtomicU64,
}

#[cfg(any(test, feature = "test-util"))]
impl FakeClock {
	pub fn new(start_ms: Millis) -> Self {
		FakeClock {
			now: std::sync::atomic::AtomicU64::new(start_ms),
		}
	}

	pub fn advance(&self, ms: Millis) {
		self.now.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
	}
}

#[cfg(any(test, feature = "test-util"))]
impl Clock for FakeClock {
	fn now_ms(&self) -> Millis {
		self.now.load(std::sync::atomic::Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fake_clock_advances_on_demand() {
		let clock = FakeClock::new(1_000);
		assert_eq!(clock.now_ms(), 1_000);
		clock.advance(500);
		assert_eq!(clock.now_ms(), 1_500);
	}

	#[test]
	fn system_clock_is_plausible() {
		let now = SystemClock.now_ms();
		assert!(now > 1_700_000_000_000);
	}
}
