//! Local secrets vault for third-party API credentials.
//!
//! A durable, password-protected table of per-provider API keys, bound to
//! the installation that created it, with a short-lived in-memory session
//! cache so a caller doesn't have to re-enter the password on every read.
//! See [`coordinator::Coordinator`] for the operations most callers need;
//! the individual pieces it orchestrates — [`vault::SecureKeyVault`],
//! [`rate_limiter::RateLimiter`], [`session_cache::SessionCache`] — are
//! public for callers that need finer control.
#![forbid(unsafe_code)]

pub mod alarms;
pub mod clock;
pub mod coordinator;
pub mod device_binding;
pub mod errors;
pub mod format;
pub mod key_store;
pub mod rate_limiter;
pub mod revocation;
pub mod session_cache;
pub mod session_settings;
pub mod store;
pub mod vault;

use std::sync::Arc;

use alarms::Alarms;
use clock::{Clock, SystemClock};
use coordinator::{Coordinator, EventSink, NoopEventSink};
use store::EphemeralStore;

/// Owns every host handle the vault needs and wires them into a
/// [`Coordinator`]. Constructing one of these is the only place in the crate
/// that reaches for global state — everything downstream is passed an
/// explicit handle, not a singleton.
pub struct VaultCore<D, E, A>
where
	D: store::KvStore + ?Sized,
	E: EphemeralStore + ?Sized,
	A: Alarms + ?Sized,
{
	pub coordinator: Coordinator<D, E, A>,
}

impl<D, E, A> VaultCore<D, E, A>
where
	D: store::KvStore + ?Sized,
	E: EphemeralStore + ?Sized,
	A: Alarms + ?Sized,
{
	pub fn new(durable: Arc<D>, ephemeral: Arc<E>, alarms: Arc<A>, installation_id: impl Into<String>) -> Self {
		Self::with_clock_and_sink(durable, ephemeral, alarms, Arc::new(SystemClock), installation_id, Arc::new(NoopEventSink))
	}

	pub fn with_clock_and_sink(
		durable: Arc<D>,
		ephemeral: Arc<E>,
		alarms: Arc<A>,
		clock: Arc<dyn Clock>,
		installation_id: impl Into<String>,
		event_sink: Arc<dyn EventSink>,
	) -> Self {
		VaultCore {
			coordinator: Coordinator::new(durable, ephemeral, alarms, clock, installation_id, event_sink),
		}
	}
}
