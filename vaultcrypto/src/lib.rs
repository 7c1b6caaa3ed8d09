//! Cryptography helper library for the local secrets vault.
//!
//! This crate has no notion of providers, sessions, or passwords policy — it
//! only composes standard primitives with the specific parameters the vault
//! requires: AES-256-GCM for authenticated encryption, PBKDF2-HMAC-SHA256 for
//! password-based key derivation, HKDF-SHA256 for deterministic key binding,
//! and a CSPRNG for salts, IVs, and device/session keys.
#![forbid(unsafe_code)]

#[macro_use]
mod newtype_macros;
mod envelope;
mod error;
mod hkdf;
mod rng;

pub use envelope::{decrypt, encrypt, seal, unseal, PBKDF2_ITERATIONS};
pub use error::CryptoError;
pub use hkdf::{derive_hkdf, derive_hkdf_bytes};
pub use rng::{random_bytes, random_hex};

secret_bytes!(
	/// A 32-byte secret key: a device secret, a session key, or similar.
	/// Zeroized on drop; compares in constant time.
	Key(32)
);

secret_bytes!(
	/// A 64-byte secret: the compound password fed into PBKDF2.
	CompoundPassword(64)
);
