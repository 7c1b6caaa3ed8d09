//! Self-describing AES-256-GCM envelopes, password-keyed via PBKDF2-HMAC-SHA256.
//!
//! Layout (before base64): `salt(32) || iv(12) || ciphertext||tag(16)`. The
//! salt and IV travel with the ciphertext, so a single envelope is portable
//! independent of whatever store format wraps it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

const SALT_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENVELOPE_LEN: usize = SALT_LEN + IV_LEN + TAG_LEN;

/// PBKDF2-HMAC-SHA256 iteration count. Fixed, not caller-configurable: this
/// is the primary deterrent against offline dictionary attacks on a stolen
/// key store, so every envelope in the vault pays the same cost.
pub const PBKDF2_ITERATIONS: u32 = 800_000;

/// Encrypts `plaintext` under `password`, returning a base64 envelope.
///
/// Generates a fresh 32-byte salt and 12-byte IV on every call, so calling
/// this twice with the same inputs yields two different envelopes.
pub fn encrypt(plaintext: &[u8], password: &[u8]) -> Result<String, CryptoError> {
	let mut salt = [0u8; SALT_LEN];
	OsRng.fill_bytes(&mut salt);
	let mut iv = [0u8; IV_LEN];
	OsRng.fill_bytes(&mut iv);

	let mut key_bytes = derive_pbkdf2_key(password, &salt);
	let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CryptoError::KeyDerivationFailed)?;
	let nonce = Nonce::from_slice(&iv);
	let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| CryptoError::EncryptionFailed)?;
	key_bytes.zeroize();

	let mut raw = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
	raw.extend_from_slice(&salt);
	raw.extend_from_slice(&iv);
	raw.extend_from_slice(&ciphertext);

	Ok(BASE64.encode(raw))
}

/// Inverts [`encrypt`]. Fails with [`CryptoError::InvalidData`] if the
/// envelope is too short to ever have been valid, before any key derivation
/// is attempted; otherwise fails with the generic
/// [`CryptoError::DecryptionFailed`], regardless of whether the cause was a
/// MAC mismatch (wrong password) or structural corruption.
pub fn decrypt(envelope: &str, password: &[u8]) -> Result<Vec<u8>, CryptoError> {
	let raw = BASE64.decode(envelope).map_err(|_| CryptoError::InvalidData)?;

	if raw.len() < MIN_ENVELOPE_LEN {
		return Err(CryptoError::InvalidData);
	}

	let (salt, rest) = raw.split_at(SALT_LEN);
	let (iv, ciphertext) = rest.split_at(IV_LEN);

	let mut key_bytes = derive_pbkdf2_key(password, salt);
	let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CryptoError::DecryptionFailed)?;
	let nonce = Nonce::from_slice(iv);
	let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;
	key_bytes.zeroize();

	Ok(plaintext)
}

fn derive_pbkdf2_key(password: &[u8], salt: &[u8]) -> [u8; 32] {
	let mut key = [0u8; 32];
	pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut key);
	key
}

/// Seals `plaintext` directly under a caller-supplied 256-bit key, with no
/// password KDF. Layout: `iv(12) || ciphertext||tag(16)`, base64-encoded.
///
/// Used where the key is already a strong random secret (a session key) and
/// running it through PBKDF2 again would only add latency, not security.
pub fn seal(plaintext: &[u8], key: &[u8]) -> Result<String, CryptoError> {
	let mut iv = [0u8; IV_LEN];
	OsRng.fill_bytes(&mut iv);

	let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyDerivationFailed)?;
	let nonce = Nonce::from_slice(&iv);
	let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| CryptoError::EncryptionFailed)?;

	let mut raw = Vec::with_capacity(IV_LEN + ciphertext.len());
	raw.extend_from_slice(&iv);
	raw.extend_from_slice(&ciphertext);

	Ok(BASE64.encode(raw))
}

/// Inverts [`seal`].
pub fn unseal(envelope: &str, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
	let raw = BASE64.decode(envelope).map_err(|_| CryptoError::InvalidData)?;
	if raw.len() < IV_LEN + TAG_LEN {
		return Err(CryptoError::InvalidData);
	}

	let (iv, ciphertext) = raw.split_at(IV_LEN);
	let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
	let nonce = Nonce::from_slice(iv);
	cipher.decrypt(nonce, ciphertext).map_err(|_| CryptoError::DecryptionFailed)
}
