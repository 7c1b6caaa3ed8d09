//! HKDF-SHA256 (RFC 5869), used to bind keys to an installation and to
//! combine a user password with a device secret without ever storing either
//! on disk.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

/// Extract-then-expand HKDF-SHA256. Deterministic in all four inputs: the
/// same `(input, salt, info, length_bits)` always yields the same output,
/// and changing any one of them changes the output.
pub fn derive_hkdf(input: &[u8], salt: &[u8], info: &[u8], length_bits: usize) -> Result<String, CryptoError> {
	Ok(BASE64.encode(derive_hkdf_bytes(input, salt, info, length_bits)?))
}

/// Same derivation as [`derive_hkdf`] but returns raw bytes instead of
/// base64, for callers that want to build a key directly rather than
/// round-trip through a string.
pub fn derive_hkdf_bytes(input: &[u8], salt: &[u8], info: &[u8], length_bits: usize) -> Result<Vec<u8>, CryptoError> {
	if length_bits % 8 != 0 {
		return Err(CryptoError::KeyDerivationFailed);
	}
	let length_bytes = length_bits / 8;

	let hk = Hkdf::<Sha256>::new(Some(salt), input);
	let mut okm = vec![0u8; length_bytes];
	hk.expand(info, &mut okm).map_err(|_| CryptoError::KeyDerivationFailed)?;

	Ok(okm)
}
