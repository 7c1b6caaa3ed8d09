use thiserror::Error;

/// Failure kinds surfaced by [`crate`]'s primitives.
///
/// Deliberately coarse: `Decrypt` must never let a caller distinguish a wrong
/// password from tampered ciphertext.
#[derive(Error, Debug)]
pub enum CryptoError {
	#[error("key derivation failed")]
	KeyDerivationFailed,

	#[error("encryption failed")]
	EncryptionFailed,

	/// MAC mismatch or any other AEAD failure. Does not distinguish "wrong
	/// password" from "tampered ciphertext" — see spec §4.1.
	#[error("decryption failed")]
	DecryptionFailed,

	/// The envelope was shorter than `salt + iv + tag` before any key
	/// derivation was attempted.
	#[error("invalid data")]
	InvalidData,
}
