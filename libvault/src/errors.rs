use thiserror::Error;
use vaultcrypto::CryptoError;

/// Errors surfaced by the lower layers: the persistent store adapter, device
/// binding, and the secure key vault. Never carries plaintext, passwords, or
/// derived keys.
#[derive(Error, Debug)]
pub enum VaultError {
	#[error("no stored key for this provider")]
	KeyNotFound,

	#[error("storage error: {0}")]
	StorageError(String),

	#[error("encryption error")]
	EncryptionError,

	/// Wrong password or tampered ciphertext. Deliberately indistinguishable,
	/// per spec §4.1 / §7.
	#[error("decryption error")]
	DecryptionError,

	#[error("invalid data")]
	InvalidData,
}

impl From<CryptoError> for VaultError {
	fn from(err: CryptoError) -> Self {
		match err {
			CryptoError::KeyDerivationFailed => VaultError::EncryptionError,
			CryptoError::EncryptionFailed => VaultError::EncryptionError,
			CryptoError::DecryptionFailed => VaultError::DecryptionError,
			CryptoError::InvalidData => VaultError::InvalidData,
		}
	}
}

impl From<serde_json::Error> for VaultError {
	fn from(err: serde_json::Error) -> Self {
		VaultError::StorageError(err.to_string())
	}
}

/// Public error taxonomy surfaced by the [`crate::coordinator::Coordinator`].
///
/// `decryption-error` from the lower layers is never surfaced directly: it is
/// mapped to [`CoordinatorError::WrongPassword`] only after the rate limiter
/// has recorded the failure (see spec §4.9, §7).
#[derive(Error, Debug)]
pub enum CoordinatorError {
	#[error("too many attempts, try again in {retry_after_ms}ms")]
	RateLimited { retry_after_ms: u64 },

	#[error("password does not meet strength requirements")]
	InvalidPassword { requirements: Vec<String> },

	#[error("invalid api key format: {hint}")]
	InvalidApiKey { hint: String },

	#[error("wrong password")]
	WrongPassword {
		attempts_remaining: Option<u32>,
		retry_after_ms: Option<u64>,
	},

	#[error("passwords do not match")]
	PasswordsMismatch,

	#[error("no stored key for this provider")]
	KeyNotFound,

	#[error("storage error: {0}")]
	StorageError(String),
}

impl From<VaultError> for CoordinatorError {
	fn from(err: VaultError) -> Self {
		match err {
			VaultError::KeyNotFound => CoordinatorError::KeyNotFound,
			VaultError::StorageError(msg) => CoordinatorError::StorageError(msg),
			VaultError::EncryptionError => CoordinatorError::StorageError("encryption error".into()),
			// Callers that need the rate-limited mapping must intercept
			// DecryptionError before it reaches this conversion.
			VaultError::DecryptionError => CoordinatorError::WrongPassword {
				attempts_remaining: None,
				retry_after_ms: None,
			},
			VaultError::InvalidData => CoordinatorError::StorageError("invalid data".into()),
		}
	}
}
