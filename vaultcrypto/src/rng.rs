//! CSPRNG helpers backed by the OS random source.

use data_encoding::HEXLOWER_PERMISSIVE;
use rand::rngs::OsRng;
use rand::RngCore;

/// Returns `n_bytes` of fresh randomness.
pub fn random_bytes(n_bytes: usize) -> Vec<u8> {
	let mut buf = vec![0u8; n_bytes];
	OsRng.fill_bytes(&mut buf);
	buf
}

/// Returns `n_bytes` of fresh randomness, lowercase-hex encoded.
pub fn random_hex(n_bytes: usize) -> String {
	HEXLOWER_PERMISSIVE.encode(&random_bytes(n_bytes))
}
