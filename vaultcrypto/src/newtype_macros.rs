// Adapted from libfortress's newtype_macros.rs (itself adapted from
// github.com/dnaq/sodiumoxide). Trimmed to the one shape this crate needs:
// fixed-size secret byte buffers that zeroize themselves on drop and compare
// in constant time, so a `Key == Key` comparison can never leak timing
// information about where two keys first differ.

/// Declares a fixed-size secret byte buffer newtype.
///
/// Generated type implements `Clone`, constant-time `Eq`, hex encode/decode,
/// and zeroizes its contents when dropped.
macro_rules! secret_bytes {
	($(#[$meta:meta])* $name:ident($len:expr)) => {
		$(#[$meta])*
		#[derive(Clone, ::zeroize::Zeroize, ::zeroize::ZeroizeOnDrop)]
		pub struct $name(pub [u8; $len]);

		impl $name {
			pub const LEN: usize = $len;

			/// Builds a buffer from an exact-length slice.
			pub fn from_slice(bs: &[u8]) -> Option<$name> {
				if bs.len() != $len {
					return None;
				}
				let mut n = [0u8; $len];
				n.copy_from_slice(bs);
				Some($name(n))
			}

			/// Fills a fresh buffer from a CSPRNG.
			pub fn from_rng<R: ::rand::RngCore + ?Sized>(rng: &mut R) -> $name {
				let mut n = [0u8; $len];
				rng.fill_bytes(&mut n);
				$name(n)
			}

			pub fn to_hex(&self) -> String {
				::data_encoding::HEXLOWER_PERMISSIVE.encode(&self.0)
			}
		}

		impl ::subtle::ConstantTimeEq for $name {
			fn ct_eq(&self, other: &Self) -> ::subtle::Choice {
				self.0.ct_eq(&other.0)
			}
		}

		impl ::std::cmp::PartialEq for $name {
			fn eq(&self, other: &Self) -> bool {
				use ::subtle::ConstantTimeEq;
				self.ct_eq(other).into()
			}
		}

		impl ::std::cmp::Eq for $name {}

		impl ::std::ops::Deref for $name {
			type Target = [u8];
			fn deref(&self) -> &[u8] {
				&self.0
			}
		}

		impl ::std::fmt::Debug for $name {
			fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
				write!(f, "{}(..)", stringify!($name))
			}
		}
	};
}
