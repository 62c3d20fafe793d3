use std::fmt::{self, Display};

use data_encoding::BASE32_NOPAD;

use crate::errors::HashError;

/// A fixed-length byte array that can represent various hash values or
/// identifiers.
///
/// `Hash<N>` is a generic wrapper around a byte array of length `N` that
/// provides convenient methods for conversion between different
/// representations.
///
/// # Examples
///
/// ```
/// use libempanada::hashes::Hash;
///
/// let hash = Hash::new([0; 5]);
/// assert_eq!(hash.to_hex(), "0000000000");
///
/// let from_hex = Hash::<5>::from_hex("0102030405").unwrap();
/// assert_eq!(from_hex.as_bytes(), &[1, 2, 3, 4, 5]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash<const N: usize>([u8; N]);

/// A specialized Hash type for BitTorrent info hashes (20 bytes/160 bits)
pub type InfoHash = Hash<20>;

impl<const N: usize> Hash<N> {
   /// Creates a new Hash from a byte array of length N.
   pub fn new(bytes: [u8; N]) -> Self {
      Hash(bytes)
   }

   /// Returns a reference to the underlying byte array.
   pub fn as_bytes(&self) -> &[u8; N] {
      &self.0
   }

   /// Converts the hash to its lowercase hexadecimal string representation.
   pub fn to_hex(&self) -> String {
      hex::encode(self.0)
   }

   /// Creates a Hash from a hexadecimal string.
   ///
   /// The input string must have exactly 2*N characters (2 hex chars per
   /// byte); case is ignored.
   ///
   /// # Errors
   ///
   /// Returns an error if the hex string is invalid or has incorrect length.
   pub fn from_hex(hex: impl AsRef<[u8]>) -> Result<Self, HashError> {
      let bytes = hex::decode(hex)?;
      let actual = bytes.len();
      bytes
         .try_into()
         .map(Hash)
         .map_err(|_| HashError::InvalidLength { expected: N, actual })
   }

   /// Creates a Hash from an RFC 4648 Base32 string (alphabet `A–Z2–7`,
   /// case-insensitive, no padding).
   ///
   /// Magnet URIs commonly carry 20-byte info hashes as 32 Base32
   /// characters.
   ///
   /// # Examples
   ///
   /// ```
   /// use libempanada::hashes::InfoHash;
   ///
   /// let hash = InfoHash::from_base32("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
   /// assert_eq!(hash.as_bytes(), &[0u8; 20]);
   /// ```
   pub fn from_base32(encoded: impl AsRef<str>) -> Result<Self, HashError> {
      let bytes = BASE32_NOPAD.decode(encoded.as_ref().to_uppercase().as_bytes())?;
      let actual = bytes.len();
      bytes
         .try_into()
         .map(Hash)
         .map_err(|_| HashError::InvalidLength { expected: N, actual })
   }
}

impl InfoHash {
   /// Parses an info hash the way magnet URIs encode them: either 40 hex
   /// characters or 32 Base32 characters, both case-insensitive.
   ///
   /// Anything of a different length is rejected without guessing.
   pub fn from_magnet_encoding(encoded: &str) -> Result<Self, HashError> {
      match encoded.len() {
         40 => Self::from_hex(encoded),
         32 => Self::from_base32(encoded),
         other => Err(HashError::UnrecognizedEncoding(other)),
      }
   }
}

impl<const N: usize> Display for Hash<N> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.to_hex())
   }
}

impl<const N: usize> From<[u8; N]> for Hash<N> {
   fn from(bytes: [u8; N]) -> Self {
      Hash(bytes)
   }
}

impl<const N: usize> TryFrom<&[u8]> for Hash<N> {
   type Error = HashError;

   fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
      let actual = bytes.len();
      bytes
         .try_into()
         .map(Hash)
         .map_err(|_| HashError::InvalidLength { expected: N, actual })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_from_hex_roundtrip() {
      let hash = InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
      assert_eq!(hash.to_hex(), "0123456789abcdef0123456789abcdef01234567");
   }

   #[test]
   fn test_from_hex_is_case_insensitive() {
      let lower = InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
      let upper = InfoHash::from_hex("0123456789ABCDEF0123456789ABCDEF01234567").unwrap();
      assert_eq!(lower, upper);
   }

   #[test]
   fn test_from_hex_rejects_wrong_length() {
      // 39 characters, one short of a valid info hash
      assert!(InfoHash::from_hex("0123456789abcdef0123456789abcdef0123456").is_err());
      assert!(InfoHash::from_hex("0123456789abcdef0123456789abcdef0123456789").is_err());
   }

   #[test]
   fn test_base32_all_a_decodes_to_zero_bytes() {
      let hash = InfoHash::from_base32("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
      assert_eq!(hash.as_bytes(), &[0u8; 20]);
   }

   #[test]
   fn test_base32_is_case_insensitive() {
      let lower = InfoHash::from_base32("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
      assert_eq!(lower.as_bytes(), &[0u8; 20]);
   }

   #[test]
   fn test_magnet_encoding_switches_on_length() {
      let hex = InfoHash::from_magnet_encoding("0123456789abcdef0123456789abcdef01234567");
      assert!(hex.is_ok());
      let base32 = InfoHash::from_magnet_encoding("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
      assert!(base32.is_ok());
      assert!(InfoHash::from_magnet_encoding("0123").is_err());
   }
}
