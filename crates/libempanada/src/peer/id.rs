use std::fmt;

use rand::{Rng, distr::Alphanumeric};

pub type Id = [u8; 20];

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Azureus-style client prefix for this library, per [BEP 20](https://www.bittorrent.org/beps/bep_0020.html).
const CLIENT_PREFIX: &[u8; 2] = b"EP";

/// A 20-byte peer id.
///
/// Generated ids use the Azureus convention `-EPxxxx-` followed by a random
/// alphanumeric tail; foreign ids are carried opaquely, with the client
/// prefix recovered for logging when it follows the same convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Id);

impl PeerId {
   /// Generates a fresh id for this client.
   pub fn generate() -> Self {
      // Fill the entire array with random alphanumeric bytes, then stamp
      // the Azureus-style prefix over the front.
      let mut id = [0u8; 20];
      rand::rng()
         .sample_iter(&Alphanumeric)
         .take(20)
         .enumerate()
         .for_each(|(i, byte)| id[i] = byte);

      id[0] = b'-';
      id[1..3].copy_from_slice(CLIENT_PREFIX);

      let version: String = VERSION.chars().filter(|c| c.is_ascii_digit()).collect();
      let version = if version.len() < 4 {
         format!("{version:0<4}")
      } else {
         version[..4].to_string()
      };
      id[3..7].copy_from_slice(version.as_bytes());
      id[7] = b'-';

      PeerId(id)
   }

   pub fn as_bytes(&self) -> &Id {
      &self.0
   }

   /// The two-letter client prefix when the id follows the Azureus
   /// `-XX####-` convention.
   pub fn client_prefix(&self) -> Option<&str> {
      if self.0[0] == b'-' && self.0[7] == b'-' {
         std::str::from_utf8(&self.0[1..3]).ok()
      } else {
         None
      }
   }
}

impl Default for PeerId {
   fn default() -> Self {
      Self::generate()
   }
}

impl From<Id> for PeerId {
   fn from(id: Id) -> Self {
      PeerId(id)
   }
}

impl fmt::Display for PeerId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if let Some(prefix) = self.client_prefix() {
         write!(f, "{} ({})", prefix, hex::encode(self.0))
      } else {
         write!(f, "{}", hex::encode(self.0))
      }
   }
}
