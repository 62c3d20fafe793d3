pub mod cache;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod hashes;
pub mod magnet;
pub mod peer;
pub mod protocol;
pub mod webseed;

/// The prelude for this crate.
///
/// This module re-exports the most commonly used types, traits, and functions
/// so that you can conveniently import them all at once:
///
/// ```
/// use libempanada::prelude::*;
/// ```
pub mod prelude {
   pub use crate::{
      cache::MetadataCache,
      discovery::{AnnounceClient, DhtService},
      engine::{MetadataDownload, MetadataEvent},
      errors::*,
      hashes::InfoHash,
      magnet::MagnetUri,
      peer::{Peer, PeerConnector, PeerId, PeerLink, PeerSource, Transport},
      webseed::WebSeedFetcher,
   };
}
