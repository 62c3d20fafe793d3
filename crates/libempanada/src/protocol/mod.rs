//! Extension-protocol dictionaries exchanged over [BEP 0010](https://www.bittorrent.org/beps/bep_0010.html)
//! frames.
//!
//! The length-prefixed peer wire itself lives behind the
//! [`PeerLink`](crate::peer::PeerLink) seam; this module only understands the
//! bencoded payloads: the extended handshake, `ut_metadata` exchange
//! messages ([BEP 0009](https://www.bittorrent.org/beps/bep_0009.html)),
//! `ut_pex` ([BEP 0011](https://www.bittorrent.org/beps/bep_0011.html)) and
//! `ut_holepunch` ([BEP 0055](https://www.bittorrent.org/beps/bep_0055.html)).

pub mod messages;

pub use messages::*;
