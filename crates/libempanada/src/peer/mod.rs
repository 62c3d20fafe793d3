mod id;
mod registry;
mod session;
mod wire;

use std::{
   fmt::{self, Debug, Display},
   hash::{Hash as InternalHash, Hasher},
   net::{IpAddr, SocketAddr},
};

pub use id::*;
pub use registry::*;
pub(crate) use session::*;
pub use wire::*;

/// It should be noted that peers are keyed by their socket address: a peer
/// id only becomes known after the wire handshake.
pub type PeerKey = SocketAddr;

/// Where a peer address was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
   Dht,
   Tracker,
   Pex,
   HolePunch,
   Incoming,
}

impl Display for PeerSource {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         PeerSource::Dht => "dht",
         PeerSource::Tracker => "tracker",
         PeerSource::Pex => "pex",
         PeerSource::HolePunch => "holepunch",
         PeerSource::Incoming => "incoming",
      };
      write!(f, "{name}")
   }
}

/// The transport a peer connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
   Tcp,
   Utp,
}

impl Display for Transport {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Transport::Tcp => write!(f, "TCP"),
         Transport::Utp => write!(f, "uTP"),
      }
   }
}

/// A remote peer participating in a metadata download.
///
/// Identity is the `(ip, port)` pair. Extension ids and the announced
/// metadata size are filled in as the extended handshake arrives; until
/// then the peer cannot be asked for metadata blocks.
#[derive(Clone)]
pub struct Peer {
   pub ip: IpAddr,
   pub port: u16,
   pub source: PeerSource,
   pub transport: Transport,
   pub id: Option<PeerId>,
   /// `ut_metadata` id from the peer's `m` dictionary; 0 = unsupported.
   pub ut_metadata_id: u8,
   /// `ut_pex` id from the peer's `m` dictionary; 0 = unsupported.
   pub ut_pex_id: u8,
   /// `ut_holepunch` id from the peer's `m` dictionary; 0 = unsupported.
   pub ut_holepunch_id: u8,
   /// The info-dictionary size this peer announced, if any.
   pub announced_metadata_size: Option<usize>,
}

impl Debug for Peer {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Peer")
         .field("addr", &self.socket_addr())
         .field("source", &self.source)
         .field("transport", &self.transport)
         .field("id", &self.id)
         .field("ut_metadata_id", &self.ut_metadata_id)
         .finish()
   }
}

impl InternalHash for Peer {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.socket_addr().hash(state)
   }
}

impl Eq for Peer {}
impl PartialEq for Peer {
   fn eq(&self, other: &Self) -> bool {
      self.socket_addr() == other.socket_addr()
   }
}

impl Display for Peer {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(f, "{}:{}", self.ip, self.port)
   }
}

impl Peer {
   /// Create a new peer with the given address, discovery source and
   /// transport.
   pub fn new(addr: SocketAddr, source: PeerSource, transport: Transport) -> Self {
      Peer {
         ip: addr.ip(),
         port: addr.port(),
         source,
         transport,
         id: None,
         ut_metadata_id: 0,
         ut_pex_id: 0,
         ut_holepunch_id: 0,
         announced_metadata_size: None,
      }
   }

   /// Get the socket address of the peer
   pub fn socket_addr(&self) -> SocketAddr {
      SocketAddr::new(self.ip, self.port)
   }

   pub fn supports_metadata_exchange(&self) -> bool {
      self.ut_metadata_id != 0
   }

   pub fn supports_holepunch(&self) -> bool {
      self.ut_holepunch_id != 0
   }

   /// Whether this peer arrived on an inbound socket.
   pub fn is_inbound(&self) -> bool {
      self.source == PeerSource::Incoming
   }
}
