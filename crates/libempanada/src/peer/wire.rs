use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use super::{PeerId, Transport};

/// An event surfaced by a peer link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
   /// A BEP 0010 extension frame: the extended message id the remote side
   /// addressed, plus the raw payload after it.
   Extended { ext_id: u8, payload: Bytes },
   /// The underlying connection went away.
   Closed,
}

/// A connected peer at the extension-frame level.
///
/// The length-prefixed BitTorrent wire, choke/interest bookkeeping and
/// keep-alives all live below this seam; implementations deliver and accept
/// only extension frames. Everything inside the frames is decoded by this
/// crate.
#[async_trait]
pub trait PeerLink: Send + Sync {
   /// Sends one extension frame addressed to `ext_id` on the remote side.
   async fn send_extended(&mut self, ext_id: u8, payload: Bytes) -> anyhow::Result<()>;

   /// Waits for the next event from the peer.
   async fn recv(&mut self) -> anyhow::Result<LinkEvent>;
}

/// Dials peers and runs the BitTorrent wire handshake.
///
/// The connector carries the info hash and our peer id; `connect` resolves
/// once the remote side has handshaken, yielding its peer id and a link
/// ready for extension traffic.
#[async_trait]
pub trait PeerConnector: Send + Sync {
   async fn connect(
      &self, addr: SocketAddr, transport: Transport,
   ) -> anyhow::Result<(PeerId, Box<dyn PeerLink>)>;
}
