use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use kameo::{
   Actor, Reply,
   actor::ActorRef,
   mailbox,
   prelude::{Context, Message},
};
use tracing::{debug, info, instrument, trace, warn};

use super::{
   DownloadActor, EngineState, SessionEntry,
   assembler::{BlockOutcome, MetadataAssembler},
   scheduler::RETRY_WARN_THRESHOLD,
};
use crate::{
   peer::{Peer, PeerId, PeerLink, PeerSessionActor, PeerSource, SessionTell, Transport},
   protocol::{ExtendedHandshake, PexMessage},
};

/// Asynchronous inputs fanned into the engine: discovery finds, session
/// events, timer fires, and the stop request.
pub(crate) enum DownloadMessage {
   /// Addresses found by a discovery source.
   Candidates {
      addrs: Vec<SocketAddr>,
      source: PeerSource,
      transport: Transport,
   },
   /// A peer dialed us; the wire layer has already handshaken it.
   IncomingPeer {
      peer_id: PeerId,
      addr: SocketAddr,
      transport: Transport,
      link: Box<dyn PeerLink>,
   },
   /// A session actor came up and registers itself.
   SessionStarted {
      peer_id: PeerId,
      addr: SocketAddr,
      session: ActorRef<PeerSessionActor>,
      inbound: bool,
   },
   /// A session decoded the peer's extended handshake.
   ExtendedHandshaken {
      peer_id: PeerId,
      handshake: Box<ExtendedHandshake>,
   },
   /// A metadata block arrived.
   MetadataPiece {
      peer_id: PeerId,
      piece: usize,
      data: Bytes,
   },
   /// The peer rejected a metadata request.
   MetadataReject { peer_id: PeerId, piece: usize },
   /// A session decoded a PEX message.
   PexPeers {
      from_peer: PeerId,
      message: Box<PexMessage>,
   },
   /// A hole-punch rendezvous succeeded; the endpoint is dialable now.
   HolePunchConnect { addr: SocketAddr },
   /// A `(peer, block)` request timer fired.
   BlockTimedOut { peer_id: PeerId, piece: usize },
   /// A session is gone, voluntarily or not.
   PeerClosed {
      peer_id: PeerId,
      addr: SocketAddr,
      inbound: bool,
   },
   /// Wind the engine down. Idempotent.
   Stop,
}

impl fmt::Debug for DownloadMessage {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         DownloadMessage::Candidates { addrs, source, .. } => {
            write!(f, "Candidates({} from {source})", addrs.len())
         }
         DownloadMessage::IncomingPeer { addr, .. } => write!(f, "IncomingPeer({addr})"),
         DownloadMessage::SessionStarted { addr, .. } => write!(f, "SessionStarted({addr})"),
         DownloadMessage::ExtendedHandshaken { peer_id, .. } => {
            write!(f, "ExtendedHandshaken({peer_id})")
         }
         DownloadMessage::MetadataPiece { piece, data, .. } => {
            write!(f, "MetadataPiece({piece}, {} bytes)", data.len())
         }
         DownloadMessage::MetadataReject { piece, .. } => write!(f, "MetadataReject({piece})"),
         DownloadMessage::PexPeers { from_peer, .. } => write!(f, "PexPeers(from {from_peer})"),
         DownloadMessage::HolePunchConnect { addr } => write!(f, "HolePunchConnect({addr})"),
         DownloadMessage::BlockTimedOut { piece, .. } => write!(f, "BlockTimedOut({piece})"),
         DownloadMessage::PeerClosed { addr, .. } => write!(f, "PeerClosed({addr})"),
         DownloadMessage::Stop => write!(f, "Stop"),
      }
   }
}

/// Queries the engine answers without touching download state.
pub(crate) enum DownloadRequest {
   /// Completion percent of the running attempt.
   Progress,
   /// Number of live peer sessions.
   PeerCount,
   /// Whether the private flag has been latched.
   IsPrivate,
}

#[derive(Reply)]
pub(crate) enum DownloadResponse {
   Progress(u8),
   PeerCount(usize),
   IsPrivate(bool),
}

impl Message<DownloadMessage> for DownloadActor {
   type Reply = ();

   #[instrument(skip(self, message), fields(info_hash = %self.info_hash, msg = ?message))]
   async fn handle(
      &mut self, message: DownloadMessage, _: &mut Context<Self, Self::Reply>,
   ) -> Self::Reply {
      match message {
         DownloadMessage::Candidates { addrs, source, transport } => {
            for addr in addrs {
               self.admit_candidate(addr, source, transport);
            }
         }

         DownloadMessage::IncomingPeer { peer_id, addr, transport, link } => {
            if self.state != EngineState::Running {
               return;
            }
            match self.registry.admit(addr, true) {
               Ok(()) => {
                  let mut peer = Peer::new(addr, PeerSource::Incoming, transport);
                  peer.id = Some(peer_id);
                  PeerSessionActor::spawn_with_mailbox(
                     (peer, link, self.actor_ref.clone()),
                     mailbox::bounded(120),
                  );
               }
               Err(reason) => trace!(%addr, %reason, "Refused inbound peer"),
            }
         }

         DownloadMessage::SessionStarted { peer_id, addr, session, inbound } => {
            if self.state != EngineState::Running {
               session.kill();
               return;
            }
            if peer_id == self.our_id {
               debug!(%addr, "Connected to ourselves, dropping session");
               session.kill();
               if inbound {
                  self.registry.release_inbound(addr.ip());
               }
               return;
            }
            if self.sessions.contains_key(&peer_id) {
               debug!(%addr, %peer_id, "Duplicate peer id, dropping session");
               session.kill();
               if inbound {
                  self.registry.release_inbound(addr.ip());
               }
               return;
            }

            debug!(%addr, %peer_id, peers = self.sessions.len() + 1, "Peer session started");
            self.sessions.insert(peer_id, SessionEntry { addr, session, inbound });
         }

         DownloadMessage::ExtendedHandshaken { peer_id, handshake } => {
            self.handle_extended_handshake(peer_id, *handshake);
         }

         DownloadMessage::MetadataPiece { peer_id, piece, data } => {
            self.handle_metadata_piece(peer_id, piece, data).await;
         }

         DownloadMessage::MetadataReject { peer_id, piece } => {
            if self.state != EngineState::Running {
               return;
            }
            if self.scheduler.cancel(peer_id, piece) {
               self.scheduler.requeue(piece);
               self.schedule(None);
            }
         }

         DownloadMessage::PexPeers { from_peer, message } => {
            self.handle_pex_peers(from_peer, *message);
         }

         DownloadMessage::HolePunchConnect { addr } => {
            self.admit_candidate(addr, PeerSource::HolePunch, Transport::Utp);
         }

         DownloadMessage::BlockTimedOut { peer_id, piece } => {
            if self.state != EngineState::Running {
               return;
            }
            if let Some(retries) = self.scheduler.note_timeout(peer_id, piece) {
               if retries >= RETRY_WARN_THRESHOLD {
                  warn!(piece, retries, "Metadata block keeps timing out");
               } else {
                  debug!(piece, retries, %peer_id, "Metadata block request timed out");
               }
               self.scheduler.requeue(piece);
               self.schedule(None);
            }
         }

         DownloadMessage::PeerClosed { peer_id, addr, inbound } => {
            if let Some(entry) = self.sessions.remove(&peer_id) {
               debug!(addr = %entry.addr, %peer_id, "Peer disposed");
               entry.session.kill();
            }
            self.available.retain(|peer| *peer != peer_id);
            let requeued = self.scheduler.requeue_peer(peer_id);
            if inbound {
               self.registry.release_inbound(addr.ip());
            }
            if requeued > 0 {
               self.schedule(None);
            }
         }

         DownloadMessage::Stop => self.stop_engine(),
      }
   }
}

impl DownloadActor {
   /// Installs the metadata size on first announcement, latches the
   /// private flag, and moves the peer into the availability set when it
   /// is metadata-ready.
   fn handle_extended_handshake(&mut self, peer_id: PeerId, handshake: ExtendedHandshake) {
      if self.state != EngineState::Running {
         return;
      }

      if let Some(ip) = handshake.your_ip {
         trace!(your_ip = %ip, "Peer reported our external address");
      }

      if handshake.is_private() && !self.private {
         info!("Torrent is private: stopping DHT, rejecting PEX from now on");
         self.private = true;
         if let Some(dht) = self.dht.take() {
            tokio::spawn(async move {
               dht.stop().await;
            });
         }
      }

      if let Some(size) = handshake.metadata_size {
         match &self.assembler {
            None if size > 0 => {
               let assembler = MetadataAssembler::new(self.info_hash, size);
               let blocks = assembler.block_count();
               info!(metadata_size = size, blocks, "Metadata size fixed");
               self.scheduler.fill(blocks);
               self.assembler = Some(assembler);
            }
            Some(existing) if existing.metadata_size() != size => {
               // First announcement wins for the lifetime of the attempt.
               debug!(
                  announced = size,
                  fixed = existing.metadata_size(),
                  "Ignoring conflicting metadata size"
               );
            }
            _ => {}
         }
      }

      let metadata_ready = handshake.ut_metadata_id().is_some()
         && handshake.metadata_size.is_some()
         && self.sessions.contains_key(&peer_id);
      if metadata_ready && !self.available.contains(&peer_id) {
         debug!(%peer_id, available = self.available.len() + 1, "Peer is metadata-ready");
         self.available.push(peer_id);
         self.schedule(Some(peer_id));
      }
   }

   /// A block response: disarm its timer before anything else so a late
   /// fire finds nothing, then feed the assembler and keep the delivering
   /// peer's pipeline full.
   async fn handle_metadata_piece(&mut self, peer_id: PeerId, piece: usize, data: Bytes) {
      if self.state != EngineState::Running {
         return;
      }

      let was_in_flight = self.scheduler.cancel(peer_id, piece);
      self.scheduler.clear_retry(piece);

      let Some(assembler) = self.assembler.as_mut() else {
         trace!(piece, "Dropping block before any metadata size was fixed");
         return;
      };

      match assembler.accept(piece, &data) {
         BlockOutcome::Ignored => {
            // An in-flight block the assembler would not take still has to
            // land somewhere: back to the queue, unless it completed
            // through another peer.
            if was_in_flight && !assembler.is_block_completed(piece) {
               self.scheduler.requeue(piece);
               self.schedule(None);
            }
         }
         BlockOutcome::Accepted { percent } => {
            trace!(piece, percent, %peer_id, "Metadata block accepted");
            self.emit(super::MetadataEvent::Progress { percent });

            let assembler = self.assembler.as_ref().expect("assembler just used");
            if !assembler.is_complete() {
               self.schedule(Some(peer_id));
            } else if assembler.verify() {
               self.finish().await;
            } else {
               self.restart_or_fail();
            }
         }
      }
   }

   /// PEX fan-in: reachable entries become candidates; unreachable ones
   /// with uTP + hole-punch support get a rendezvous relayed through the
   /// peer that told us about them.
   fn handle_pex_peers(&mut self, from_peer: PeerId, message: PexMessage) {
      if self.state != EngineState::Running {
         return;
      }
      if self.private {
         debug!(%from_peer, "Dropping PEX message on a private torrent");
         return;
      }

      for pex_peer in message.added_peers() {
         if pex_peer.needs_rendezvous() {
            let Some(entry) = self.sessions.get(&from_peer) else {
               continue;
            };
            trace!(target = %pex_peer.addr, via = %from_peer, "Relaying hole-punch rendezvous");
            let session = entry.session.clone();
            let target = pex_peer.addr;
            tokio::spawn(async move {
               let _ = session.tell(SessionTell::SendRendezvous(target)).await;
            });
         } else {
            let transport =
               if pex_peer.supports_utp() { Transport::Utp } else { Transport::Tcp };
            self.admit_candidate(pex_peer.addr, PeerSource::Pex, transport);
         }
      }
   }
}

impl Message<DownloadRequest> for DownloadActor {
   type Reply = DownloadResponse;

   async fn handle(
      &mut self, message: DownloadRequest, _: &mut Context<Self, Self::Reply>,
   ) -> Self::Reply {
      match message {
         DownloadRequest::Progress => DownloadResponse::Progress(
            self.assembler.as_ref().map(|assembler| assembler.percent()).unwrap_or(0),
         ),
         DownloadRequest::PeerCount => DownloadResponse::PeerCount(self.sessions.len()),
         DownloadRequest::IsPrivate => DownloadResponse::IsPrivate(self.private),
      }
   }
}
