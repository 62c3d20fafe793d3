use std::{net::SocketAddr, time::Instant};

use bytes::Bytes;
use kameo::{
   Actor,
   actor::{ActorRef, WeakActorRef},
   mailbox::Signal,
   prelude::{Context as KameoContext, MailboxReceiver, Message},
};
use tracing::{debug, instrument, trace, warn};

use crate::{
   engine::{DownloadActor, DownloadMessage},
   errors::PeerSessionError,
   peer::{LinkEvent, Peer, PeerId, PeerLink},
   protocol::{
      EXTENSION_HANDSHAKE_ID, ExtendedHandshake, HolePunchMessage, MetadataExchange, PexMessage,
      UT_HOLEPUNCH_LOCAL_ID, UT_METADATA_LOCAL_ID, UT_PEX_LOCAL_ID,
   },
};

/// Dispose a session after this many seconds without link traffic. The
/// wire layer handles keep-alives below us, so a silent link this long is
/// gone for good.
const PEER_IDLE_TIMEOUT: u64 = 120;

/// One connected peer, wrapped in an actor.
///
/// The session owns the [`PeerLink`], decodes the extension frames it
/// yields, and forwards the decoded events to the download engine. The
/// engine answers with [`SessionTell`] messages when it wants something
/// sent.
pub(crate) struct PeerSessionActor {
   peer: Peer,
   link: Box<dyn PeerLink>,
   supervisor: ActorRef<DownloadActor>,
   last_event: Instant,
}

/// Commands from the engine to a session.
pub(crate) enum SessionTell {
   /// Ask the peer for metadata block `piece`.
   RequestBlock(usize),
   /// Relay a hole-punch rendezvous for the target endpoint through this
   /// peer.
   SendRendezvous(SocketAddr),
}

impl PeerSessionActor {
   fn peer_id(&self) -> PeerId {
      self.peer.id.expect("session peers always carry an id")
   }

   /// Tells the engine this session is gone. The engine removes its
   /// reference and kills the actor.
   async fn notify_closed(&self) {
      let message = DownloadMessage::PeerClosed {
         peer_id: self.peer_id(),
         addr: self.peer.socket_addr(),
         inbound: self.peer.is_inbound(),
      };
      if self.supervisor.tell(message).await.is_err() {
         trace!("Supervisor already gone while closing session");
      }
   }

   async fn handle_extended_handshake(&mut self, payload: Bytes) {
      let handshake = match ExtendedHandshake::from_bytes(&payload) {
         Ok(handshake) => handshake,
         Err(err) => {
            warn!(error = %err, "Peer sent an unparsable extended handshake, disposing");
            self.notify_closed().await;
            return;
         }
      };

      self.peer.ut_metadata_id = handshake.ut_metadata_id().unwrap_or(0);
      self.peer.ut_pex_id = handshake.ut_pex_id().unwrap_or(0);
      self.peer.ut_holepunch_id = handshake.ut_holepunch_id().unwrap_or(0);
      if self.peer.announced_metadata_size.is_none() {
         self.peer.announced_metadata_size = handshake.metadata_size;
      }

      trace!(
         ut_metadata = self.peer.ut_metadata_id,
         metadata_size = ?handshake.metadata_size,
         private = handshake.is_private(),
         "Received extended handshake"
      );

      let message = DownloadMessage::ExtendedHandshaken {
         peer_id: self.peer_id(),
         handshake: Box::new(handshake),
      };
      let _ = self.supervisor.tell(message).await;
   }

   async fn handle_metadata_message(&mut self, payload: Bytes) {
      let Some(exchange) = MetadataExchange::from_bytes(&payload) else {
         // No locatable header dictionary; BEP 0009 says drop it quietly.
         debug!(payload_len = payload.len(), "Ignoring unsplittable ut_metadata message");
         return;
      };

      match exchange {
         MetadataExchange::Piece { piece, total_size, data } => {
            trace!(piece, ?total_size, data_len = data.len(), "Received metadata block");
            let message = DownloadMessage::MetadataPiece {
               peer_id: self.peer_id(),
               piece,
               data,
            };
            let _ = self.supervisor.tell(message).await;
         }
         MetadataExchange::Reject { piece } => {
            debug!(piece, "Peer rejected metadata request");
            let message = DownloadMessage::MetadataReject {
               peer_id: self.peer_id(),
               piece,
            };
            let _ = self.supervisor.tell(message).await;
         }
         MetadataExchange::Request { piece } => {
            // We only download metadata, we never serve it.
            debug!(piece, "Ignoring metadata request from peer");
         }
      }
   }

   async fn handle_pex_message(&mut self, payload: Bytes) {
      match PexMessage::from_bytes(&payload) {
         Ok(message) => {
            trace!(added = message.added_peers().len(), "Received PEX message");
            let message = DownloadMessage::PexPeers {
               from_peer: self.peer_id(),
               message: Box::new(message),
            };
            let _ = self.supervisor.tell(message).await;
         }
         Err(err) => debug!(error = %err, "Ignoring unparsable PEX message"),
      }
   }

   async fn handle_holepunch_message(&mut self, payload: Bytes) {
      match HolePunchMessage::from_bytes(&payload) {
         Some(HolePunchMessage::Connect(addr)) => {
            debug!(target = %addr, "Hole-punch connect received");
            let _ = self.supervisor.tell(DownloadMessage::HolePunchConnect { addr }).await;
         }
         Some(HolePunchMessage::Rendezvous(target)) => {
            // Relaying rendezvous for third parties is a seeding concern.
            trace!(target = %target, "Ignoring rendezvous relay request");
         }
         Some(HolePunchMessage::Error(code)) => {
            debug!(code, "Hole-punch attempt failed");
         }
         None => debug!("Ignoring malformed hole-punch frame"),
      }
   }
}

impl Actor for PeerSessionActor {
   type Args = (Peer, Box<dyn PeerLink>, ActorRef<DownloadActor>);
   type Error = PeerSessionError;

   /// The wire handshake has already happened when a session starts; the
   /// first thing on the link is our extended handshake.
   async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
      let (peer, mut link, supervisor) = args;

      let registration = DownloadMessage::SessionStarted {
         peer_id: peer.id.expect("session peers always carry an id"),
         addr: peer.socket_addr(),
         session: actor_ref,
         inbound: peer.is_inbound(),
      };
      supervisor
         .tell(registration)
         .await
         .map_err(|err| PeerSessionError::LinkClosed(format!("engine unavailable: {err}")))?;

      let handshake = ExtendedHandshake::local().to_bytes()?;
      if let Err(err) = link.send_extended(EXTENSION_HANDSHAKE_ID, handshake).await {
         debug!(peer = %peer, error = %err, "Failed to send extended handshake");
         return Err(PeerSessionError::LinkClosed(err.to_string()));
      }

      Ok(Self {
         peer,
         link,
         supervisor,
         last_event: Instant::now(),
      })
   }

   /// Coerces link events into mailbox messages, the same loop the engine
   /// sees for every other input.
   async fn next(
      &mut self, actor_ref: WeakActorRef<Self>, mailbox_rx: &mut MailboxReceiver<Self>,
   ) -> Option<Signal<Self>> {
      if self.last_event.elapsed().as_secs() > PEER_IDLE_TIMEOUT {
         debug!(peer = %self.peer, "Peer idle for too long, disposing");
         self.notify_closed().await;
         return None;
      }

      tokio::select! {
         signal = mailbox_rx.recv() => signal,
         event = self.link.recv() => match event {
            Ok(LinkEvent::Closed) => {
               debug!(peer = %self.peer, "Peer link closed");
               self.notify_closed().await;
               None
            }
            Ok(event) => {
               let actor_ref = actor_ref.upgrade()?;
               Some(Signal::Message {
                  message: Box::new(event),
                  actor_ref,
                  reply: None,
                  sent_within_actor: true,
               })
            }
            Err(err) => {
               debug!(peer = %self.peer, error = %err, "Peer link failed");
               self.notify_closed().await;
               None
            }
         },
      }
   }
}

impl Message<LinkEvent> for PeerSessionActor {
   type Reply = ();

   #[instrument(skip(self, event), fields(peer = %self.peer))]
   async fn handle(
      &mut self, event: LinkEvent, _: &mut KameoContext<Self, Self::Reply>,
   ) -> Self::Reply {
      self.last_event = Instant::now();

      match event {
         LinkEvent::Extended { ext_id, payload } => match ext_id {
            EXTENSION_HANDSHAKE_ID => self.handle_extended_handshake(payload).await,
            UT_METADATA_LOCAL_ID => self.handle_metadata_message(payload).await,
            UT_PEX_LOCAL_ID => self.handle_pex_message(payload).await,
            UT_HOLEPUNCH_LOCAL_ID => self.handle_holepunch_message(payload).await,
            other => trace!(ext_id = other, "Ignoring frame for unregistered extension"),
         },
         LinkEvent::Closed => self.notify_closed().await,
      }
   }
}

impl Message<SessionTell> for PeerSessionActor {
   type Reply = ();

   #[instrument(skip(self, tell), fields(peer = %self.peer))]
   async fn handle(
      &mut self, tell: SessionTell, _: &mut KameoContext<Self, Self::Reply>,
   ) -> Self::Reply {
      match tell {
         SessionTell::RequestBlock(piece) => {
            if !self.peer.supports_metadata_exchange() {
               warn!(piece, "Asked to request a block from a peer without ut_metadata");
               return;
            }
            trace!(piece, ext_id = self.peer.ut_metadata_id, "Requesting metadata block");
            let payload = MetadataExchange::request_bytes(piece);
            if let Err(err) = self.link.send_extended(self.peer.ut_metadata_id, payload).await {
               debug!(piece, error = %err, "Failed to send metadata request, disposing peer");
               self.notify_closed().await;
            }
         }
         SessionTell::SendRendezvous(target) => {
            if !self.peer.supports_holepunch() {
               trace!(target = %target, "Peer has no ut_holepunch id, dropping rendezvous");
               return;
            }
            debug!(target = %target, "Sending hole-punch rendezvous");
            let payload = HolePunchMessage::Rendezvous(target).to_bytes();
            if let Err(err) = self.link.send_extended(self.peer.ut_holepunch_id, payload).await {
               debug!(error = %err, "Failed to send rendezvous, disposing peer");
               self.notify_closed().await;
            }
         }
      }
   }
}
