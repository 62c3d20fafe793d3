use std::{
   collections::HashMap,
   net::{IpAddr, SocketAddr},
   sync::Arc,
};

use kameo::{Actor, actor::ActorRef, mailbox};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, instrument, trace, warn};

use super::{
   DownloadMessage, MetadataEvent, assembler::MetadataAssembler, scheduler::RequestScheduler,
};
use crate::{
   cache::MetadataCache,
   discovery::{AnnounceClient, DhtService, spawn_dht_lookup, spawn_tier_announce},
   errors::EngineError,
   hashes::InfoHash,
   magnet::MagnetUri,
   peer::{Peer, PeerConnector, PeerId, PeerRegistry, PeerSessionActor, PeerSource, Transport},
};

/// A live peer session and the registry facts needed to release it.
pub(crate) struct SessionEntry {
   pub(crate) addr: SocketAddr,
   pub(crate) session: ActorRef<PeerSessionActor>,
   pub(crate) inbound: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
   Running,
   Stopped,
}

/// Configuration arguments for spawning a [`DownloadActor`].
pub(crate) struct DownloadActorArgs {
   pub descriptor: MagnetUri,
   pub our_id: PeerId,
   pub connector: Arc<dyn PeerConnector>,
   pub dht: Option<Arc<dyn DhtService>>,
   pub announcer: Option<Arc<dyn AnnounceClient>>,
   pub cache: MetadataCache,
   pub ignored_hosts: Vec<IpAddr>,
   pub external_ip: Option<IpAddr>,
   pub events: broadcast::Sender<MetadataEvent>,
}

/// The metadata download engine for one info hash.
///
/// All download state lives on this single actor: peer sessions, the block
/// queue, in-flight timers, the assembly buffer and the private flag. Peer
/// sessions, discovery tasks and timers re-enter through the mailbox, so
/// every mutation happens on one logical task.
pub(crate) struct DownloadActor {
   pub(super) info_hash: InfoHash,
   pub(super) our_id: PeerId,
   pub(super) state: EngineState,
   pub(super) registry: PeerRegistry,
   pub(super) sessions: HashMap<PeerId, SessionEntry>,
   /// Metadata-ready peers in the order they became ready; the scheduler
   /// walks this list round-robin.
   pub(super) available: Vec<PeerId>,
   pub(super) scheduler: RequestScheduler,
   /// Present once the first extended handshake announced a metadata size.
   pub(super) assembler: Option<MetadataAssembler>,
   /// Latched by the first `private=1` extended handshake, never unlatched.
   pub(super) private: bool,
   pub(super) connector: Arc<dyn PeerConnector>,
   pub(super) dht: Option<Arc<dyn DhtService>>,
   pub(super) cache: MetadataCache,
   pub(super) events: broadcast::Sender<MetadataEvent>,
   pub(super) discovery_tasks: Vec<JoinHandle<()>>,
   pub(super) actor_ref: ActorRef<Self>,
}

impl DownloadActor {
   pub(super) fn emit(&self, event: MetadataEvent) {
      if self.events.send(event).is_err() {
         trace!("No event subscribers");
      }
   }

   /// Admits an outbound candidate and dials it. PEX candidates are
   /// refused once the torrent is known private; everything else the
   /// registry decides.
   pub(super) fn admit_candidate(&mut self, addr: SocketAddr, source: PeerSource, transport: Transport) {
      if self.state != EngineState::Running {
         return;
      }
      if source == PeerSource::Pex && self.private {
         debug!(%addr, "Rejecting PEX candidate on a private torrent");
         return;
      }

      match self.registry.admit(addr, false) {
         Ok(()) => {
            trace!(%addr, %source, %transport, "Admitted candidate");
            self.spawn_connect(addr, source, transport);
         }
         Err(reason) => trace!(%addr, %source, %reason, "Refused candidate"),
      }
   }

   /// Dials a candidate off the engine task. The session announces itself
   /// back through the mailbox once the wire handshake is done.
   fn spawn_connect(&self, addr: SocketAddr, source: PeerSource, transport: Transport) {
      let connector = self.connector.clone();
      let supervisor = self.actor_ref.clone();

      tokio::spawn(async move {
         match connector.connect(addr, transport).await {
            Ok((peer_id, link)) => {
               let mut peer = Peer::new(addr, source, transport);
               peer.id = Some(peer_id);
               PeerSessionActor::spawn_with_mailbox((peer, link, supervisor), mailbox::bounded(120));
            }
            Err(err) => {
               debug!(%addr, error = %err, "Failed to connect to candidate");
            }
         }
      });
   }

   /// Issues as many requests as `min(|queue|, |available|)`, to distinct
   /// peers in round-robin order. A bias peer is served first to keep its
   /// pipeline full after it delivered a block.
   pub(super) fn schedule(&mut self, bias: Option<PeerId>) {
      if self.state != EngineState::Running || self.assembler.is_none() {
         return;
      }
      if self.scheduler.queue_len() == 0 || self.available.is_empty() {
         return;
      }

      let mut order = self.available.clone();
      if let Some(bias) = bias
         && let Some(at) = order.iter().position(|peer| *peer == bias)
      {
         order.rotate_left(at);
      }

      let requests = order.len().min(self.scheduler.queue_len());
      trace!(
         requests,
         queued = self.scheduler.queue_len(),
         available = order.len(),
         "Scheduling block requests"
      );

      for i in 0..requests {
         let Some(piece) = self.scheduler.pop_front() else {
            break;
         };
         let peer_id = order[i % order.len()];

         let Some(entry) = self.sessions.get(&peer_id) else {
            // The availability list outlived the session; put the block
            // back and let PeerClosed bookkeeping catch up.
            self.scheduler.requeue(piece);
            continue;
         };

         let session = entry.session.clone();
         tokio::spawn(async move {
            let _ = session.tell(crate::peer::SessionTell::RequestBlock(piece)).await;
         });
         self.install_timer(peer_id, piece);
      }
   }

   /// Arms the `(peer, block)` timeout: a sleeping task that re-enters the
   /// mailbox when it fires, aborted when the block completes first.
   fn install_timer(&mut self, peer_id: PeerId, piece: usize) {
      let delay = self.scheduler.timeout_for(piece);
      let supervisor = self.actor_ref.clone();

      let timer = tokio::spawn(async move {
         tokio::time::sleep(delay).await;
         let _ = supervisor.tell(DownloadMessage::BlockTimedOut { peer_id, piece }).await;
      });
      self.scheduler.track(peer_id, piece, timer);
   }

   /// A verified download: cache it, surface it, wind the engine down.
   pub(super) async fn finish(&mut self) {
      let assembler = self.assembler.as_ref().expect("finish requires an assembler");
      let metadata = assembler.bytes();

      info!(
         info_hash = %self.info_hash,
         len = metadata.len(),
         attempt = assembler.attempt(),
         "Metadata verified"
      );

      self.cache.write(&self.info_hash, &metadata).await;
      self.emit(MetadataEvent::Complete { metadata });
      self.stop_engine();
   }

   /// A verification mismatch: roll the whole download back, or give up
   /// once the attempt budget is spent.
   pub(super) fn restart_or_fail(&mut self) {
      let assembler = self.assembler.as_mut().expect("restart requires an assembler");
      let block_count = assembler.block_count();

      if assembler.restart() {
         warn!(
            info_hash = %self.info_hash,
            attempt = assembler.attempt(),
            "Assembled metadata failed verification, restarting download"
         );
         self.scheduler.clear();
         self.scheduler.fill(block_count);
         self.schedule(None);
      } else {
         warn!(info_hash = %self.info_hash, "Metadata failed verification on the final attempt");
         self.emit(MetadataEvent::Failed {
            reason: "assembled metadata failed verification on every attempt".to_string(),
         });
         self.stop_engine();
      }
   }

   /// Idempotent teardown: timers first (so nothing re-enters), then the
   /// peer set, then the discovery subsystems, then the actor itself.
   pub(super) fn stop_engine(&mut self) {
      if self.state == EngineState::Stopped {
         return;
      }
      self.state = EngineState::Stopped;
      debug!(info_hash = %self.info_hash, "Stopping metadata engine");

      self.scheduler.clear();
      self.available.clear();
      for (_, entry) in self.sessions.drain() {
         entry.session.kill();
      }
      if let Some(dht) = self.dht.take() {
         tokio::spawn(async move {
            dht.stop().await;
         });
      }
      for task in self.discovery_tasks.drain(..) {
         task.abort();
      }

      self.actor_ref.kill();
   }
}

impl Actor for DownloadActor {
   type Args = DownloadActorArgs;
   type Error = EngineError;

   /// Probes the cache, and only on a miss brings up discovery: a DHT
   /// lookup plus one announce task per tracker tier.
   #[instrument(skip(args, actor_ref), fields(info_hash = %args.descriptor.info_hash))]
   async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
      let DownloadActorArgs {
         descriptor,
         our_id,
         connector,
         dht,
         announcer,
         cache,
         ignored_hosts,
         external_ip,
         events,
      } = args;
      let info_hash = descriptor.info_hash;

      if let Some(metadata) = cache.read(&info_hash).await {
         info!(len = metadata.len(), "Serving metadata from cache");
         let _ = events.send(MetadataEvent::Complete { metadata });
         actor_ref.kill();

         return Ok(Self {
            info_hash,
            our_id,
            state: EngineState::Stopped,
            registry: PeerRegistry::new(ignored_hosts, external_ip),
            sessions: HashMap::new(),
            available: Vec::new(),
            scheduler: RequestScheduler::new(),
            assembler: None,
            private: false,
            connector,
            dht,
            cache,
            events,
            discovery_tasks: Vec::new(),
            actor_ref,
         });
      }

      let mut discovery_tasks = Vec::new();
      if let Some(dht) = &dht {
         discovery_tasks.push(spawn_dht_lookup(dht.clone(), info_hash, actor_ref.clone()));
      }
      if let Some(announcer) = &announcer {
         for tier in descriptor.tracker_tiers.clone() {
            discovery_tasks.push(spawn_tier_announce(
               announcer.clone(),
               tier,
               info_hash,
               actor_ref.clone(),
            ));
         }
      }

      info!(
         trackers = descriptor.trackers().len(),
         tiers = descriptor.tracker_tiers.len(),
         dht = dht.is_some(),
         "Starting metadata download"
      );

      Ok(Self {
         info_hash,
         our_id,
         state: EngineState::Running,
         registry: PeerRegistry::new(ignored_hosts, external_ip),
         sessions: HashMap::new(),
         available: Vec::new(),
         scheduler: RequestScheduler::new(),
         assembler: None,
         private: false,
         connector,
         dht,
         cache,
         events,
         discovery_tasks,
         actor_ref,
      })
   }
}
