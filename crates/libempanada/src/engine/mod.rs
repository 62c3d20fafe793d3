//! # Engine
//!
//! The metadata download engine: given a parsed magnet descriptor and the
//! external collaborators (wire connector, DHT, tracker announcer), it
//! discovers peers, negotiates the extension protocol, pulls the info
//! dictionary block by block over `ut_metadata`
//! ([BEP 0009](https://www.bittorrent.org/beps/bep_0009.html)), verifies it
//! against the info hash, and surfaces the verified bytes.
//!
//! ## Overview
//!
//! - A [`MetadataDownload`] is backed by a single `DownloadActor` that owns
//!   every piece of download state; peer sessions, discovery tasks and
//!   request timers all feed its mailbox.
//! - Progress and the terminal outcome arrive on a broadcast event stream,
//!   see [`MetadataDownload::events`] and [`MetadataDownload::wait`].
//! - Verified metadata is cached on disk; a second download of the same
//!   info hash completes from the cache without touching the network.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libempanada::prelude::*;
//!
//! # async fn run(connector: Arc<dyn PeerConnector>, dht: Arc<dyn DhtService>) {
//! let magnet = MagnetUri::parse("magnet:?xt=urn:btih:...").expect("valid magnet URI");
//!
//! let download = MetadataDownload::builder()
//!    .magnet(magnet)
//!    .connector(connector)
//!    .dht(dht)
//!    .start();
//!
//! let metadata = download.wait().await.expect("metadata download failed");
//! println!("info dictionary: {} bytes", metadata.len());
//! # }
//! ```

mod actor;
mod assembler;
mod messages;
mod scheduler;

use std::{
   net::{IpAddr, SocketAddr},
   path::PathBuf,
   sync::{Arc, Mutex},
};

pub(crate) use actor::*;
use bytes::Bytes;
use kameo::{Actor, actor::ActorRef};
pub use assembler::{MAX_DOWNLOAD_ATTEMPTS, METADATA_BLOCK_SIZE};
pub(crate) use messages::*;
use tokio::sync::broadcast;

use crate::{
   cache::MetadataCache,
   discovery::{AnnounceClient, DhtService},
   errors::EngineError,
   hashes::InfoHash,
   magnet::MagnetUri,
   peer::{PeerConnector, PeerId, PeerLink, PeerSource, Transport},
};

/// Progress and outcome notifications for one metadata download.
#[derive(Debug, Clone)]
pub enum MetadataEvent {
   /// Completion percent of the running attempt, emitted in
   /// block-completion order.
   Progress { percent: u8 },
   /// The verified info-dictionary bytes. Terminal.
   Complete { metadata: Bytes },
   /// The download gave up. Terminal.
   Failed { reason: String },
}

const EVENT_CAPACITY: usize = 64;

/// A running metadata download for one info hash.
///
/// Building one starts the engine immediately: the cache is probed, then
/// discovery fans out. Drop the handle or call [`Self::stop`] to abandon
/// the download; both are safe at any time.
pub struct MetadataDownload {
   info_hash: InfoHash,
   actor: ActorRef<DownloadActor>,
   /// The receiver created before the engine spawned: the first
   /// subscriber gets every event, including a cache-hit completion.
   primary_events: Mutex<Option<broadcast::Receiver<MetadataEvent>>>,
   tap: Mutex<broadcast::Receiver<MetadataEvent>>,
}

#[bon::bon]
impl MetadataDownload {
   /// Configures and starts a metadata download.
   #[builder(finish_fn = start)]
   pub fn new(
      /// Parsed magnet descriptor naming the info hash, trackers and
      /// seeds.
      magnet: MagnetUri,
      /// Dials peers and runs the wire handshake.
      connector: Arc<dyn PeerConnector>,
      /// DHT service for peer discovery. Omit to run tracker-only.
      dht: Option<Arc<dyn DhtService>>,
      /// Tracker announce client. Omit to run DHT-only.
      announcer: Option<Arc<dyn AnnounceClient>>,
      /// Directory for the verified-metadata cache. Defaults to a
      /// subdirectory of the system temp directory.
      cache_dir: Option<PathBuf>,
      /// Our own external IP; candidates with this host are refused.
      external_ip: Option<IpAddr>,
      /// Hosts never dialed, in addition to the unspecified and loopback
      /// addresses.
      ignored_hosts: Option<Vec<IpAddr>>,
      /// Peer id sent in wire handshakes.
      #[builder(default)]
      custom_id: PeerId,
   ) -> Self {
      let (events, primary) = broadcast::channel(EVENT_CAPACITY);
      let tap = events.subscribe();
      let info_hash = magnet.info_hash;

      let actor = DownloadActor::spawn(DownloadActorArgs {
         descriptor: magnet,
         our_id: custom_id,
         connector,
         dht,
         announcer,
         cache: MetadataCache::new(cache_dir),
         ignored_hosts: ignored_hosts.unwrap_or_default(),
         external_ip,
         events,
      });

      MetadataDownload {
         info_hash,
         actor,
         primary_events: Mutex::new(Some(primary)),
         tap: Mutex::new(tap),
      }
   }

   pub fn info_hash(&self) -> InfoHash {
      self.info_hash
   }

   /// Whether the engine is still running. False once the download
   /// completed, failed, or was stopped.
   pub fn is_running(&self) -> bool {
      self.actor.is_alive()
   }

   /// Subscribes to the event stream. The first call returns a receiver
   /// that has seen every event since the start; later calls only see
   /// events from now on.
   pub fn events(&self) -> broadcast::Receiver<MetadataEvent> {
      if let Some(primary) = self.primary_events.lock().expect("event lock poisoned").take() {
         return primary;
      }
      self.tap.lock().expect("event lock poisoned").resubscribe()
   }

   /// Waits for the terminal outcome: the verified metadata bytes, or the
   /// failure that ended the download.
   pub async fn wait(&self) -> Result<Bytes, EngineError> {
      let mut events = self.events();
      loop {
         match events.recv().await {
            Ok(MetadataEvent::Complete { metadata }) => return Ok(metadata),
            Ok(MetadataEvent::Failed { reason }) => return Err(EngineError::DownloadFailed(reason)),
            Ok(MetadataEvent::Progress { .. }) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Err(EngineError::Stopped),
         }
      }
   }

   /// Stops the engine: cancels timers, disposes peers, stops the DHT and
   /// the discovery tasks. Safe to call any number of times.
   pub async fn stop(&self) {
      if !self.actor.is_alive() {
         return;
      }
      let _ = self.actor.tell(DownloadMessage::Stop).await;
   }

   /// Completion percent of the running attempt; 0 before any peer
   /// announced a metadata size, or once the engine is gone.
   pub async fn progress(&self) -> u8 {
      match self.actor.ask(DownloadRequest::Progress).await {
         Ok(DownloadResponse::Progress(percent)) => percent,
         _ => 0,
      }
   }

   /// Number of live peer sessions.
   pub async fn peer_count(&self) -> usize {
      match self.actor.ask(DownloadRequest::PeerCount).await {
         Ok(DownloadResponse::PeerCount(count)) => count,
         _ => 0,
      }
   }

   /// Whether a peer has marked this torrent private.
   pub async fn is_private(&self) -> bool {
      match self.actor.ask(DownloadRequest::IsPrivate).await {
         Ok(DownloadResponse::IsPrivate(private)) => private,
         _ => false,
      }
   }

   /// Manually injects a candidate address, as if a discovery source had
   /// found it. Useful for tests and for peers learned out of band.
   pub async fn add_peer(&self, addr: SocketAddr, source: PeerSource, transport: Transport) {
      let message = DownloadMessage::Candidates {
         addrs: vec![addr],
         source,
         transport,
      };
      let _ = self.actor.tell(message).await;
   }

   /// Hands an inbound, wire-handshaken connection to the engine.
   pub async fn incoming_peer(
      &self, peer_id: PeerId, addr: SocketAddr, transport: Transport, link: Box<dyn PeerLink>,
   ) {
      let message = DownloadMessage::IncomingPeer {
         peer_id,
         addr,
         transport,
         link,
      };
      let _ = self.actor.tell(message).await;
   }
}

#[cfg(test)]
mod tests {
   use std::{
      collections::BTreeMap,
      sync::atomic::{AtomicBool, AtomicUsize, Ordering},
      time::Duration,
   };

   use async_trait::async_trait;
   use serde_bytes::ByteBuf;
   use sha1::{Digest, Sha1};
   use tokio::sync::mpsc;

   use super::*;
   use crate::{
      peer::LinkEvent,
      protocol::{
         EXTENSION_HANDSHAKE_ID, ExchangeHeader, ExchangeKind, ExtendedHandshake,
         MetadataExchange, PexMessage, UT_METADATA_LOCAL_ID, UT_PEX_LOCAL_ID,
      },
   };

   /// The id the scripted peer registers for ut_metadata in its handshake.
   const PEER_UT_METADATA_ID: u8 = 7;

   fn hash_of(data: &[u8]) -> InfoHash {
      let mut hasher = Sha1::new();
      hasher.update(data);
      let digest: [u8; 20] = hasher.finalize().into();
      InfoHash::new(digest)
   }

   fn patterned(len: usize) -> Vec<u8> {
      (0..len).map(|i| (i % 251) as u8).collect()
   }

   fn bare_magnet(info_hash: InfoHash) -> MagnetUri {
      MagnetUri {
         info_hash,
         display_name: None,
         exact_length: None,
         tracker_tiers: Vec::new(),
         web_seeds: Vec::new(),
         acceptable_sources: Vec::new(),
         selected_file_indices: None,
      }
   }

   fn scratch_dir(tag: &str) -> PathBuf {
      std::env::temp_dir().join(format!("empanada-engine-test-{tag}-{}", std::process::id()))
   }

   /// A wire connector whose peers serve a fixed info dictionary over
   /// ut_metadata, optionally corrupting every block, optionally flagging
   /// the torrent private and gossiping one PEX entry.
   struct ScriptedSeeder {
      metadata: Arc<Vec<u8>>,
      corrupt: bool,
      private: bool,
      pex_added: Option<Vec<u8>>,
      connects: Arc<AtomicUsize>,
   }

   #[async_trait]
   impl PeerConnector for ScriptedSeeder {
      async fn connect(
         &self, _addr: SocketAddr, _transport: Transport,
      ) -> anyhow::Result<(PeerId, Box<dyn PeerLink>)> {
         let n = self.connects.fetch_add(1, Ordering::SeqCst);
         let mut id = *b"-SS0100-scriptedpeer";
         id[19] = b'0' + (n % 10) as u8;

         let (feedback, incoming) = mpsc::unbounded_channel();
         let link = ScriptedLink {
            incoming,
            feedback,
            metadata: self.metadata.clone(),
            corrupt: self.corrupt,
            private: self.private,
            pex_added: self.pex_added.clone(),
         };
         Ok((PeerId::from(id), Box::new(link)))
      }
   }

   struct ScriptedLink {
      incoming: mpsc::UnboundedReceiver<LinkEvent>,
      feedback: mpsc::UnboundedSender<LinkEvent>,
      metadata: Arc<Vec<u8>>,
      corrupt: bool,
      private: bool,
      pex_added: Option<Vec<u8>>,
   }

   #[async_trait]
   impl crate::peer::PeerLink for ScriptedLink {
      async fn send_extended(&mut self, ext_id: u8, payload: Bytes) -> anyhow::Result<()> {
         if ext_id == EXTENSION_HANDSHAKE_ID {
            let mut extensions = BTreeMap::new();
            extensions.insert("ut_metadata".to_string(), PEER_UT_METADATA_ID);
            let handshake = ExtendedHandshake {
               extensions: Some(extensions),
               metadata_size: Some(self.metadata.len()),
               private: self.private.then_some(true),
               ..Default::default()
            };
            let _ = self.feedback.send(LinkEvent::Extended {
               ext_id: EXTENSION_HANDSHAKE_ID,
               payload: handshake.to_bytes().unwrap(),
            });

            if let Some(added) = self.pex_added.take() {
               let pex = PexMessage {
                  added: Some(ByteBuf::from(added)),
                  ..Default::default()
               };
               let _ = self.feedback.send(LinkEvent::Extended {
                  ext_id: UT_PEX_LOCAL_ID,
                  payload: pex.to_bytes().unwrap(),
               });
            }
         } else if ext_id == PEER_UT_METADATA_ID {
            if let Some(MetadataExchange::Request { piece }) = MetadataExchange::from_bytes(&payload)
            {
               let start = piece * METADATA_BLOCK_SIZE;
               let end = (start + METADATA_BLOCK_SIZE).min(self.metadata.len());
               let mut block = self.metadata[start..end].to_vec();
               if self.corrupt {
                  block[0] ^= 0xff;
               }

               let header = ExchangeHeader {
                  msg_type: ExchangeKind::Piece,
                  piece,
                  total_size: Some(self.metadata.len()),
               };
               let mut out = serde_bencode::to_bytes(&header).unwrap();
               out.extend_from_slice(&block);
               let _ = self.feedback.send(LinkEvent::Extended {
                  ext_id: UT_METADATA_LOCAL_ID,
                  payload: out.into(),
               });
            }
         }
         Ok(())
      }

      async fn recv(&mut self) -> anyhow::Result<LinkEvent> {
         match self.incoming.recv().await {
            Some(event) => Ok(event),
            None => Ok(LinkEvent::Closed),
         }
      }
   }

   /// A connector for downloads that must never reach the network.
   struct NeverConnector;

   #[async_trait]
   impl PeerConnector for NeverConnector {
      async fn connect(
         &self, addr: SocketAddr, _transport: Transport,
      ) -> anyhow::Result<(PeerId, Box<dyn PeerLink>)> {
         anyhow::bail!("refusing to dial {addr}")
      }
   }

   struct FakeDht {
      peers: Vec<SocketAddr>,
      stopped: Arc<AtomicBool>,
   }

   #[async_trait]
   impl DhtService for FakeDht {
      async fn lookup(&self, _info_hash: InfoHash) -> mpsc::Receiver<Vec<SocketAddr>> {
         let (tx, rx) = mpsc::channel(4);
         let peers = self.peers.clone();
         tokio::spawn(async move {
            let _ = tx.send(peers).await;
         });
         rx
      }

      async fn stop(&self) {
         self.stopped.store(true, Ordering::SeqCst);
      }
   }

   async fn drain_until_terminal(
      events: &mut broadcast::Receiver<MetadataEvent>,
   ) -> (Vec<u8>, Option<Bytes>, Option<String>) {
      let mut progress = Vec::new();
      loop {
         let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("engine made no progress")
            .expect("event stream closed early");
         match event {
            MetadataEvent::Progress { percent } => progress.push(percent),
            MetadataEvent::Complete { metadata } => return (progress, Some(metadata), None),
            MetadataEvent::Failed { reason } => return (progress, None, Some(reason)),
         }
      }
   }

   #[tokio::test(flavor = "multi_thread")]
   async fn test_two_block_download_completes_and_caches() {
      let metadata = patterned(2 * METADATA_BLOCK_SIZE);
      let info_hash = hash_of(&metadata);
      let cache_dir = scratch_dir("complete");
      let connects = Arc::new(AtomicUsize::new(0));

      let download = MetadataDownload::builder()
         .magnet(bare_magnet(info_hash))
         .connector(Arc::new(ScriptedSeeder {
            metadata: Arc::new(metadata.clone()),
            corrupt: false,
            private: false,
            pex_added: None,
            connects: connects.clone(),
         }))
         .dht(Arc::new(FakeDht {
            peers: vec!["10.1.1.1:6881".parse().unwrap()],
            stopped: Arc::new(AtomicBool::new(false)),
         }))
         .cache_dir(cache_dir.clone())
         .start();

      let mut events = download.events();
      let (progress, complete, failed) = drain_until_terminal(&mut events).await;

      assert_eq!(failed, None);
      assert_eq!(progress, vec![50, 100]);
      let delivered = complete.unwrap();
      assert_eq!(&delivered[..], &metadata[..]);

      // The verified bytes landed in the cache under the hex info hash.
      let cache = MetadataCache::new(Some(cache_dir.clone()));
      let cached = tokio::fs::read(cache.entry_path(&info_hash)).await.unwrap();
      assert_eq!(cached, metadata);

      assert_eq!(connects.load(Ordering::SeqCst), 1);
      tokio::fs::remove_dir_all(cache_dir).await.ok();
   }

   #[tokio::test(flavor = "multi_thread")]
   async fn test_corrupted_metadata_fails_after_three_attempts() {
      let metadata = patterned(2 * METADATA_BLOCK_SIZE);
      let info_hash = hash_of(&metadata);
      let cache_dir = scratch_dir("corrupt");

      let download = MetadataDownload::builder()
         .magnet(bare_magnet(info_hash))
         .connector(Arc::new(ScriptedSeeder {
            metadata: Arc::new(metadata),
            corrupt: true,
            private: false,
            pex_added: None,
            connects: Arc::new(AtomicUsize::new(0)),
         }))
         .cache_dir(cache_dir.clone())
         .start();

      let mut events = download.events();
      download
         .add_peer("10.1.1.2:6881".parse().unwrap(), PeerSource::Tracker, Transport::Tcp)
         .await;

      let (progress, complete, failed) = drain_until_terminal(&mut events).await;

      assert!(complete.is_none());
      assert!(failed.is_some());
      // Three full attempts, each walking the download to 100%.
      let full_attempts = progress.iter().filter(|percent| **percent == 100).count();
      assert_eq!(full_attempts, 3);

      // Nothing was cached.
      let cache = MetadataCache::new(Some(cache_dir.clone()));
      assert!(tokio::fs::read(cache.entry_path(&info_hash)).await.is_err());
      tokio::fs::remove_dir_all(cache_dir).await.ok();
   }

   #[tokio::test(flavor = "multi_thread")]
   async fn test_cache_hit_completes_without_network() {
      let metadata = patterned(METADATA_BLOCK_SIZE + 5);
      let info_hash = hash_of(&metadata);
      let cache_dir = scratch_dir("cache-hit");

      let cache = MetadataCache::new(Some(cache_dir.clone()));
      cache.write(&info_hash, &metadata).await;

      let download = MetadataDownload::builder()
         .magnet(bare_magnet(info_hash))
         .connector(Arc::new(NeverConnector))
         .cache_dir(cache_dir.clone())
         .start();

      let delivered = download.wait().await.expect("cache hit should complete");
      assert_eq!(&delivered[..], &metadata[..]);

      tokio::fs::remove_dir_all(cache_dir).await.ok();
   }

   #[tokio::test(flavor = "multi_thread")]
   async fn test_stop_is_idempotent() {
      let metadata = patterned(METADATA_BLOCK_SIZE);
      let download = MetadataDownload::builder()
         .magnet(bare_magnet(hash_of(&metadata)))
         .connector(Arc::new(NeverConnector))
         .cache_dir(scratch_dir("stop"))
         .start();

      download.stop().await;
      download.stop().await;

      assert!(matches!(download.wait().await, Err(EngineError::Stopped)));
      assert!(!download.is_running());
      download.stop().await;
   }

   #[tokio::test(flavor = "multi_thread")]
   async fn test_private_handshake_disables_dht_and_pex() {
      let metadata = patterned(METADATA_BLOCK_SIZE);
      let info_hash = hash_of(&metadata);
      let connects = Arc::new(AtomicUsize::new(0));
      let dht_stopped = Arc::new(AtomicBool::new(false));

      // The peer marks the torrent private and then gossips another peer
      // over PEX; the engine must take the metadata but never dial the
      // gossiped address.
      let download = MetadataDownload::builder()
         .magnet(bare_magnet(info_hash))
         .connector(Arc::new(ScriptedSeeder {
            metadata: Arc::new(metadata.clone()),
            corrupt: false,
            private: true,
            pex_added: Some(vec![10, 2, 2, 2, 0x1a, 0xe1]),
            connects: connects.clone(),
         }))
         .dht(Arc::new(FakeDht {
            peers: vec!["10.1.1.3:6881".parse().unwrap()],
            stopped: dht_stopped.clone(),
         }))
         .cache_dir(scratch_dir("private"))
         .start();

      let delivered = download.wait().await.expect("private download should still complete");
      assert_eq!(&delivered[..], &metadata[..]);

      // Give the rejected PEX candidate time to (not) connect.
      tokio::time::sleep(Duration::from_millis(200)).await;
      assert_eq!(connects.load(Ordering::SeqCst), 1);
      assert!(dht_stopped.load(Ordering::SeqCst));

      tokio::fs::remove_dir_all(scratch_dir("private")).await.ok();
   }
}
