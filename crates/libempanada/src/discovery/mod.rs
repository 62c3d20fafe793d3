//! Peer discovery glue.
//!
//! The DHT node and the tracker announce client are external collaborators;
//! this module owns only the fan-in: driving their lookups, walking tracker
//! tiers in order ([BEP 0012](https://www.bittorrent.org/beps/bep_0012.html)),
//! and funneling every found address into the engine mailbox as a
//! candidate.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use kameo::actor::ActorRef;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use crate::{
   engine::{DownloadActor, DownloadMessage},
   hashes::InfoHash,
   peer::{PeerSource, Transport},
};

/// A running DHT node, consumed as a service.
#[async_trait]
pub trait DhtService: Send + Sync {
   /// Starts a lookup for peers on the given info hash. Batches of found
   /// addresses arrive on the returned channel until the lookup ends or
   /// the DHT is stopped.
   async fn lookup(&self, info_hash: InfoHash) -> mpsc::Receiver<Vec<SocketAddr>>;

   /// Stops the DHT subsystem. Called once when a private torrent is
   /// detected and again (idempotently) when the engine stops.
   async fn stop(&self);
}

/// A tracker announce client, consumed as a service. One announce, one
/// result; retries and tier policy live in this crate.
#[async_trait]
pub trait AnnounceClient: Send + Sync {
   async fn announce(&self, uri: &str, info_hash: InfoHash) -> anyhow::Result<Vec<SocketAddr>>;
}

/// Forwards every DHT batch into the engine mailbox until the engine or the
/// lookup goes away.
pub(crate) fn spawn_dht_lookup(
   dht: Arc<dyn DhtService>, info_hash: InfoHash, engine: ActorRef<DownloadActor>,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      let mut found = dht.lookup(info_hash).await;
      while let Some(addrs) = found.recv().await {
         trace!(count = addrs.len(), "DHT lookup yielded peers");
         let message = DownloadMessage::Candidates {
            addrs,
            source: PeerSource::Dht,
            transport: Transport::Tcp,
         };
         if engine.tell(message).await.is_err() {
            break;
         }
      }
   })
}

/// Announces to one tracker tier: every URI in declared order until one
/// succeeds, per BEP 0012. Later tiers run in their own tasks so a dead
/// tier never starves a healthy one.
pub(crate) fn spawn_tier_announce(
   client: Arc<dyn AnnounceClient>, tier: Vec<String>, info_hash: InfoHash,
   engine: ActorRef<DownloadActor>,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      for uri in tier {
         match client.announce(&uri, info_hash).await {
            Ok(addrs) => {
               debug!(tracker = %uri, count = addrs.len(), "Tracker announce succeeded");
               let message = DownloadMessage::Candidates {
                  addrs,
                  source: PeerSource::Tracker,
                  transport: Transport::Tcp,
               };
               let _ = engine.tell(message).await;
               break;
            }
            Err(err) => {
               debug!(tracker = %uri, error = %err, "Tracker announce failed, trying next in tier");
            }
         }
      }
   })
}
