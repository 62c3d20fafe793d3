use std::{
   collections::{HashMap, VecDeque},
   time::Duration,
};

use tokio::task::JoinHandle;

use crate::peer::PeerId;

const BASE_TIMEOUT_SECS: u64 = 10;
const RETRY_BACKOFF_SECS: u64 = 5;
const MAX_TIMEOUT_SECS: u64 = 30;

/// Retry counts at or past this threshold are worth a warning; retries
/// themselves never stop.
pub(crate) const RETRY_WARN_THRESHOLD: u32 = 3;

/// Block bookkeeping for the request scheduler.
///
/// Blocks move between exactly three places: the FIFO queue, the in-flight
/// map (keyed by `(peer, block)`, holding the abortable timeout task), and
/// the assembler's completed set. Together they partition `0..N` whenever
/// the metadata size is fixed.
pub(crate) struct RequestScheduler {
   queue: VecDeque<usize>,
   in_flight: HashMap<(PeerId, usize), JoinHandle<()>>,
   retries: HashMap<usize, u32>,
}

impl RequestScheduler {
   pub(crate) fn new() -> Self {
      RequestScheduler {
         queue: VecDeque::new(),
         in_flight: HashMap::new(),
         retries: HashMap::new(),
      }
   }

   /// Queues every block index of a fresh attempt.
   pub(crate) fn fill(&mut self, block_count: usize) {
      self.queue = (0..block_count).collect();
   }

   pub(crate) fn queue_len(&self) -> usize {
      self.queue.len()
   }

   pub(crate) fn in_flight_len(&self) -> usize {
      self.in_flight.len()
   }

   pub(crate) fn pop_front(&mut self) -> Option<usize> {
      self.queue.pop_front()
   }

   pub(crate) fn requeue(&mut self, piece: usize) {
      self.queue.push_back(piece);
   }

   /// Per-block request timeout: 10 s base, 5 s per prior retry, capped at
   /// 30 s.
   pub(crate) fn timeout_for(&self, piece: usize) -> Duration {
      let retries = self.retries.get(&piece).copied().unwrap_or(0) as u64;
      Duration::from_secs((BASE_TIMEOUT_SECS + RETRY_BACKOFF_SECS * retries).min(MAX_TIMEOUT_SECS))
   }

   /// Tracks an issued request under its timer task. At most one timer per
   /// `(peer, block)` key exists; a stale one is aborted first.
   pub(crate) fn track(&mut self, peer: PeerId, piece: usize, timer: JoinHandle<()>) {
      if let Some(stale) = self.in_flight.insert((peer, piece), timer) {
         stale.abort();
      }
   }

   /// Cancels the timer for `(peer, block)`. Returns whether the request
   /// was actually in flight; a late fire for a completed block finds its
   /// key absent and is a no-op.
   pub(crate) fn cancel(&mut self, peer: PeerId, piece: usize) -> bool {
      match self.in_flight.remove(&(peer, piece)) {
         Some(timer) => {
            timer.abort();
            true
         }
         None => false,
      }
   }

   /// Takes a fired timer out of the in-flight map and bumps the block's
   /// retry count. Returns the new count, or `None` when the key was
   /// already gone (the block completed first).
   pub(crate) fn note_timeout(&mut self, peer: PeerId, piece: usize) -> Option<u32> {
      self.in_flight.remove(&(peer, piece))?;
      let count = self.retries.entry(piece).or_insert(0);
      *count += 1;
      Some(*count)
   }

   /// A block completed: its retry history is over.
   pub(crate) fn clear_retry(&mut self, piece: usize) {
      self.retries.remove(&piece);
   }

   /// Cancels every request in flight to a disposed peer and requeues its
   /// blocks. Returns how many blocks went back to the queue.
   pub(crate) fn requeue_peer(&mut self, peer: PeerId) -> usize {
      let keys: Vec<(PeerId, usize)> =
         self.in_flight.keys().filter(|(p, _)| *p == peer).copied().collect();
      for key in &keys {
         if let Some(timer) = self.in_flight.remove(key) {
            timer.abort();
         }
         self.queue.push_back(key.1);
      }
      keys.len()
   }

   /// Cancels all timers and drops all queue and retry state. Used on
   /// whole-download restart and on engine stop.
   pub(crate) fn clear(&mut self) {
      for (_, timer) in self.in_flight.drain() {
         timer.abort();
      }
      self.queue.clear();
      self.retries.clear();
   }
}
