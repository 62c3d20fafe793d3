use std::collections::HashSet;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{trace, warn};

use crate::hashes::InfoHash;

/// Metadata is exchanged in 16 KiB blocks, per [BEP 0009](https://www.bittorrent.org/beps/bep_0009.html).
/// Only the last block of an info dictionary may be shorter.
pub const METADATA_BLOCK_SIZE: usize = 16 * 1024;

/// How many whole-download attempts are made before giving up on an
/// info hash whose assembled bytes keep failing verification.
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

/// What became of a delivered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOutcome {
   /// Late, duplicate, out of range, or mis-sized: dropped without effect.
   Ignored,
   /// Copied into the buffer; completion is now at `percent`.
   Accepted { percent: u8 },
}

/// Collects metadata blocks into a contiguous buffer and gates completion
/// on a SHA-1 match against the info hash.
///
/// The metadata size is fixed for the assembler's lifetime; it is created
/// only once the first extended handshake announces one. A verification
/// mismatch rolls the whole attempt back -- every block is re-downloaded,
/// up to [`MAX_DOWNLOAD_ATTEMPTS`] times.
pub(crate) struct MetadataAssembler {
   info_hash: InfoHash,
   buffer: Vec<u8>,
   completed: HashSet<usize>,
   attempt: u32,
}

impl MetadataAssembler {
   pub(crate) fn new(info_hash: InfoHash, metadata_size: usize) -> Self {
      MetadataAssembler {
         info_hash,
         buffer: vec![0u8; metadata_size],
         completed: HashSet::new(),
         attempt: 0,
      }
   }

   pub(crate) fn metadata_size(&self) -> usize {
      self.buffer.len()
   }

   /// Number of blocks, `ceil(metadata_size / 16 KiB)`.
   pub(crate) fn block_count(&self) -> usize {
      self.buffer.len().div_ceil(METADATA_BLOCK_SIZE)
   }

   /// Byte length of block `piece`; the last block is naturally shorter.
   fn block_span(&self, piece: usize) -> usize {
      METADATA_BLOCK_SIZE.min(self.buffer.len() - piece * METADATA_BLOCK_SIZE)
   }

   pub(crate) fn is_complete(&self) -> bool {
      self.completed.len() >= self.block_count()
   }

   pub(crate) fn is_block_completed(&self, piece: usize) -> bool {
      self.completed.contains(&piece)
   }

   pub(crate) fn percent(&self) -> u8 {
      (100 * self.completed.len() / self.block_count()) as u8
   }

   pub(crate) fn attempt(&self) -> u32 {
      self.attempt
   }

   /// Copies a delivered block into the buffer. Each block lands exactly
   /// once per attempt; anything late, repeated, out of range, or of the
   /// wrong length is ignored.
   pub(crate) fn accept(&mut self, piece: usize, data: &[u8]) -> BlockOutcome {
      if self.is_complete() {
         trace!(piece, "Ignoring block for already complete metadata");
         return BlockOutcome::Ignored;
      }
      if piece >= self.block_count() {
         trace!(piece, blocks = self.block_count(), "Ignoring out-of-range block index");
         return BlockOutcome::Ignored;
      }
      if self.completed.contains(&piece) {
         trace!(piece, "Ignoring duplicate block");
         return BlockOutcome::Ignored;
      }

      let span = self.block_span(piece);
      if data.len() != span {
         warn!(piece, expected = span, actual = data.len(), "Ignoring mis-sized block");
         return BlockOutcome::Ignored;
      }

      let start = piece * METADATA_BLOCK_SIZE;
      self.buffer[start..start + span].copy_from_slice(data);
      self.completed.insert(piece);

      BlockOutcome::Accepted { percent: self.percent() }
   }

   /// SHA-1 of the assembled buffer against the info hash.
   pub(crate) fn verify(&self) -> bool {
      let mut hasher = Sha1::new();
      hasher.update(&self.buffer);
      let digest: [u8; 20] = hasher.finalize().into();
      digest == *self.info_hash.as_bytes()
   }

   /// Rolls the download back for another attempt after a verification
   /// failure. Returns false once the attempt budget is spent.
   pub(crate) fn restart(&mut self) -> bool {
      self.attempt += 1;
      if self.attempt >= MAX_DOWNLOAD_ATTEMPTS {
         return false;
      }

      self.completed.clear();
      self.buffer.fill(0);
      true
   }

   /// A copy of the verified bytes.
   pub(crate) fn bytes(&self) -> Bytes {
      Bytes::copy_from_slice(&self.buffer)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn hash_of(data: &[u8]) -> InfoHash {
      let mut hasher = Sha1::new();
      hasher.update(data);
      let digest: [u8; 20] = hasher.finalize().into();
      InfoHash::new(digest)
   }

   fn patterned(len: usize) -> Vec<u8> {
      (0..len).map(|i| (i % 251) as u8).collect()
   }

   #[test]
   fn test_block_count_at_exact_multiple() {
      let metadata = patterned(2 * METADATA_BLOCK_SIZE);
      let assembler = MetadataAssembler::new(hash_of(&metadata), metadata.len());
      assert_eq!(assembler.block_count(), 2);
      assert_eq!(assembler.block_span(1), METADATA_BLOCK_SIZE);
   }

   #[test]
   fn test_block_count_one_past_multiple() {
      let metadata = patterned(2 * METADATA_BLOCK_SIZE + 1);
      let assembler = MetadataAssembler::new(hash_of(&metadata), metadata.len());
      assert_eq!(assembler.block_count(), 3);
      assert_eq!(assembler.block_span(2), 1);
   }

   #[test]
   fn test_accept_and_verify_in_any_order() {
      let metadata = patterned(METADATA_BLOCK_SIZE + 100);
      let mut assembler = MetadataAssembler::new(hash_of(&metadata), metadata.len());

      // Last block first: progress events follow completion order.
      assert_eq!(
         assembler.accept(1, &metadata[METADATA_BLOCK_SIZE..]),
         BlockOutcome::Accepted { percent: 50 }
      );
      assert_eq!(
         assembler.accept(0, &metadata[..METADATA_BLOCK_SIZE]),
         BlockOutcome::Accepted { percent: 100 }
      );

      assert!(assembler.is_complete());
      assert!(assembler.verify());
      assert_eq!(&assembler.bytes()[..], &metadata[..]);
   }

   #[test]
   fn test_duplicate_and_out_of_range_blocks_ignored() {
      let metadata = patterned(METADATA_BLOCK_SIZE);
      let mut assembler = MetadataAssembler::new(hash_of(&metadata), metadata.len());

      assert_eq!(assembler.accept(5, &metadata[..]), BlockOutcome::Ignored);
      assert!(matches!(assembler.accept(0, &metadata[..]), BlockOutcome::Accepted { .. }));
      assert_eq!(assembler.accept(0, &metadata[..]), BlockOutcome::Ignored);
   }

   #[test]
   fn test_mis_sized_block_ignored() {
      let metadata = patterned(METADATA_BLOCK_SIZE);
      let mut assembler = MetadataAssembler::new(hash_of(&metadata), metadata.len());
      assert_eq!(assembler.accept(0, &metadata[..100]), BlockOutcome::Ignored);
      assert!(!assembler.is_block_completed(0));
   }

   #[test]
   fn test_verification_mismatch_and_restart_budget() {
      let metadata = patterned(METADATA_BLOCK_SIZE);
      let mut corrupted = metadata.clone();
      corrupted[0] ^= 0xff;

      let mut assembler = MetadataAssembler::new(hash_of(&metadata), metadata.len());
      assembler.accept(0, &corrupted);
      assert!(assembler.is_complete());
      assert!(!assembler.verify());

      // First two restarts roll back and keep going.
      assert!(assembler.restart());
      assert!(!assembler.is_complete());
      assert_eq!(assembler.attempt(), 1);
      assembler.accept(0, &corrupted);
      assert!(assembler.restart());

      // Third failed attempt exhausts the budget.
      assembler.accept(0, &corrupted);
      assert!(!assembler.restart());
   }

   #[test]
   fn test_restart_zeroes_buffer() {
      let metadata = patterned(METADATA_BLOCK_SIZE);
      let mut assembler = MetadataAssembler::new(hash_of(&metadata), metadata.len());
      assembler.accept(0, &metadata);
      assert!(assembler.restart());
      assert!(assembler.bytes().iter().all(|b| *b == 0));
   }
}
