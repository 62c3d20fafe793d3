use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, trace, warn};

use crate::{errors::CacheError, hashes::InfoHash};

/// On-disk store for verified metadata, keyed by hex info-hash.
///
/// One flat file per torrent, `<hex-info-hash>.torrent`, holding the raw
/// info-dictionary bytes exactly as verified. The cache is best-effort:
/// reads and writes that fail are logged and swallowed, the download always
/// proceeds without it.
#[derive(Debug, Clone)]
pub struct MetadataCache {
   dir: PathBuf,
}

impl Default for MetadataCache {
   fn default() -> Self {
      Self::new(None)
   }
}

impl MetadataCache {
   /// Creates a cache rooted at `dir`, or at a subdirectory of the system
   /// temp directory when unset. The directory is created on demand, not
   /// here.
   pub fn new(dir: Option<PathBuf>) -> Self {
      let dir = dir.unwrap_or_else(|| std::env::temp_dir().join("empanada-metadata"));
      MetadataCache { dir }
   }

   /// The file a given info hash is stored under.
   pub fn entry_path(&self, info_hash: &InfoHash) -> PathBuf {
      self.dir.join(format!("{}.torrent", info_hash.to_hex()))
   }

   /// Reads cached metadata, if present. Never errors: a missing or
   /// unreadable entry is a miss.
   pub async fn read(&self, info_hash: &InfoHash) -> Option<Bytes> {
      let path = self.entry_path(info_hash);
      match fs::read(&path).await {
         Ok(bytes) => {
            debug!(info_hash = %info_hash, len = bytes.len(), "Metadata cache hit");
            Some(Bytes::from(bytes))
         }
         Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            trace!(info_hash = %info_hash, "Metadata cache miss");
            None
         }
         Err(err) => {
            warn!(info_hash = %info_hash, error = %err, "Failed to read metadata cache");
            None
         }
      }
   }

   /// Writes verified metadata under its info hash. Best-effort: failures
   /// are logged, never surfaced.
   pub async fn write(&self, info_hash: &InfoHash, bytes: &[u8]) {
      if let Err(err) = self.try_write(info_hash, bytes).await {
         warn!(info_hash = %info_hash, error = %err, "Failed to write metadata cache");
      }
   }

   /// Writes through a temp file and renames it into place, so concurrent
   /// readers only ever see a complete entry.
   async fn try_write(&self, info_hash: &InfoHash, bytes: &[u8]) -> Result<(), CacheError> {
      fs::create_dir_all(&self.dir).await?;

      let path = self.entry_path(info_hash);
      let staging = path.with_extension("torrent.part");
      fs::write(&staging, bytes).await?;
      fs::rename(&staging, &path).await?;

      debug!(info_hash = %info_hash, len = bytes.len(), "Wrote metadata cache entry");
      Ok(())
   }
}
