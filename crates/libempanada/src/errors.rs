use thiserror::Error;

#[derive(Error, Debug)]
pub enum HashError {
   #[error("Invalid length: expected {expected} bytes, got {actual}")]
   InvalidLength { expected: usize, actual: usize },

   #[error("Hex decoding error: {0}")]
   HexDecode(#[from] hex::FromHexError),

   #[error("Base32 decoding error: {0}")]
   Base32Decode(#[from] data_encoding::DecodeError),

   #[error("Unrecognized info-hash encoding: {0} characters")]
   UnrecognizedEncoding(usize),
}

#[derive(Error, Debug)]
pub enum MagnetError {
   #[error("Not a magnet URI: missing `magnet:?` prefix")]
   MissingPrefix,

   #[error("Magnet URI has no parsable `xt` topic")]
   MissingTopic,

   #[error("Unsupported exact topic: {0}")]
   UnsupportedTopic(String),

   #[error("Invalid info hash: {0}")]
   InvalidInfoHash(#[from] HashError),
}

#[derive(Error, Debug)]
pub enum EngineError {
   #[error("Metadata download failed: {0}")]
   DownloadFailed(String),

   #[error("Engine was stopped before the download finished")]
   Stopped,

   #[error(transparent)]
   Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum PeerSessionError {
   #[error("Peer link closed: {0}")]
   LinkClosed(String),

   #[error("Handshake encoding error: {0}")]
   HandshakeEncoding(#[from] serde_bencode::Error),

   #[error(transparent)]
   Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum WebSeedError {
   #[error("HTTP request error: {0}")]
   Request(#[from] reqwest::Error),

   #[error("Unexpected HTTP status: {0}")]
   Status(reqwest::StatusCode),
}

#[derive(Error, Debug)]
pub enum CacheError {
   #[error("Cache I/O error: {0}")]
   Io(#[from] std::io::Error),
}
