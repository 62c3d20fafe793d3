use std::{
   collections::BTreeMap,
   net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};
use serde_with::{BoolFromInt, serde_as};
use tracing::trace;

/// Extended message id of the extension handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The id this client registers for `ut_metadata` in its `m` dictionary.
/// Peers address their metadata messages to us with this id.
pub const UT_METADATA_LOCAL_ID: u8 = 2;
/// The id this client registers for `ut_pex`.
pub const UT_PEX_LOCAL_ID: u8 = 3;
/// The id this client registers for `ut_holepunch`.
pub const UT_HOLEPUNCH_LOCAL_ID: u8 = 4;

/// The payload of the extension handshake as described in [BEP 0010](https://www.bittorrent.org/beps/bep_0010.html).
///
/// All fields are optional on the wire. `metadata_size` and `private` are
/// the two fields this crate acts on: the former fixes the download size
/// ([BEP 0009](https://www.bittorrent.org/beps/bep_0009.html)), the latter
/// flips the engine into private-torrent mode
/// ([BEP 0027](https://www.bittorrent.org/beps/bep_0027.html)).
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedHandshake {
   /// Dictionary of extension messages: maps extension names to the
   /// extended message id the *sending* side listens on. An id of 0 means
   /// the extension is disabled. Unrecognized names must be ignored.
   #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
   pub extensions: Option<BTreeMap<String, u8>>,

   /// Number of bytes of the info dictionary, per BEP 0009. Only meaningful
   /// in the initial handshake.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub metadata_size: Option<usize>,

   /// Local TCP listen port of the sending side.
   #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
   pub local_port: Option<u16>,

   /// Client name and version (UTF-8 string).
   #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
   pub client: Option<String>,

   /// The IP address the sending peer sees us as: 4 or 16 raw bytes, no
   /// port.
   #[serde(
      rename = "yourip",
      with = "yourip_bytes",
      skip_serializing_if = "Option::is_none",
      default
   )]
   pub your_ip: Option<IpAddr>,

   /// The number of outstanding request messages this client supports
   /// without dropping any.
   #[serde(rename = "reqq", default, skip_serializing_if = "Option::is_none")]
   pub outstanding_requests: Option<usize>,

   /// `1` marks a private torrent: peer discovery must go through the
   /// trackers named in the metainfo only.
   #[serde_as(as = "Option<BoolFromInt>")]
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub private: Option<bool>,
}

impl ExtendedHandshake {
   /// The handshake this client sends: its extension registrations plus a
   /// client version string.
   pub fn local() -> Self {
      let mut extensions = BTreeMap::new();
      extensions.insert("ut_metadata".to_string(), UT_METADATA_LOCAL_ID);
      extensions.insert("ut_pex".to_string(), UT_PEX_LOCAL_ID);
      extensions.insert("ut_holepunch".to_string(), UT_HOLEPUNCH_LOCAL_ID);

      ExtendedHandshake {
         extensions: Some(extensions),
         client: Some(concat!("empanada ", env!("CARGO_PKG_VERSION")).to_string()),
         ..Default::default()
      }
   }

   pub fn to_bytes(&self) -> Result<Bytes, serde_bencode::Error> {
      serde_bencode::to_bytes(self).map(Bytes::from)
   }

   pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
      serde_bencode::from_bytes(bytes)
   }

   fn extension_id(&self, name: &str) -> Option<u8> {
      self
         .extensions
         .as_ref()
         .and_then(|m| m.get(name).copied())
         .filter(|id| *id != 0)
   }

   /// The id to address `ut_metadata` messages to on the sending side, if
   /// it supports the extension.
   pub fn ut_metadata_id(&self) -> Option<u8> {
      self.extension_id("ut_metadata")
   }

   pub fn ut_pex_id(&self) -> Option<u8> {
      self.extension_id("ut_pex")
   }

   pub fn ut_holepunch_id(&self) -> Option<u8> {
      self.extension_id("ut_holepunch")
   }

   pub fn is_private(&self) -> bool {
      self.private == Some(true)
   }
}

/// `msg_type` values of a `ut_metadata` message, per [BEP 0009](https://www.bittorrent.org/beps/bep_0009.html).
///
/// An unrecognized message type MUST be ignored in order to support future
/// extensibility.
#[derive(
   Serialize_repr,
   Deserialize_repr,
   TryFromPrimitive,
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq
)]
#[repr(u8)]
pub enum ExchangeKind {
   Request = 0u8,
   Piece = 1u8,
   Reject = 2u8,
}

/// The bencoded prefix of a `ut_metadata` message. For piece messages the
/// raw block bytes follow immediately after this dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeHeader {
   pub msg_type: ExchangeKind,
   pub piece: usize,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub total_size: Option<usize>,
}

/// A decoded `ut_metadata` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataExchange {
   Request { piece: usize },
   Piece { piece: usize, total_size: Option<usize>, data: Bytes },
   Reject { piece: usize },
}

impl MetadataExchange {
   /// Decodes a `ut_metadata` payload.
   ///
   /// The header dictionary carries only integer values, so it ends at the
   /// first two consecutive bencode end-markers; everything after them is
   /// the raw block of a piece message. Payloads where that boundary cannot
   /// be located, or whose header does not parse, yield `None` and are
   /// ignored by the caller.
   pub fn from_bytes(payload: &Bytes) -> Option<Self> {
      let boundary = header_end(payload)?;
      let header: ExchangeHeader = serde_bencode::from_bytes(&payload[..boundary]).ok()?;

      Some(match header.msg_type {
         ExchangeKind::Request => MetadataExchange::Request { piece: header.piece },
         ExchangeKind::Piece => MetadataExchange::Piece {
            piece: header.piece,
            total_size: header.total_size,
            data: payload.slice(boundary..),
         },
         ExchangeKind::Reject => MetadataExchange::Reject { piece: header.piece },
      })
   }

   /// Encodes a request for metadata block `piece`: the only `ut_metadata`
   /// message this client produces.
   pub fn request_bytes(piece: usize) -> Bytes {
      let header = ExchangeHeader {
         msg_type: ExchangeKind::Request,
         piece,
         total_size: None,
      };
      // A three-integer dictionary always bencodes.
      Bytes::from(serde_bencode::to_bytes(&header).expect("request header must encode"))
   }
}

/// Index just past the first `ee` in the payload, which terminates an
/// integers-only header dictionary.
fn header_end(payload: &[u8]) -> Option<usize> {
   payload.windows(2).position(|pair| pair == b"ee").map(|at| at + 2)
}

/// Bit flags attached to `ut_pex` `added.f` entries.
pub const PEX_PREFERS_ENCRYPTION: u8 = 0x01;
pub const PEX_SEED_ONLY: u8 = 0x02;
pub const PEX_SUPPORTS_UTP: u8 = 0x04;
pub const PEX_SUPPORTS_HOLEPUNCH: u8 = 0x08;
pub const PEX_REACHABLE: u8 = 0x10;

/// A `ut_pex` message, per [BEP 0011](https://www.bittorrent.org/beps/bep_0011.html):
/// compact peer lists plus parallel flag bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PexMessage {
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub added: Option<ByteBuf>,
   #[serde(rename = "added.f", default, skip_serializing_if = "Option::is_none")]
   pub added_flags: Option<ByteBuf>,
   #[serde(rename = "added6", default, skip_serializing_if = "Option::is_none")]
   pub added6: Option<ByteBuf>,
   #[serde(rename = "added6.f", default, skip_serializing_if = "Option::is_none")]
   pub added6_flags: Option<ByteBuf>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub dropped: Option<ByteBuf>,
}

/// A peer advertised through PEX, with its flag byte (0 when the sender
/// attached no flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PexPeer {
   pub addr: SocketAddr,
   pub flags: u8,
}

impl PexPeer {
   pub fn supports_utp(&self) -> bool {
      self.flags & PEX_SUPPORTS_UTP != 0
   }

   pub fn supports_holepunch(&self) -> bool {
      self.flags & PEX_SUPPORTS_HOLEPUNCH != 0
   }

   pub fn reachable(&self) -> bool {
      self.flags & PEX_REACHABLE != 0
   }

   /// True when the peer cannot be dialed directly but advertises uTP and
   /// hole-punch support, so a rendezvous through the delivering peer is
   /// the only way in.
   pub fn needs_rendezvous(&self) -> bool {
      !self.reachable() && self.supports_utp() && self.supports_holepunch()
   }
}

impl PexMessage {
   pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
      serde_bencode::from_bytes(bytes)
   }

   pub fn to_bytes(&self) -> Result<Bytes, serde_bencode::Error> {
      serde_bencode::to_bytes(self).map(Bytes::from)
   }

   /// All `added` entries, IPv4 then IPv6, paired with their flag bytes.
   /// Truncated trailing entries are dropped.
   pub fn added_peers(&self) -> Vec<PexPeer> {
      let mut peers = Vec::new();

      if let Some(compact) = &self.added {
         let flags: &[u8] = self.added_flags.as_ref().map(|f| f.as_slice()).unwrap_or(&[]);
         for (i, entry) in compact.chunks_exact(6).enumerate() {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            peers.push(PexPeer {
               addr: SocketAddr::new(IpAddr::V4(ip), port),
               flags: flags.get(i).copied().unwrap_or(0),
            });
         }
      }

      if let Some(compact) = &self.added6 {
         let flags: &[u8] = self.added6_flags.as_ref().map(|f| f.as_slice()).unwrap_or(&[]);
         for (i, entry) in compact.chunks_exact(18).enumerate() {
            let octets: [u8; 16] = entry[..16].try_into().expect("chunk is 18 bytes");
            let port = u16::from_be_bytes([entry[16], entry[17]]);
            peers.push(PexPeer {
               addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
               flags: flags.get(i).copied().unwrap_or(0),
            });
         }
      }

      peers
   }
}

/// A `ut_holepunch` message, per [BEP 0055](https://www.bittorrent.org/beps/bep_0055.html).
///
/// This client produces rendezvous requests and acts on connect messages;
/// everything else is decoded and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolePunchMessage {
   /// Ask the receiving peer to relay a rendezvous to the target endpoint.
   Rendezvous(SocketAddr),
   /// The relaying peer instructs both sides to connect to the endpoint.
   Connect(SocketAddr),
   /// The rendezvous failed with the given error code.
   Error(u32),
}

const HOLEPUNCH_RENDEZVOUS: u8 = 0;
const HOLEPUNCH_CONNECT: u8 = 1;
const HOLEPUNCH_ERROR: u8 = 2;

impl HolePunchMessage {
   /// Serializes into the fixed BEP 0055 frame:
   /// `msg_type (1) | addr_type (1) | addr (4/16) | port (2) | err (4)`.
   pub fn to_bytes(&self) -> Bytes {
      let (kind, addr, err) = match self {
         HolePunchMessage::Rendezvous(addr) => (HOLEPUNCH_RENDEZVOUS, Some(*addr), 0),
         HolePunchMessage::Connect(addr) => (HOLEPUNCH_CONNECT, Some(*addr), 0),
         HolePunchMessage::Error(code) => (HOLEPUNCH_ERROR, None, *code),
      };

      let mut frame = BytesMut::with_capacity(24);
      frame.put_u8(kind);
      match addr {
         Some(SocketAddr::V4(v4)) => {
            frame.put_u8(0);
            frame.put_slice(&v4.ip().octets());
            frame.put_u16(v4.port());
         }
         Some(SocketAddr::V6(v6)) => {
            frame.put_u8(1);
            frame.put_slice(&v6.ip().octets());
            frame.put_u16(v6.port());
         }
         None => {
            frame.put_u8(0);
            frame.put_slice(&[0u8; 4]);
            frame.put_u16(0);
         }
      }
      frame.put_u32(err);
      frame.freeze()
   }

   pub fn from_bytes(payload: &Bytes) -> Option<Self> {
      let mut buf = payload.clone();
      if buf.remaining() < 2 {
         trace!(len = payload.len(), "Hole-punch frame too short");
         return None;
      }

      let kind = buf.get_u8();
      let addr_type = buf.get_u8();
      let addr = match addr_type {
         0 if buf.remaining() >= 6 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), buf.get_u16())
         }
         1 if buf.remaining() >= 18 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), buf.get_u16())
         }
         _ => {
            trace!(addr_type, "Hole-punch frame with unknown address type");
            return None;
         }
      };
      let err = if buf.remaining() >= 4 { buf.get_u32() } else { 0 };

      match kind {
         HOLEPUNCH_RENDEZVOUS => Some(HolePunchMessage::Rendezvous(addr)),
         HOLEPUNCH_CONNECT => Some(HolePunchMessage::Connect(addr)),
         HOLEPUNCH_ERROR => Some(HolePunchMessage::Error(err)),
         _ => {
            trace!(kind, "Unknown hole-punch message type");
            None
         }
      }
   }
}

/// Maps `yourip` between [`IpAddr`] and the raw 4- or 16-byte string BEP
/// 0010 puts on the wire. Absence is handled by the field's `default`;
/// this only sees a present value.
mod yourip_bytes {
   use std::net::IpAddr;

   use serde::{Deserialize, Deserializer, Serializer, de};
   use serde_bytes::ByteBuf;

   pub fn serialize<S>(ip: &Option<IpAddr>, serializer: S) -> Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let octets = match ip {
         Some(IpAddr::V4(v4)) => v4.octets().to_vec(),
         Some(IpAddr::V6(v6)) => v6.octets().to_vec(),
         None => return serializer.serialize_none(),
      };
      serializer.serialize_bytes(&octets)
   }

   pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<IpAddr>, D::Error>
   where
      D: Deserializer<'de>,
   {
      let raw = ByteBuf::deserialize(deserializer)?.into_vec();
      let ip = match raw.len() {
         4 => {
            let octets: [u8; 4] = raw.try_into().map_err(|_| de::Error::custom("bad v4"))?;
            IpAddr::from(octets)
         }
         16 => {
            let octets: [u8; 16] = raw.try_into().map_err(|_| de::Error::custom("bad v6"))?;
            IpAddr::from(octets)
         }
         n => return Err(de::Error::invalid_length(n, &"an address of 4 or 16 bytes")),
      };
      Ok(Some(ip))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_extended_handshake_roundtrip() {
      let handshake = ExtendedHandshake::local();
      let bytes = handshake.to_bytes().unwrap();
      let parsed = ExtendedHandshake::from_bytes(&bytes).unwrap();

      assert_eq!(parsed.ut_metadata_id(), Some(UT_METADATA_LOCAL_ID));
      assert_eq!(parsed.ut_pex_id(), Some(UT_PEX_LOCAL_ID));
      assert_eq!(parsed.ut_holepunch_id(), Some(UT_HOLEPUNCH_LOCAL_ID));
      assert!(!parsed.is_private());
   }

   #[test]
   fn test_extended_handshake_parses_wire_dictionary() {
      let raw = b"d1:md11:ut_metadatai3ee13:metadata_sizei16384e7:privatei1e6:yourip4:\x7f\x00\x00\x01e";
      let handshake = ExtendedHandshake::from_bytes(raw).unwrap();

      assert_eq!(handshake.ut_metadata_id(), Some(3));
      assert_eq!(handshake.metadata_size, Some(16384));
      assert!(handshake.is_private());
      assert_eq!(handshake.your_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
   }

   #[test]
   fn test_zero_extension_id_means_disabled() {
      let raw = b"d1:md11:ut_metadatai0eee";
      let handshake = ExtendedHandshake::from_bytes(raw).unwrap();
      assert_eq!(handshake.ut_metadata_id(), None);
   }

   #[test]
   fn test_exchange_piece_splits_after_header() {
      let block = vec![0xabu8; 64];
      let mut payload = b"d8:msg_typei1e5:piecei4e10:total_sizei64ee".to_vec();
      payload.extend_from_slice(&block);

      match MetadataExchange::from_bytes(&Bytes::from(payload)).unwrap() {
         MetadataExchange::Piece { piece, total_size, data } => {
            assert_eq!(piece, 4);
            assert_eq!(total_size, Some(64));
            assert_eq!(&data[..], &block[..]);
         }
         other => panic!("Expected piece message, got {other:?}"),
      }
   }

   #[test]
   fn test_exchange_reject_parses() {
      let payload = Bytes::from_static(b"d8:msg_typei2e5:piecei1ee");
      assert_eq!(
         MetadataExchange::from_bytes(&payload),
         Some(MetadataExchange::Reject { piece: 1 })
      );
   }

   #[test]
   fn test_exchange_without_end_markers_is_ignored() {
      let payload = Bytes::from_static(b"d8:msg_typei1e5:piecei4");
      assert_eq!(MetadataExchange::from_bytes(&payload), None);
   }

   #[test]
   fn test_exchange_request_roundtrip() {
      let bytes = MetadataExchange::request_bytes(7);
      assert_eq!(
         MetadataExchange::from_bytes(&bytes),
         Some(MetadataExchange::Request { piece: 7 })
      );
   }

   #[test]
   fn test_pex_compact_peers_with_flags() {
      let message = PexMessage {
         added: Some(ByteBuf::from(vec![10, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2])),
         added_flags: Some(ByteBuf::from(vec![PEX_SUPPORTS_UTP | PEX_SUPPORTS_HOLEPUNCH])),
         ..Default::default()
      };

      let peers = message.added_peers();
      assert_eq!(peers.len(), 2);
      assert_eq!(peers[0].addr, "10.0.0.1:6881".parse().unwrap());
      assert!(peers[0].needs_rendezvous());
      // Second entry has no flag byte and defaults to 0.
      assert_eq!(peers[1].flags, 0);
      assert!(!peers[1].needs_rendezvous());
   }

   #[test]
   fn test_pex_roundtrip() {
      let message = PexMessage {
         added: Some(ByteBuf::from(vec![192, 168, 1, 1, 0x04, 0xd2])),
         ..Default::default()
      };
      let parsed = PexMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
      assert_eq!(parsed, message);
   }

   #[test]
   fn test_holepunch_rendezvous_roundtrip() {
      let target: SocketAddr = "203.0.113.9:51413".parse().unwrap();
      let frame = HolePunchMessage::Rendezvous(target).to_bytes();
      assert_eq!(
         HolePunchMessage::from_bytes(&frame),
         Some(HolePunchMessage::Rendezvous(target))
      );
   }

   #[test]
   fn test_holepunch_truncated_frame_is_ignored() {
      let frame = Bytes::from_static(&[0, 0, 1, 2]);
      assert_eq!(HolePunchMessage::from_bytes(&frame), None);
   }
}
