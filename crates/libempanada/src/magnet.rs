use std::{collections::BTreeMap, fmt};

use tracing::{trace, warn};

use crate::{errors::MagnetError, hashes::InfoHash};

/// URI schemes accepted for tracker entries (`tr` / `tr.N`).
const TRACKER_SCHEMES: &[&str] = &["http", "https", "udp"];
/// URI schemes accepted for web seeds and acceptable sources (`ws` / `as`).
const SOURCE_SCHEMES: &[&str] = &["http", "https", "ftp"];

/// A parsed magnet URI.
///
/// Magnet URI spec: <https://en.wikipedia.org/wiki/Magnet_URI_scheme>, plus
/// [BEP 0009](https://www.bittorrent.org/beps/bep_0009.html) (`xt`),
/// [BEP 0012](https://www.bittorrent.org/beps/bep_0012.html) (tracker tiers
/// via `tr.N`), [BEP 0019](https://www.bittorrent.org/beps/bep_0019.html)
/// (`ws` / `as`) and
/// [BEP 0053](https://www.bittorrent.org/beps/bep_0053.html) (`so`).
///
/// Trackers are stored in tiers: `tr=` entries form tier 0 and each distinct
/// `tr.N=` key forms its own tier, emitted in ascending `N` order. The flat
/// tracker list is always the in-order concatenation of the tiers, see
/// [`Self::trackers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetUri {
   /// The 20-byte v1 info hash from the `xt` topic.
   pub info_hash: InfoHash,
   /// Percent-decoded `dn` value.
   pub display_name: Option<String>,
   /// `xl`, the exact length of the described payload in bytes.
   pub exact_length: Option<u64>,
   /// Tracker URIs grouped in tiers, tier order preserved.
   pub tracker_tiers: Vec<Vec<String>>,
   /// `ws` entries (HTTP/FTP seeds carrying the payload itself).
   pub web_seeds: Vec<String>,
   /// `as` entries, tried after the web seeds.
   pub acceptable_sources: Vec<String>,
   /// `so` file-selection indices: sorted, deduplicated, absent when no
   /// valid index was present.
   pub selected_file_indices: Option<Vec<usize>>,
}

impl MagnetUri {
   /// Parses a magnet URI into a [`MagnetUri`] descriptor.
   ///
   /// Returns `None` (with a logged warning) when the text is not a magnet
   /// URI, has no `xt` topic, or carries an unparsable info hash. Damaged
   /// sub-fields -- a tracker with a bad scheme, a non-numeric `so` entry,
   /// a malformed `xl` -- are dropped without failing the whole parse.
   pub fn parse(text: &str) -> Option<MagnetUri> {
      match Self::try_parse(text) {
         Ok(magnet) => Some(magnet),
         Err(err) => {
            warn!(error = %err, "Failed to parse magnet URI");
            None
         }
      }
   }

   fn try_parse(text: &str) -> Result<MagnetUri, MagnetError> {
      let query = text.strip_prefix("magnet:?").ok_or(MagnetError::MissingPrefix)?;

      let mut info_hash: Option<InfoHash> = None;
      let mut display_name = None;
      let mut exact_length = None;
      // Keyed by tier number; unnumbered `tr=` entries (and `tr.0=`) land in
      // tier 0. BTreeMap keeps tiers in ascending order.
      let mut tiers: BTreeMap<u32, Vec<String>> = BTreeMap::new();
      let mut web_seeds = KeyedList::default();
      let mut acceptable_sources = KeyedList::default();
      let mut selected: Vec<usize> = Vec::new();

      for param in query.split('&') {
         if param.is_empty() {
            continue;
         }

         let (key, value) = match param.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(param), String::new()),
         };

         match key.as_str() {
            "xt" => {
               // First parsable topic wins.
               if info_hash.is_some() {
                  trace!(topic = %value, "Ignoring repeated xt key");
                  continue;
               }
               info_hash = Some(parse_topic(&value)?);
            }
            "dn" => display_name = Some(value),
            "xl" => match value.parse::<u64>() {
               Ok(length) => exact_length = Some(length),
               Err(_) => trace!(value = %value, "Dropping malformed xl value"),
            },
            "tr" => collect_uris(tiers.entry(0).or_default(), &value, TRACKER_SCHEMES, true),
            "ws" => collect_uris(&mut web_seeds.plain, &value, SOURCE_SCHEMES, false),
            "as" => collect_uris(&mut acceptable_sources.plain, &value, SOURCE_SCHEMES, false),
            "so" => collect_indices(&mut selected, &value),
            _ => match key.split_once('.') {
               Some(("tr", n)) => match n.parse::<u32>() {
                  Ok(tier) => {
                     collect_uris(tiers.entry(tier).or_default(), &value, TRACKER_SCHEMES, true)
                  }
                  Err(_) => trace!(key = %key, "Dropping tracker key with non-numeric tier"),
               },
               Some(("ws", n)) => web_seeds.numbered(n, &value),
               Some(("as", n)) => acceptable_sources.numbered(n, &value),
               Some(("so", _)) => collect_indices(&mut selected, &value),
               _ => trace!(key = %key, "Ignoring unknown magnet key"),
            },
         }
      }

      let info_hash = info_hash.ok_or(MagnetError::MissingTopic)?;

      selected.sort_unstable();
      selected.dedup();

      Ok(MagnetUri {
         info_hash,
         display_name,
         exact_length,
         tracker_tiers: tiers.into_values().filter(|tier| !tier.is_empty()).collect(),
         web_seeds: web_seeds.into_ordered(),
         acceptable_sources: acceptable_sources.into_ordered(),
         selected_file_indices: if selected.is_empty() { None } else { Some(selected) },
      })
   }

   /// The flat tracker list: the in-order concatenation of
   /// [`Self::tracker_tiers`].
   pub fn trackers(&self) -> Vec<String> {
      self.tracker_tiers.iter().flatten().cloned().collect()
   }

   /// Renders the descriptor back into a magnet URI.
   ///
   /// Emits `xt` first, then `dn`, `tr` (one per flat entry), `xl`, `ws`,
   /// `as` and `so` (one per index). Tier grouping is not preserved: parsing
   /// the result yields the same descriptor with all trackers collapsed
   /// into tier 0.
   pub fn to_uri(&self) -> String {
      let mut uri = format!("magnet:?xt=urn:btih:{}", self.info_hash.to_hex());

      if let Some(name) = &self.display_name {
         uri.push_str("&dn=");
         uri.push_str(&urlencoding::encode(name));
      }
      for tracker in self.trackers() {
         uri.push_str("&tr=");
         uri.push_str(&urlencoding::encode(&tracker));
      }
      if let Some(length) = self.exact_length {
         uri.push_str(&format!("&xl={length}"));
      }
      for seed in &self.web_seeds {
         uri.push_str("&ws=");
         uri.push_str(&urlencoding::encode(seed));
      }
      for source in &self.acceptable_sources {
         uri.push_str("&as=");
         uri.push_str(&urlencoding::encode(source));
      }
      if let Some(indices) = &self.selected_file_indices {
         for index in indices {
            uri.push_str(&format!("&so={index}"));
         }
      }

      uri
   }
}

impl fmt::Display for MagnetUri {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.to_uri())
   }
}

/// Parses the `xt` value. Accepted topics are `urn:btih:` (40-char hex or
/// 32-char Base32) and `urn:sha1:` (hex only).
fn parse_topic(value: &str) -> Result<InfoHash, MagnetError> {
   if let Some(encoded) = value.strip_prefix("urn:btih:") {
      Ok(InfoHash::from_magnet_encoding(encoded)?)
   } else if let Some(encoded) = value.strip_prefix("urn:sha1:") {
      Ok(InfoHash::from_hex(encoded).map_err(MagnetError::InvalidInfoHash)?)
   } else {
      Err(MagnetError::UnsupportedTopic(value.to_string()))
   }
}

/// Appends scheme-filtered URIs from a single value to `out`. Tracker values
/// may carry several URIs separated by commas; seed lists may not.
fn collect_uris(out: &mut Vec<String>, value: &str, schemes: &[&str], split_commas: bool) {
   let parts: Vec<&str> = if split_commas { value.split(',').collect() } else { vec![value] };
   for part in parts {
      let part = part.trim();
      if part.is_empty() {
         continue;
      }
      if has_scheme(part, schemes) {
         out.push(part.to_string());
      } else {
         trace!(uri = %part, "Dropping entry with unaccepted scheme");
      }
   }
}

/// Appends valid `so` indices. BEP 53 allows comma-separated lists; ranges
/// and anything non-numeric (including negatives) are dropped.
fn collect_indices(out: &mut Vec<usize>, value: &str) {
   for part in value.split(',') {
      match part.trim().parse::<usize>() {
         Ok(index) => out.push(index),
         Err(_) => trace!(value = %part, "Dropping invalid so index"),
      }
   }
}

fn has_scheme(uri: &str, schemes: &[&str]) -> bool {
   uri.split_once("://")
      .map(|(scheme, rest)| !rest.is_empty() && schemes.contains(&scheme.to_lowercase().as_str()))
      .unwrap_or(false)
}

/// Percent-decodes one key or value; a value that fails to decode is used
/// raw rather than dropped.
fn percent_decode(text: &str) -> String {
   match urlencoding::decode(text) {
      Ok(decoded) => decoded.into_owned(),
      Err(_) => text.to_string(),
   }
}

/// Accumulates `ws` / `as` style lists where unnumbered keys keep their
/// declaration order, followed by numbered (`ws.N`) keys in key order.
#[derive(Default)]
struct KeyedList {
   plain: Vec<String>,
   numbered: BTreeMap<u32, Vec<String>>,
}

impl KeyedList {
   fn numbered(&mut self, n: &str, value: &str) {
      match n.parse::<u32>() {
         Ok(key) => collect_uris(self.numbered.entry(key).or_default(), value, SOURCE_SCHEMES, false),
         Err(_) => trace!(suffix = %n, "Dropping seed key with non-numeric suffix"),
      }
   }

   fn into_ordered(self) -> Vec<String> {
      let mut out = self.plain;
      for (_, mut uris) in self.numbered {
         out.append(&mut uris);
      }
      out
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

   #[test]
   fn test_parse_flat_trackers_form_one_tier() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&dn=test+file&tr=http://a.example/&tr=http://b.example/");
      let magnet = MagnetUri::parse(&uri).unwrap();

      assert_eq!(magnet.info_hash.to_hex(), HASH);
      assert_eq!(magnet.tracker_tiers.len(), 1);
      assert_eq!(
         magnet.trackers(),
         vec!["http://a.example/".to_string(), "http://b.example/".to_string()]
      );
      // `+` may decode to a space or stay literal, both are acceptable.
      let name = magnet.display_name.unwrap();
      assert!(name == "test file" || name == "test+file");
   }

   #[test]
   fn test_parse_numbered_trackers_form_distinct_tiers() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&tr.1=http://a&tr.2=http://b");
      let magnet = MagnetUri::parse(&uri).unwrap();

      assert_eq!(magnet.tracker_tiers, vec![vec!["http://a".to_string()], vec![
         "http://b".to_string()
      ]]);
      assert_eq!(magnet.trackers(), vec!["http://a".to_string(), "http://b".to_string()]);
   }

   #[test]
   fn test_parse_tier_zero_merges_with_unnumbered() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&tr=udp://a:1337&tr.0=udp://b:1337&tr.3=udp://c:1337");
      let magnet = MagnetUri::parse(&uri).unwrap();

      assert_eq!(magnet.tracker_tiers.len(), 2);
      assert_eq!(magnet.tracker_tiers[0], vec![
         "udp://a:1337".to_string(),
         "udp://b:1337".to_string()
      ]);
   }

   #[test]
   fn test_parse_comma_separated_trackers() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&tr=http://a.example/,udp://b.example:80/");
      let magnet = MagnetUri::parse(&uri).unwrap();
      assert_eq!(magnet.trackers().len(), 2);
   }

   #[test]
   fn test_parse_selection_indices_sorted_deduped() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&so=0&so=invalid&so=-1&so=2");
      let magnet = MagnetUri::parse(&uri).unwrap();
      assert_eq!(magnet.selected_file_indices, Some(vec![0, 2]));
   }

   #[test]
   fn test_parse_selection_absent_when_all_invalid() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&so=bogus&so=-4");
      let magnet = MagnetUri::parse(&uri).unwrap();
      assert_eq!(magnet.selected_file_indices, None);
   }

   #[test]
   fn test_parse_web_seeds_filter_scheme() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&ws=invalid://x&ws=http://w.example/f");
      let magnet = MagnetUri::parse(&uri).unwrap();
      assert_eq!(magnet.web_seeds, vec!["http://w.example/f".to_string()]);
   }

   #[test]
   fn test_parse_numbered_seeds_follow_unnumbered() {
      let uri = format!(
         "magnet:?xt=urn:btih:{HASH}&ws.2=http://late.example/&ws=http://first.example/&ws.1=http://mid.example/"
      );
      let magnet = MagnetUri::parse(&uri).unwrap();
      assert_eq!(magnet.web_seeds, vec![
         "http://first.example/".to_string(),
         "http://mid.example/".to_string(),
         "http://late.example/".to_string()
      ]);
   }

   #[test]
   fn test_parse_base32_topic() {
      let uri = "magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
      let magnet = MagnetUri::parse(uri).unwrap();
      assert_eq!(magnet.info_hash.as_bytes(), &[0u8; 20]);
   }

   #[test]
   fn test_parse_rejects_short_hex_topic() {
      // 39 hex characters
      let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef0123456";
      assert!(MagnetUri::parse(uri).is_none());
   }

   #[test]
   fn test_parse_rejects_missing_topic() {
      assert!(MagnetUri::parse("magnet:?dn=no-hash-here").is_none());
      assert!(MagnetUri::parse("http://not-a-magnet/").is_none());
   }

   #[test]
   fn test_parse_malformed_xl_is_dropped() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&xl=many");
      let magnet = MagnetUri::parse(&uri).unwrap();
      assert_eq!(magnet.exact_length, None);

      let uri = format!("magnet:?xt=urn:btih:{HASH}&xl=34256");
      let magnet = MagnetUri::parse(&uri).unwrap();
      assert_eq!(magnet.exact_length, Some(34256));
   }

   #[test]
   fn test_uri_roundtrip_modulo_tier_grouping() {
      let uri = format!(
         "magnet:?xt=urn:btih:{HASH}&dn=round%20trip&xl=99&tr=udp://t.example:80/&ws=http://w.example/&as=ftp://s.example/&so=1&so=3"
      );
      let magnet = MagnetUri::parse(&uri).unwrap();
      let reparsed = MagnetUri::parse(&magnet.to_uri()).unwrap();
      assert_eq!(magnet, reparsed);
   }

   #[test]
   fn test_uri_roundtrip_collapses_tiers() {
      let uri = format!("magnet:?xt=urn:btih:{HASH}&tr.1=http://a&tr.2=http://b");
      let magnet = MagnetUri::parse(&uri).unwrap();
      let reparsed = MagnetUri::parse(&magnet.to_uri()).unwrap();

      // Flat list is preserved even though the grouping collapses to tier 0.
      assert_eq!(magnet.trackers(), reparsed.trackers());
      assert_eq!(reparsed.tracker_tiers.len(), 1);
   }
}
