use std::{collections::HashMap, time::Duration};

use bytes::{Bytes, BytesMut};
use reqwest::{Client, StatusCode, header::RANGE};
use tracing::{debug, instrument, trace, warn};

use crate::{errors::WebSeedError, magnet::MagnetUri};

/// A URL is skipped once it has failed this many times in a row.
pub const MAX_URL_RETRIES: u32 = 3;

/// Connect/read timeout for a single range request.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("empanada/", env!("CARGO_PKG_VERSION"));

/// HTTP range fetcher for web seeds, per [BEP 0019](https://www.bittorrent.org/beps/bep_0019.html).
///
/// URLs are tried in declaration order, `ws` entries before `as` entries.
/// Each URL carries a consecutive-failure count; at [`MAX_URL_RETRIES`] it
/// drops out of the rotation until [`Self::reset_failure_counts`] or a
/// successful fetch clears it.
pub struct WebSeedFetcher {
   client: Client,
   urls: Vec<String>,
   failures: HashMap<String, u32>,
}

impl WebSeedFetcher {
   pub fn new(web_seeds: Vec<String>, acceptable_sources: Vec<String>) -> Self {
      let mut urls = web_seeds;
      urls.extend(acceptable_sources);

      let client = Client::builder()
         .connect_timeout(FETCH_TIMEOUT)
         .timeout(FETCH_TIMEOUT)
         .user_agent(USER_AGENT)
         .build()
         .expect("web seed HTTP client must build");

      WebSeedFetcher {
         client,
         urls,
         failures: HashMap::new(),
      }
   }

   /// Builds a fetcher over a magnet descriptor's `ws` and `as` lists.
   pub fn from_magnet(magnet: &MagnetUri) -> Self {
      Self::new(magnet.web_seeds.clone(), magnet.acceptable_sources.clone())
   }

   /// False iff neither web seeds nor acceptable sources were declared.
   pub fn has_urls(&self) -> bool {
      !self.urls.is_empty()
   }

   /// Puts every URL back into rotation.
   pub fn reset_failure_counts(&mut self) {
      self.failures.clear();
   }

   fn eligible(&self, url: &str) -> bool {
      self.failures.get(url).copied().unwrap_or(0) < MAX_URL_RETRIES
   }

   fn record_failure(&mut self, url: &str) {
      let count = self.failures.entry(url.to_string()).or_insert(0);
      *count += 1;
      if *count >= MAX_URL_RETRIES {
         warn!(url, failures = *count, "Web seed dropped from rotation");
      }
   }

   fn record_success(&mut self, url: &str) {
      self.failures.remove(url);
   }

   /// Fetches `size` bytes at `byte_offset` for piece `index` from the
   /// first eligible URL that delivers them.
   ///
   /// A URL that errors is penalized and the next one is tried; a URL that
   /// answers with the wrong number of bytes ends this call without
   /// penalty (the next call walks the list again).
   #[instrument(skip(self), fields(index, byte_offset, size))]
   pub async fn download_piece(
      &mut self, index: usize, byte_offset: u64, size: usize,
   ) -> Option<Bytes> {
      if size == 0 {
         return None;
      }

      for url in self.urls.clone() {
         if !self.eligible(&url) {
            trace!(url = %url, "Skipping web seed with too many failures");
            continue;
         }

         match self.fetch_range(&url, byte_offset, size).await {
            Ok(Some(bytes)) => {
               debug!(url = %url, index, len = bytes.len(), "Web seed delivered piece range");
               self.record_success(&url);
               return Some(bytes);
            }
            Ok(None) => {
               debug!(url = %url, index, "Web seed returned wrong byte count");
               return None;
            }
            Err(err) => {
               debug!(url = %url, index, error = %err, "Web seed request failed");
               self.record_failure(&url);
            }
         }
      }

      None
   }

   /// One ranged GET. `Ok(Some)` is an exact-length body, `Ok(None)` a
   /// length mismatch, `Err` a transport failure or unexpected status.
   async fn fetch_range(
      &self, url: &str, offset: u64, size: usize,
   ) -> Result<Option<Bytes>, WebSeedError> {
      let end = offset + size as u64 - 1;
      let mut response = self
         .client
         .get(url)
         .header(RANGE, format!("bytes={offset}-{end}"))
         .send()
         .await?;

      match response.status() {
         StatusCode::PARTIAL_CONTENT => {
            let mut body = BytesMut::with_capacity(size);
            while let Some(chunk) = response.chunk().await? {
               body.extend_from_slice(&chunk);
               if body.len() > size {
                  return Ok(None);
               }
            }
            Ok((body.len() == size).then(|| body.freeze()))
         }
         StatusCode::OK => {
            // Server ignored the Range header: skip to the offset, take
            // exactly `size` bytes, and drop the rest of the body.
            let mut to_skip = offset as usize;
            let mut body = BytesMut::with_capacity(size);
            while let Some(chunk) = response.chunk().await? {
               let chunk = if to_skip >= chunk.len() {
                  to_skip -= chunk.len();
                  continue;
               } else {
                  let chunk = chunk.slice(to_skip..);
                  to_skip = 0;
                  chunk
               };

               let wanted = size - body.len();
               body.extend_from_slice(&chunk[..wanted.min(chunk.len())]);
               if body.len() == size {
                  return Ok(Some(body.freeze()));
               }
            }
            // Body ended before the requested range did.
            Ok(None)
         }
         status => Err(WebSeedError::Status(status)),
      }
   }
}

#[cfg(test)]
mod tests {
   use tokio::{
      io::{AsyncReadExt, AsyncWriteExt},
      net::TcpListener,
   };

   use super::*;

   /// Serves a single canned HTTP response, then closes.
   async fn serve_once(response: Vec<u8>) -> String {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      let addr = listener.local_addr().unwrap();

      tokio::spawn(async move {
         let (mut socket, _) = listener.accept().await.unwrap();
         let mut request = [0u8; 2048];
         let _ = socket.read(&mut request).await;
         socket.write_all(&response).await.unwrap();
         socket.shutdown().await.ok();
      });

      format!("http://{addr}/payload")
   }

   fn http_response(status_line: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
      let mut response = format!(
         "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\n{extra_headers}Connection: close\r\n\r\n",
         body.len()
      )
      .into_bytes();
      response.extend_from_slice(body);
      response
   }

   #[tokio::test]
   async fn test_partial_content_with_exact_length() {
      let url = serve_once(http_response(
         "206 Partial Content",
         "Content-Range: bytes 2-5/8\r\n",
         b"cdef",
      ))
      .await;

      let mut fetcher = WebSeedFetcher::new(vec![url], vec![]);
      let bytes = fetcher.download_piece(0, 2, 4).await.expect("range should arrive");
      assert_eq!(&bytes[..], b"cdef");
   }

   #[tokio::test]
   async fn test_full_body_fallback_trims_locally() {
      // Server ignores the Range header and sends the whole file.
      let url = serve_once(http_response("200 OK", "", b"abcdefgh")).await;

      let mut fetcher = WebSeedFetcher::new(vec![url], vec![]);
      let bytes = fetcher.download_piece(0, 2, 4).await.expect("trimmed range should arrive");
      assert_eq!(&bytes[..], b"cdef");
   }

   #[tokio::test]
   async fn test_length_mismatch_returns_none_without_penalty() {
      let url = serve_once(http_response(
         "206 Partial Content",
         "Content-Range: bytes 2-5/8\r\n",
         b"cd",
      ))
      .await;

      let mut fetcher = WebSeedFetcher::new(vec![url.clone()], vec![]);
      assert!(fetcher.download_piece(0, 2, 4).await.is_none());
      assert!(fetcher.eligible(&url));
   }

   #[tokio::test]
   async fn test_error_status_penalizes_url() {
      let url = serve_once(http_response("503 Service Unavailable", "", b"")).await;

      let mut fetcher = WebSeedFetcher::new(vec![url.clone()], vec![]);
      assert!(fetcher.download_piece(0, 0, 4).await.is_none());
      assert_eq!(fetcher.failures.get(&url), Some(&1));
   }

   #[tokio::test]
   async fn test_zero_size_returns_immediately() {
      let mut fetcher = WebSeedFetcher::new(vec!["http://unused.example/".to_string()], vec![]);
      assert!(fetcher.download_piece(0, 0, 0).await.is_none());
   }

   #[test]
   fn test_url_order_and_has_urls() {
      let fetcher = WebSeedFetcher::new(
         vec!["http://ws-1.example/".to_string(), "http://ws-2.example/".to_string()],
         vec!["http://as-1.example/".to_string()],
      );
      assert!(fetcher.has_urls());
      assert_eq!(fetcher.urls, vec![
         "http://ws-1.example/".to_string(),
         "http://ws-2.example/".to_string(),
         "http://as-1.example/".to_string()
      ]);

      assert!(!WebSeedFetcher::new(vec![], vec![]).has_urls());
   }

   #[test]
   fn test_failure_accounting_drops_url_at_limit() {
      let mut fetcher = WebSeedFetcher::new(vec!["http://flaky.example/".to_string()], vec![]);
      let url = "http://flaky.example/";

      for _ in 0..MAX_URL_RETRIES {
         assert!(fetcher.eligible(url));
         fetcher.record_failure(url);
      }
      assert!(!fetcher.eligible(url));

      // A success clears the slate entirely.
      fetcher.record_success(url);
      assert!(fetcher.eligible(url));

      for _ in 0..MAX_URL_RETRIES {
         fetcher.record_failure(url);
      }
      fetcher.reset_failure_counts();
      assert!(fetcher.eligible(url));
   }
}
