//! Remote image fetch with a timeout and a streaming size cap.

use std::error::Error as StdError;
use std::io::{self, Read};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// Most we reserve up front on the strength of a Content-Length header.
const MAX_PREALLOC_BYTES: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetching {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("image exceeds the {limit}-byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },
}

/// Payload carried by the `io::Error` a [`BoundedReader`] returns once its limit is passed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("read limit of {limit} bytes exceeded")]
pub struct LimitExceeded {
    pub limit: u64,
}

impl LimitExceeded {
    /// Recover the limit from an `io::Error` produced by a [`BoundedReader`].
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<LimitExceeded>())
            .copied()
    }
}

/// Reader adapter that fails as soon as more than `limit` bytes have come through.
///
/// Exactly `limit` bytes is allowed. The inner reader is asked for at most one
/// byte past the limit, so an oversized stream is never buffered.
pub struct BoundedReader<R> {
    inner: R,
    limit: u64,
    consumed: u64,
}

impl<R: Read> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self { inner, limit, consumed: 0 }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    fn exceeded(&self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, LimitExceeded { limit: self.limit })
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.consumed > self.limit {
            return Err(self.exceeded());
        }

        let allowance = (self.limit - self.consumed).saturating_add(1);
        let max = usize::try_from(allowance).map_or(buf.len(), |a| a.min(buf.len()));
        let n = self.inner.read(&mut buf[..max])?;
        self.consumed += n as u64;

        if self.consumed > self.limit {
            return Err(self.exceeded());
        }
        Ok(n)
    }
}

/// Limits applied to every remote fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

/// Blocking HTTP(S) image fetcher. No retries: the first failure is returned.
pub struct ImageFetcher {
    agent: ureq::Agent,
    config: FetchConfig,
}

impl ImageFetcher {
    pub fn new(config: FetchConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { agent, config }
    }

    /// Download `url` into memory, enforcing the timeout and size cap.
    pub fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if !is_http_url(url) {
            return Err(FetchError::Fetch {
                url: url.to_string(),
                reason: "only http and https URLs are supported".into(),
            });
        }

        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| self.classify(url, e))?;

        let declared = response
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(len) = declared {
            if len > self.config.max_bytes {
                tracing::warn!(url, declared = len, limit = self.config.max_bytes, "declared image size over limit");
                return Err(FetchError::PayloadTooLarge { limit: self.config.max_bytes });
            }
        }

        let mut reader = BoundedReader::new(response.into_reader(), self.config.max_bytes);
        let mut body = Vec::with_capacity(initial_capacity(declared));
        if let Err(e) = reader.read_to_end(&mut body) {
            if let Some(exceeded) = LimitExceeded::from_io(&e) {
                tracing::warn!(url, limit = exceeded.limit, "image stream over limit, transfer aborted");
                return Err(FetchError::PayloadTooLarge { limit: exceeded.limit });
            }
            return Err(if is_timeout(&e) {
                self.timed_out(url)
            } else {
                FetchError::Fetch { url: url.to_string(), reason: e.to_string() }
            });
        }

        tracing::debug!(url, bytes = body.len(), "fetched image");
        Ok(body)
    }

    fn classify(&self, url: &str, err: ureq::Error) -> FetchError {
        match err {
            ureq::Error::Status(code, _) => {
                tracing::warn!(url, status = code, "image fetch rejected");
                FetchError::Fetch { url: url.to_string(), reason: format!("HTTP status {code}") }
            }
            ureq::Error::Transport(transport) => {
                let timed_out = source_chain_has_timeout(&transport)
                    || (transport.kind() == ureq::ErrorKind::Io && transport.to_string().contains("timed out"));
                if timed_out {
                    tracing::warn!(url, "image fetch timed out");
                    self.timed_out(url)
                } else {
                    tracing::warn!(url, error = %transport, "image fetch failed");
                    FetchError::Fetch { url: url.to_string(), reason: transport.to_string() }
                }
            }
        }
    }

    fn timed_out(&self, url: &str) -> FetchError {
        FetchError::Timeout { url: url.to_string(), timeout: self.config.timeout }
    }
}

impl Default for ImageFetcher {
    fn default() -> Self {
        Self::new(FetchConfig::default())
    }
}

/// Buffer reservation for a body of `declared` length. The header is untrusted.
fn initial_capacity(declared: Option<u64>) -> usize {
    declared.map_or(0, |len| len.min(MAX_PREALLOC_BYTES) as usize)
}

/// True for `http://` and `https://` URLs, case-insensitive on the scheme.
pub fn is_http_url(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            !rest.is_empty() && (scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"))
        }
        None => false,
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn source_chain_has_timeout(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_timeout(io_err) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;

    /// Accept one connection, consume the request head, then hand the socket to `respond`.
    fn serve_once<T: Send + 'static>(
        respond: impl FnOnce(TcpStream) -> T + Send + 'static,
    ) -> (String, JoinHandle<Option<T>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().ok()?;
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                match stream.read(&mut byte) {
                    Ok(1) => head.push(byte[0]),
                    _ => return None,
                }
            }
            Some(respond(stream))
        });
        (format!("http://{addr}/photo.jpg"), handle)
    }

    #[test]
    fn test_bounded_reader_allows_exact_limit() {
        let mut reader = BoundedReader::new(Cursor::new(vec![7u8; 100]), 100);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(reader.consumed(), 100);
    }

    #[test]
    fn test_bounded_reader_rejects_one_past_limit() {
        let mut reader = BoundedReader::new(Cursor::new(vec![7u8; 101]), 100);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(LimitExceeded::from_io(&err), Some(LimitExceeded { limit: 100 }));
        assert_eq!(reader.consumed(), 101);
    }

    #[test]
    fn test_bounded_reader_stops_pulling_from_endless_source() {
        let mut reader = BoundedReader::new(io::repeat(1), 4096);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert!(LimitExceeded::from_io(&err).is_some());
        assert_eq!(reader.consumed(), 4097);
        // Later reads keep failing instead of resuming.
        assert!(reader.read(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_bounded_reader_with_unbounded_limit() {
        let mut reader = BoundedReader::new(Cursor::new(vec![3u8; 64]), u64::MAX);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 64);
    }

    #[test]
    fn test_initial_capacity_capped() {
        assert_eq!(initial_capacity(None), 0);
        assert_eq!(initial_capacity(Some(512)), 512);
        assert_eq!(initial_capacity(Some(u64::MAX)), MAX_PREALLOC_BYTES as usize);
    }

    #[test]
    fn test_limit_exceeded_ignores_other_io_errors() {
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(LimitExceeded::from_io(&err).is_none());
    }

    #[test]
    fn test_is_http_url() {
        assert!(is_http_url("http://example.com/a.jpg"));
        assert!(is_http_url("HTTPS://example.com/a.jpg"));
        assert!(!is_http_url("ftp://example.com/a.jpg"));
        assert!(!is_http_url("/tmp/a.jpg"));
        assert!(!is_http_url("https://"));
    }

    #[test]
    fn test_fetch_rejects_non_http_scheme() {
        let err = ImageFetcher::default().fetch("file:///etc/passwd").unwrap_err();
        assert!(matches!(err, FetchError::Fetch { .. }));
    }

    #[test]
    fn test_fetch_ok() {
        let (url, server) = serve_once(|mut s| {
            let _ = s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello");
        });
        let body = ImageFetcher::default().fetch(&url).unwrap();
        assert_eq!(body, b"hello");
        server.join().unwrap();
    }

    #[test]
    fn test_fetch_http_error_status() {
        let (url, server) = serve_once(|mut s| {
            let _ = s.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        });
        let err = ImageFetcher::default().fetch(&url).unwrap_err();
        match err {
            FetchError::Fetch { reason, .. } => assert!(reason.contains("404"), "{reason}"),
            other => panic!("expected Fetch, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_fetch_connection_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let err = ImageFetcher::default()
            .fetch(&format!("http://127.0.0.1:{port}/x.jpg"))
            .unwrap_err();
        assert!(matches!(err, FetchError::Fetch { .. }), "{err:?}");
    }

    #[test]
    fn test_fetch_declared_length_over_limit() {
        let (url, server) = serve_once(|mut s| {
            let _ = s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 104857600\r\nConnection: close\r\n\r\n");
        });
        let err = ImageFetcher::default().fetch(&url).unwrap_err();
        assert!(matches!(err, FetchError::PayloadTooLarge { limit: DEFAULT_MAX_IMAGE_BYTES }));
        server.join().unwrap();
    }

    #[test]
    fn test_fetch_streamed_body_over_limit_aborts() {
        const TOTAL: usize = 64 * 1024 * 1024;
        let (url, server) = serve_once(|mut s| {
            // No Content-Length: body runs until the connection closes.
            if s.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nConnection: close\r\n\r\n").is_err() {
                return false;
            }
            let chunk = vec![0xABu8; 64 * 1024];
            let mut sent = 0;
            while sent < TOTAL {
                if s.write_all(&chunk).is_err() {
                    return false;
                }
                sent += chunk.len();
            }
            true
        });

        let err = ImageFetcher::default().fetch(&url).unwrap_err();
        assert!(matches!(err, FetchError::PayloadTooLarge { limit: DEFAULT_MAX_IMAGE_BYTES }), "{err:?}");

        let completed = server.join().unwrap();
        assert_eq!(completed, Some(false), "server should not have finished streaming");
    }

    #[test]
    fn test_fetch_timeout() {
        let (url, server) = serve_once(|_s| {
            std::thread::sleep(Duration::from_millis(1500));
        });
        let fetcher = ImageFetcher::new(FetchConfig {
            timeout: Duration::from_millis(200),
            ..FetchConfig::default()
        });
        let err = fetcher.fetch(&url).unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "{err:?}");
        server.join().unwrap();
    }
}
