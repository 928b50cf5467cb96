//! HTTP/1.1 origin client over plain TCP.
//!
//! One connection per fetch with `Connection: close`, so the response body is
//! framed by `Content-Length`, chunked transfer coding, or end of stream.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{OriginClient, OriginError, OriginResponse};
use crate::BoxFuture;
use crate::http::Headers;

/// Default cap on a buffered origin response (32 MiB).
const DEFAULT_MAX_RESPONSE: usize = 32 * 1024 * 1024;

/// Maximum number of response headers accepted from the origin.
const MAX_HEADERS: usize = 96;

/// Initial read buffer capacity per fetch.
const INITIAL_BUF_SIZE: usize = 8 * 1024;

enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

/// Origin reached over HTTP/1.1.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_cache::origin::{HttpOrigin, OriginClient};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let origin = HttpOrigin::new("10.0.0.7:8080").host("api.example.com");
/// let response = origin.fetch("/v1/items?page=1").await?;
/// println!("{} ({} bytes)", response.status, response.body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    addr: String,
    host: String,
    max_response_bytes: usize,
}

impl HttpOrigin {
    /// Creates a client for the origin listening at `addr` (`host:port`).
    /// The `Host` header defaults to `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            host: addr.clone(),
            addr,
            max_response_bytes: DEFAULT_MAX_RESPONSE,
        }
    }

    /// Overrides the `Host` header sent to the origin.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Caps the buffered response size.
    #[must_use]
    pub fn max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    async fn get(&self, uri: &str) -> Result<OriginResponse, OriginError> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| OriginError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;

        let request = format!(
            "GET {uri} HTTP/1.1\r\nHost: {}\r\nUser-Agent: rttp-cache\r\nAccept-Encoding: identity\r\nConnection: close\r\n\r\n",
            self.host
        );
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        let (status, headers, body_offset) = loop {
            if self.read_more(&mut stream, &mut buf).await? == 0 {
                return Err(OriginError::Malformed(
                    "connection closed before the response head".to_owned(),
                ));
            }
            if let Some(head) = parse_head(&buf)? {
                break head;
            }
        };

        let mut body = buf.split_off(body_offset);
        let body = match framing(status, &headers)? {
            Framing::Empty => Bytes::new(),
            Framing::Length(len) => {
                while body.len() < len {
                    if self.read_more(&mut stream, &mut body).await? == 0 {
                        return Err(OriginError::Malformed(format!(
                            "body truncated at {} of {len} bytes",
                            body.len()
                        )));
                    }
                }
                body.truncate(len);
                body.freeze()
            }
            Framing::Chunked => {
                let mut decoder = ChunkedDecoder::default();
                loop {
                    let decoded = decoder.decode(&mut body)?;
                    let held = decoded
                        .as_ref()
                        .map_or(decoder.decoded_len() + body.len(), Bytes::len);
                    if held > self.max_response_bytes {
                        return Err(OriginError::TooLarge {
                            limit: self.max_response_bytes,
                        });
                    }
                    if let Some(decoded) = decoded {
                        break decoded;
                    }
                    if self.read_more(&mut stream, &mut body).await? == 0 {
                        return Err(OriginError::Malformed(
                            "chunked body ended early".to_owned(),
                        ));
                    }
                }
            }
            Framing::UntilClose => {
                while self.read_more(&mut stream, &mut body).await? != 0 {}
                body.freeze()
            }
        };

        debug!(uri, status, bytes = body.len(), "origin responded");
        Ok(OriginResponse {
            status,
            body,
            headers: headers.to_map(),
        })
    }

    async fn read_more(
        &self,
        stream: &mut TcpStream,
        buf: &mut BytesMut,
    ) -> Result<usize, OriginError> {
        let n = stream.read_buf(buf).await?;
        if buf.len() > self.max_response_bytes {
            return Err(OriginError::TooLarge {
                limit: self.max_response_bytes,
            });
        }
        Ok(n)
    }
}

impl OriginClient for HttpOrigin {
    fn fetch<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<OriginResponse, OriginError>> {
        Box::pin(self.get(uri))
    }
}

/// Parses the status line and headers, or returns `None` if more data is needed.
fn parse_head(buf: &[u8]) -> Result<Option<(u16, Headers, usize)>, OriginError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let offset = match response.parse(buf) {
        Ok(httparse::Status::Complete(offset)) => offset,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(OriginError::Malformed(e.to_string())),
    };
    let status = response
        .code
        .ok_or_else(|| OriginError::Malformed("missing status code".to_owned()))?;

    let mut headers = Headers::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            headers.insert(header.name, value);
        }
    }
    Ok(Some((status, headers, offset)))
}

fn framing(status: u16, headers: &Headers) -> Result<Framing, OriginError> {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(Framing::Empty);
    }
    if headers
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    {
        return Ok(Framing::Chunked);
    }
    match headers.get("content-length") {
        Some(len) => len
            .trim()
            .parse()
            .map(Framing::Length)
            .map_err(|_| OriginError::Malformed(format!("invalid Content-Length {len:?}"))),
        None => Ok(Framing::UntilClose),
    }
}

/// Decodes a chunked body as it arrives.
///
/// Complete chunks are moved out of the input buffer, so every read resumes
/// where the previous one stopped.
#[derive(Debug, Default)]
struct ChunkedDecoder {
    out: BytesMut,
}

impl ChunkedDecoder {
    fn decoded_len(&self) -> usize {
        self.out.len()
    }

    /// Consumes the complete chunks at the front of `buf`. Returns the body
    /// once the last chunk and the trailer section have arrived.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, OriginError> {
        loop {
            let (consumed, size) = match httparse::parse_chunk_size(&buf[..]) {
                Ok(httparse::Status::Complete(pair)) => pair,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(_) => return Err(OriginError::Malformed("invalid chunk size".to_owned())),
            };
            let size = usize::try_from(size)
                .map_err(|_| OriginError::Malformed("chunk size overflow".to_owned()))?;

            if size == 0 {
                // Last chunk: optional trailers, then an empty line.
                let rest = &buf[consumed..];
                let terminated =
                    rest.starts_with(b"\r\n") || rest.windows(4).any(|w| w == b"\r\n\r\n");
                if !terminated {
                    return Ok(None);
                }
                buf.clear();
                return Ok(Some(std::mem::take(&mut self.out).freeze()));
            }

            let end = consumed
                .checked_add(size)
                .ok_or_else(|| OriginError::Malformed("chunk size overflow".to_owned()))?;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(OriginError::Malformed("chunk not terminated by CRLF".to_owned()));
            }
            buf.advance(consumed);
            self.out.extend_from_slice(&buf.split_to(size));
            buf.advance(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serves one canned response and returns the request head it received.
    async fn one_shot(response: &'static [u8]) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            stream.write_all(response).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8(buf).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn content_length_body() {
        let (addr, server) = one_shot(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let origin = HttpOrigin::new(addr).host("example.com");
        let response = origin.fetch("/a?b=1").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"hello"));
        assert_eq!(response.headers.get("Content-Type").map(String::as_str), Some("text/plain"));
        assert!(!response.headers.contains_key("Connection"));
        assert!(!response.headers.contains_key("Content-Length"));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com\r\n"));
    }

    #[tokio::test]
    async fn chunked_body() {
        let (addr, _server) = one_shot(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await;
        let response = HttpOrigin::new(addr).fetch("/").await.unwrap();
        assert_eq!(response.body, Bytes::from_static(b"hello world"));
        assert!(!response.headers.contains_key("Transfer-Encoding"));
    }

    #[tokio::test]
    async fn body_until_close() {
        let (addr, _server) = one_shot(b"HTTP/1.0 404 Not Found\r\n\r\nmissing").await;
        let response = HttpOrigin::new(addr).fetch("/gone").await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, Bytes::from_static(b"missing"));
    }

    #[tokio::test]
    async fn truncated_body_is_malformed() {
        let (addr, _server) = one_shot(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").await;
        let err = HttpOrigin::new(addr).fetch("/").await.unwrap_err();
        assert!(matches!(err, OriginError::Malformed(_)));
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let (addr, _server) = one_shot(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let err = HttpOrigin::new(addr)
            .max_response_bytes(16)
            .fetch("/")
            .await
            .unwrap_err();
        assert!(matches!(err, OriginError::TooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = HttpOrigin::new(addr).fetch("/").await.unwrap_err();
        assert!(matches!(err, OriginError::Connect { .. }));
    }

    /// Serves a chunked response one piece per write.
    async fn trickle(pieces: &'static [&'static [u8]]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 1024];
            let _ = stream.read(&mut chunk).await.unwrap();
            for piece in pieces {
                stream.write_all(piece).await.unwrap();
                stream.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            stream.shutdown().await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn chunked_body_across_many_reads() {
        let addr = trickle(&[
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"5\r\nhel",
            b"lo\r\n",
            b"6\r",
            b"\n world\r\n0\r\nX-Checksum: 1\r\n",
            b"\r\n",
        ])
        .await;
        let response = HttpOrigin::new(addr).fetch("/").await.unwrap();
        assert_eq!(response.body, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn oversized_chunked_body_is_rejected() {
        let addr = trickle(&[
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"28\r\n0123456789012345678901234567890123456789\r\n",
            b"28\r\n0123456789012345678901234567890123456789\r\n0\r\n\r\n",
        ])
        .await;
        let err = HttpOrigin::new(addr)
            .max_response_bytes(64)
            .fetch("/")
            .await
            .unwrap_err();
        assert!(matches!(err, OriginError::TooLarge { limit: 64 }));
    }

    #[test]
    fn decoder_consumes_complete_chunks() {
        let mut decoder = ChunkedDecoder::default();
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n6\r\n wo"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(decoder.decoded_len(), 5);
        assert_eq!(&buf[..], b"6\r\n wo");

        buf.extend_from_slice(b"rld\r\n0\r\n");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"0\r\n");

        buf.extend_from_slice(b"\r\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Bytes::from_static(b"hello world"))
        );
    }

    #[test]
    fn decoder_rejects_bad_framing() {
        let mut buf = BytesMut::from(&b"3\r\nabcX\n0\r\n\r\n"[..]);
        assert!(ChunkedDecoder::default().decode(&mut buf).is_err());
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(ChunkedDecoder::default().decode(&mut buf).is_err());
    }
}
