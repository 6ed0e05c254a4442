//! Raw HTTP request heads
//!
//! Upgrade requests are relayed as raw bytes, so the request line and header
//! block must be replayed exactly as the public client sent them: same order,
//! same casing, same values.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEADERS: usize = 128;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("Request head exceeds {0} bytes")]
    TooLarge(usize),
}

/// Request line and headers of one HTTP/1.x request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent, e.g. `/chat?room=1`
    pub target: String,
    /// HTTP/1.x minor version
    pub version: u8,
    /// Headers in original order and casing
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Parse a head from the start of `buf`
    ///
    /// Returns the head and its length in bytes, or `None` if more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let head_len = match request.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let head = RequestHead {
            method: request.method.unwrap_or("GET").to_string(),
            target: request.path.unwrap_or("/").to_string(),
            version: request.version.unwrap_or(1),
            headers: request
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        };

        Ok(Some((head, head_len)))
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// `Host` header without port
    pub fn host(&self) -> Option<&str> {
        let host = std::str::from_utf8(self.header("host")?).ok()?.trim();
        Some(host.split(':').next().unwrap_or(host))
    }

    /// Whether the client asks to switch protocols
    pub fn is_upgrade(&self) -> bool {
        let connection_upgrade = self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("connection"))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

        connection_upgrade && self.header("upgrade").is_some()
    }

    /// Re-create the request line and header block
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Result of reading a head off a stream
#[derive(Debug)]
pub struct HeadRead {
    pub head: RequestHead,
    /// Every byte consumed from the stream, head included
    pub buffer: BytesMut,
    /// Length of the head within `buffer`
    pub head_len: usize,
}

impl HeadRead {
    /// Bytes read past the head
    pub fn leftover(&self) -> &[u8] {
        &self.buffer[self.head_len..]
    }
}

/// Read until a complete request head is buffered
///
/// Returns `None` if the peer closes before sending anything.
pub async fn read_request_head<R>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<HeadRead>, HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);

    loop {
        if buffer.len() >= limit {
            return Err(HeadError::TooLarge(limit));
        }

        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(HeadError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }

        if let Some((head, head_len)) = RequestHead::parse(&buffer)? {
            return Ok(Some(HeadRead {
                head,
                buffer,
                head_len,
            }));
        }
    }
}
