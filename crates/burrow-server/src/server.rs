//! Public front end
//!
//! Accepts public connections and decides, per connection, how to serve it:
//! an upgrade request as the first request hands the raw socket to the
//! session; anything else is served as HTTP/1 with keep-alive and routed per
//! request by `Host`.

use crate::api::{message, ManagementApi};
use crate::config::RelayConfig;
use burrow_control::{read_request_head, HeadError, HeadRead, ProxyBody, SessionRegistry};
use bytes::Bytes;
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Public HTTP listener routing traffic to tunnel sessions
#[derive(Clone)]
pub struct RelayServer {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    api: ManagementApi,
}

impl RelayServer {
    pub fn new(config: RelayConfig, registry: Arc<SessionRegistry>) -> Self {
        let config = Arc::new(config);
        Self {
            api: ManagementApi::new(registry.clone(), config.clone()),
            config,
            registry,
        }
    }

    /// Bind the public address, retrying briefly while it lingers in TIME_WAIT
    pub async fn bind(&self) -> Result<TcpListener, RelayServerError> {
        let bind_addr = self.config.bind_addr;

        for attempt in 1..=3 {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Successfully bound to {} on attempt {}/3", bind_addr, attempt);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3), retrying in 1 second...",
                        bind_addr.port(),
                        attempt
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(RelayServerError::BindError {
                        address: bind_addr.ip().to_string(),
                        port: bind_addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(RelayServerError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Bind and serve until the task is dropped
    pub async fn start(self) -> Result<(), RelayServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve public connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayServerError> {
        info!("Relay listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New public connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept public connection: {}", e);
                }
            }
        }
    }

    /// Serve one public connection
    pub async fn handle_connection<S>(&self, mut stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let read = match read_request_head(&mut stream, self.config.max_head_size).await {
            Ok(Some(read)) => read,
            Ok(None) => return,
            Err(HeadError::Io(e)) => {
                debug!("Public connection from {} failed: {}", peer_addr, e);
                return;
            }
            Err(e) => {
                debug!("Bad request head from {}: {}", peer_addr, e);
                let status = match e {
                    HeadError::TooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    _ => StatusCode::BAD_REQUEST,
                };
                let _ = write_raw_response(&mut stream, status, "Bad Request").await;
                return;
            }
        };

        if read.head.is_upgrade() {
            self.relay_upgrade(read, stream, peer_addr).await;
            return;
        }

        // hyper re-reads the head we consumed, then the rest of the stream.
        let io = TokioIo::new(Rewind::new(read.buffer.freeze(), stream));
        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.route(req).await) }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            debug!("Public connection from {} ended: {}", peer_addr, e);
        }
    }

    async fn relay_upgrade<S>(&self, read: HeadRead, mut stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session = read
            .head
            .host()
            .and_then(|host| session_id_from_host(host, self.config.domain.as_deref()))
            .and_then(|id| self.registry.get_session(id));

        let Some(session) = session else {
            debug!(
                "Upgrade from {} for unknown tunnel {:?}",
                peer_addr,
                read.head.host()
            );
            let _ = write_raw_response(&mut stream, StatusCode::NOT_FOUND, "Tunnel not found").await;
            return;
        };

        let leftover = Bytes::copy_from_slice(read.leftover());
        if let Err(e) = session.handle_upgrade(read.head, leftover, stream).await {
            debug!("Upgrade from {} for {} ended: {}", peer_addr, session.id(), e);
        }
    }

    /// Route one request of a keep-alive connection
    async fn route(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let session_id = req
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .and_then(|host| session_id_from_host(host, self.config.domain.as_deref()))
            .map(str::to_string);

        let Some(session_id) = session_id else {
            return self.api.handle(req).await;
        };

        if is_upgrade_request(req.headers()) {
            debug!("Rejecting upgrade for {} mid-connection", session_id);
            return message(
                StatusCode::BAD_REQUEST,
                "Upgrade must be the first request on a connection",
            );
        }

        match self.registry.get_session(&session_id) {
            Some(session) => session.handle_request(req).await,
            None => message(StatusCode::NOT_FOUND, "Tunnel not found"),
        }
    }
}

/// Session identity addressed by a `Host` value
///
/// With a base domain the identity is the label directly left of it. Without
/// one, hosts with at least three labels use their first label.
pub fn session_id_from_host<'a>(host: &'a str, domain: Option<&str>) -> Option<&'a str> {
    let host = host.trim();
    let host = host.split(':').next().unwrap_or(host).trim_end_matches('.');

    let subdomain = match domain {
        Some(domain) => {
            let domain = domain.trim_end_matches('.');
            let split = host.len().checked_sub(domain.len())?;
            let suffix = host.get(split..)?;
            if !suffix.eq_ignore_ascii_case(domain) {
                return None;
            }
            let prefix = host.get(..split)?.strip_suffix('.')?;
            prefix.rsplit('.').next()?
        }
        None => {
            if host.parse::<IpAddr>().is_ok() || host.split('.').count() < 3 {
                return None;
            }
            host.split('.').next()?
        }
    };

    (!subdomain.is_empty()).then_some(subdomain)
}

/// `Connection: upgrade` together with an `Upgrade` header
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Minimal response for connections that never reach hyper
async fn write_raw_response<S>(stream: &mut S, status: StatusCode, text: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = serde_json::json!({ "message": text }).to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Replays already consumed bytes ahead of the underlying stream
struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix.split_to(n));
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
