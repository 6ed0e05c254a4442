//! Relaying public traffic through a session's pools
//!
//! Plain requests are re-issued with hyper over a pooled connection and the
//! response streamed back. Upgrade requests skip HTTP entirely: the original
//! head is replayed onto a pooled connection and bytes are piped both ways.

use crate::head::RequestHead;
use crate::session::Session;
use burrow_pool::{PoolError, TunnelStream};
use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Response body handed back to the public side
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const UPGRADE_READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Session {0} has no connection pools")]
    Unavailable(String),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Public socket closed while waiting for a tunnel connection")]
    ClientGone,
}

/// Plain-text response
pub fn text_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Wrap bytes in a [`ProxyBody`]
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Reset and timeout are how public clients normally disappear
fn is_expected_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::TimedOut
    )
}

impl Session {
    /// Relay one HTTP request through the next pool
    ///
    /// Failures before a response head arrives become `502 Bad Gateway`. A
    /// failure while the body is streaming surfaces as a body error, which
    /// aborts the public connection.
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        debug!("> {} {}", self.id(), req.uri());

        match self.forward_request(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request for {} failed: {}", self.id(), e);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    async fn forward_request<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let pool = self
            .next_pool()
            .ok_or_else(|| ProxyError::Unavailable(self.id().to_string()))?;
        let stream = pool.create_connection().await?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

        let session_id = self.id().to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Tunnel HTTP connection for {} ended: {}", session_id, e);
            }
        });

        let uri = req.uri().clone();
        let response = sender.send_request(req).await?;
        debug!("< {} {} {}", self.id(), uri, response.status());

        let session_id = self.id().to_string();
        let (parts, body) = response.into_parts();
        let body = body
            .map_err(move |e| {
                warn!(
                    "Response body for {} {} failed mid-stream, truncating: {}",
                    session_id, uri, e
                );
                e
            })
            .boxed_unsync();

        Ok(Response::from_parts(parts, body))
    }

    /// Relay an upgrade request as a raw byte stream
    ///
    /// `leftover` holds bytes the public client sent after the head. While a
    /// pooled connection is pending the public socket is watched; if it
    /// closes, the attempt is abandoned.
    pub async fn handle_upgrade<S>(
        &self,
        head: RequestHead,
        leftover: Bytes,
        mut socket: S,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        debug!("> [up] {} {}", self.id(), head.target);

        let Some(pool) = self.next_pool() else {
            let _ = socket.shutdown().await;
            return Err(ProxyError::Unavailable(self.id().to_string()));
        };

        let mut pending = BytesMut::from(&leftover[..]);
        let acquired = {
            let acquire = pool.create_connection();
            tokio::pin!(acquire);
            let mut buf = [0u8; UPGRADE_READ_CHUNK];

            loop {
                tokio::select! {
                    result = &mut acquire => break result.map_err(ProxyError::from),
                    read = socket.read(&mut buf) => match read {
                        Ok(0) => break Err(ProxyError::ClientGone),
                        Ok(n) => pending.extend_from_slice(&buf[..n]),
                        Err(e) => {
                            debug!("Public socket for {} failed while waiting: {}", self.id(), e);
                            break Err(ProxyError::ClientGone);
                        }
                    },
                }
            }
        };

        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(e) => {
                let _ = socket.shutdown().await;
                return Err(e);
            }
        };

        debug!("< [up] {} {}", self.id(), head.target);

        conn.write_all(&head.to_bytes()).await?;
        if !pending.is_empty() {
            conn.write_all(&pending).await?;
        }

        self.pipe(socket, conn).await;
        Ok(())
    }

    /// Copy bytes both ways until one direction fails or both finish
    async fn pipe<S>(&self, socket: S, conn: TunnelStream)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut public_read, mut public_write) = tokio::io::split(socket);
        let (mut tunnel_read, mut tunnel_write) = tokio::io::split(conn);

        let inbound = async {
            let copied = tokio::io::copy(&mut public_read, &mut tunnel_write).await;
            let _ = tunnel_write.shutdown().await;
            copied
        };
        let outbound = async {
            let copied = tokio::io::copy(&mut tunnel_read, &mut public_write).await;
            let _ = public_write.shutdown().await;
            copied
        };
        tokio::pin!(inbound);
        tokio::pin!(outbound);

        let (first, finished) = tokio::select! {
            result = &mut inbound => (result, Direction::Inbound),
            result = &mut outbound => (result, Direction::Outbound),
        };

        // A failed direction tears down both; a clean close lets the other drain.
        if let Err(e) = first {
            self.report_pipe_error(finished, &e);
            return;
        }

        let pending = finished.other();
        let remaining = match pending {
            Direction::Inbound => inbound.await,
            Direction::Outbound => outbound.await,
        };
        if let Err(e) = remaining {
            self.report_pipe_error(pending, &e);
        }
    }

    fn report_pipe_error(&self, direction: Direction, err: &io::Error) {
        if is_expected_disconnect(err) {
            debug!(
                "Upgrade stream for {} closed ({:?}): {}",
                self.id(),
                direction,
                err
            );
        } else {
            warn!(
                "Upgrade stream for {} failed ({:?}): {}",
                self.id(),
                direction,
                err
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// Public client to tunnel
    Inbound,
    /// Tunnel to public client
    Outbound,
}

impl Direction {
    fn other(self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}
