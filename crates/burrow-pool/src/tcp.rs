//! TCP connection pool
//!
//! Listens on a dedicated port for one session. The tunnel client opens up to
//! `max_sockets` connections which sit idle until a public request claims one.
//! Claimed sockets keep counting as connected until the caller drops them.

use crate::pool::{
    ConnectionPool, PoolError, PoolEvent, PoolFactory, PoolInfo, PoolStats, TunnelStream,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;
const PROBE_BUFFER: usize = 4096;

/// TCP pool configuration
#[derive(Debug, Clone)]
pub struct TcpPoolConfig {
    /// Address the tunnel-side listener binds to
    pub bind_ip: IpAddr,
    /// Port to bind, 0 picks a free one
    pub port: u16,
    /// Maximum simultaneous tunnel-side connections
    pub max_sockets: usize,
    /// How long a liveness probe waits for a response head
    pub probe_timeout: Duration,
}

impl Default for TcpPoolConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_sockets: 10,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds a [`TcpConnectionPool`] per session
#[derive(Debug, Clone, Default)]
pub struct TcpPoolFactory {
    config: TcpPoolConfig,
}

impl TcpPoolFactory {
    pub fn new(config: TcpPoolConfig) -> Self {
        Self { config }
    }
}

impl PoolFactory for TcpPoolFactory {
    fn create(&self, session_id: &str) -> Arc<dyn ConnectionPool> {
        Arc::new(TcpConnectionPool::new(session_id, self.config.clone()))
    }
}

/// Handle used to take a socket away from its idle watcher
type ClaimSender = oneshot::Sender<oneshot::Sender<PooledSocket>>;

struct IdleSocket {
    id: u64,
    claim: ClaimSender,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleSocket>,
    waiters: VecDeque<oneshot::Sender<PooledSocket>>,
    connected: usize,
    port: Option<u16>,
    accept_task: Option<JoinHandle<()>>,
    next_socket_id: u64,
    destroyed: bool,
}

struct PoolShared {
    session_id: String,
    config: TcpPoolConfig,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine; sessions subscribe right after creation.
        let _ = self.events.send(event);
    }

    fn release_slot(&self) {
        let went_offline = {
            let mut state = self.state();
            state.connected = state.connected.saturating_sub(1);
            state.connected == 0 && !state.destroyed
        };

        if went_offline {
            debug!("Pool for {} has no connected sockets", self.session_id);
            self.emit(PoolEvent::Offline);
        }
    }
}

/// One occupied connection slot, released on drop
struct Slot {
    shared: Arc<PoolShared>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.shared.release_slot();
    }
}

/// Socket handed out by the pool
///
/// Dropping it releases the slot it occupies in the pool.
pub struct PooledSocket {
    stream: TcpStream,
    _slot: Slot,
}

impl AsyncRead for PooledSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Connection pool backed by a TCP listener
pub struct TcpConnectionPool {
    shared: Arc<PoolShared>,
}

impl TcpConnectionPool {
    pub fn new(session_id: &str, config: TcpPoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(PoolShared {
                session_id: session_id.to_string(),
                config,
                state: Mutex::new(PoolState::default()),
                events,
            }),
        }
    }

    async fn accept_loop(shared: Arc<PoolShared>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    Self::admit(&shared, stream, peer_addr);
                }
                Err(e) => {
                    error!(
                        "Failed to accept tunnel connection for {}: {}",
                        shared.session_id, e
                    );
                }
            }
        }
    }

    /// Register a freshly accepted tunnel socket
    fn admit(shared: &Arc<PoolShared>, stream: TcpStream, peer_addr: SocketAddr) {
        let (came_online, socket_id) = {
            let mut state = shared.state();
            if state.destroyed {
                return;
            }
            if state.connected >= shared.config.max_sockets {
                debug!(
                    "Rejecting tunnel connection from {} for {}: {} sockets already connected",
                    peer_addr, shared.session_id, state.connected
                );
                return;
            }
            state.connected += 1;
            state.next_socket_id += 1;
            (state.connected == 1, state.next_socket_id)
        };

        debug!(
            "Tunnel connection {} from {} for {}",
            socket_id, peer_addr, shared.session_id
        );

        if came_online {
            shared.emit(PoolEvent::Online);
        }

        let socket = PooledSocket {
            stream,
            _slot: Slot {
                shared: shared.clone(),
            },
        };
        Self::offer(shared, socket_id, socket);
    }

    /// Hand a socket to the oldest waiter, or park it in the idle queue
    fn offer(shared: &Arc<PoolShared>, socket_id: u64, mut socket: PooledSocket) {
        let (claim, claim_rx) = oneshot::channel();
        {
            // Waiters and the idle queue change under one lock, so a request
            // never parks while a socket sits idle.
            let mut state = shared.state();
            if state.destroyed {
                return;
            }
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.send(socket) {
                    Ok(()) => return,
                    Err(returned) => socket = returned,
                }
            }
            state.idle.push_back(IdleSocket {
                id: socket_id,
                claim,
            });
        }

        tokio::spawn(Self::watch_idle(shared.clone(), socket_id, socket, claim_rx));
    }

    /// Owns an idle socket until it is claimed or the tunnel side closes it
    async fn watch_idle(
        shared: Arc<PoolShared>,
        socket_id: u64,
        socket: PooledSocket,
        mut claim_rx: oneshot::Receiver<oneshot::Sender<PooledSocket>>,
    ) {
        let mut probe = [0u8; 1];
        let mut watching = true;

        loop {
            let claimed = if watching {
                tokio::select! {
                    claim = &mut claim_rx => Some(claim),
                    peeked = socket.stream.peek(&mut probe) => {
                        match peeked {
                            Ok(0) | Err(_) => None,
                            // Unsolicited bytes stay buffered for whoever claims the socket.
                            Ok(_) => {
                                watching = false;
                                continue;
                            }
                        }
                    }
                }
            } else {
                Some((&mut claim_rx).await)
            };

            match claimed {
                Some(Ok(reply)) => {
                    // If the claimer vanished the socket drops here, releasing its slot.
                    let _ = reply.send(socket);
                }
                Some(Err(_)) => {
                    // Pool destroyed; dropping the socket closes it.
                }
                None => {
                    debug!(
                        "Idle tunnel socket {} for {} closed",
                        socket_id, shared.session_id
                    );
                    shared.state().idle.retain(|s| s.id != socket_id);
                }
            }
            return;
        }
    }

    /// Take an idle socket without waiting
    async fn claim_idle(&self) -> Option<PooledSocket> {
        loop {
            let idle = self.shared.state().idle.pop_front()?;
            if let Some(socket) = Self::claim(idle).await {
                return Some(socket);
            }
        }
    }

    /// Ask an idle socket's watcher to hand the socket over
    async fn claim(idle: IdleSocket) -> Option<PooledSocket> {
        let (reply, reply_rx) = oneshot::channel();
        idle.claim.send(reply).ok()?;
        reply_rx.await.ok()
    }

    async fn probe(&self, socket: &mut PooledSocket) -> io::Result<bool> {
        let request = format!(
            "HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.shared.session_id
        );
        socket.write_all(request.as_bytes()).await?;

        let mut buffer = Vec::with_capacity(PROBE_BUFFER);
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Ok(false);
            }
            buffer.extend_from_slice(&chunk[..n]);

            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buffer) {
                Ok(httparse::Status::Complete(_)) => return Ok(true),
                Ok(httparse::Status::Partial) if buffer.len() < PROBE_BUFFER => continue,
                Ok(httparse::Status::Partial) => return Ok(false),
                Err(_) => return Ok(false),
            }
        }
    }
}

#[async_trait]
impl ConnectionPool for TcpConnectionPool {
    async fn listen(&self) -> Result<PoolInfo, PoolError> {
        let bind_addr = SocketAddr::new(self.shared.config.bind_ip, self.shared.config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| PoolError::Listen {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            })?;
        let port = listener.local_addr()?.port();

        let task = tokio::spawn(Self::accept_loop(self.shared.clone(), listener));
        {
            let mut state = self.shared.state();
            if state.destroyed {
                task.abort();
                return Err(PoolError::Exhausted);
            }
            state.port = Some(port);
            state.accept_task = Some(task);
        }

        info!(
            "Tunnel pool for {} listening on port {}",
            self.shared.session_id, port
        );
        Ok(PoolInfo { port })
    }

    async fn create_connection(&self) -> Result<TunnelStream, PoolError> {
        loop {
            let next = {
                let mut state = self.shared.state();
                if state.destroyed {
                    return Err(PoolError::Exhausted);
                }
                // Requests that gave up leave their sender behind.
                state.waiters.retain(|waiter| !waiter.is_closed());
                match state.idle.pop_front() {
                    Some(idle) => Ok(idle),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_back(tx);
                        Err(rx)
                    }
                }
            };

            match next {
                Ok(idle) => {
                    if let Some(socket) = Self::claim(idle).await {
                        return Ok(Box::new(socket));
                    }
                }
                Err(waiter) => {
                    debug!(
                        "Waiting for a tunnel connection for {}",
                        self.shared.session_id
                    );
                    let socket = waiter.await.map_err(|_| PoolError::Exhausted)?;
                    return Ok(Box::new(socket));
                }
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    async fn ping(&self) {
        let Some(mut socket) = self.claim_idle().await else {
            // Every socket is relaying traffic, which is proof enough.
            if self.shared.state().connected > 0 {
                self.shared.emit(PoolEvent::Pong);
            } else {
                debug!(
                    "No idle tunnel socket to probe for {}",
                    self.shared.session_id
                );
            }
            return;
        };

        let probed =
            tokio::time::timeout(self.shared.config.probe_timeout, self.probe(&mut socket)).await;
        match probed {
            Ok(Ok(true)) => self.shared.emit(PoolEvent::Pong),
            Ok(Ok(false)) => debug!("Probe for {} got no response", self.shared.session_id),
            Ok(Err(e)) => debug!("Probe for {} failed: {}", self.shared.session_id, e),
            Err(_) => warn!("Probe for {} timed out", self.shared.session_id),
        }
        // The probe closes its socket; releasing it after the Pong keeps any
        // Offline it causes as the latest event.
        drop(socket);
    }

    fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        PoolStats {
            connected_sockets: state.connected,
            waiting_requests: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            port: state.port,
        }
    }

    fn destroy(&self) {
        let (task, idle, waiters) = {
            let mut state = self.shared.state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            (
                state.accept_task.take(),
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };

        if let Some(task) = task {
            task.abort();
        }
        // Dropping claim handles ends the idle watchers; dropping waiters fails them.
        drop(idle);
        drop(waiters);

        debug!("Tunnel pool for {} destroyed", self.shared.session_id);
        self.shared.emit(PoolEvent::Closed);
    }
}

impl Drop for TcpConnectionPool {
    fn drop(&mut self) {
        self.destroy();
    }
}
