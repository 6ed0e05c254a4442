//! Connection pool contract consumed by tunnel sessions

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

/// Byte stream obtained from a pool
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A live bidirectional connection to the tunnel client
pub type TunnelStream = Box<dyn TunnelIo>;

/// Connection pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Listen {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Connection pool exhausted")]
    Exhausted,

    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),
}

/// Signals emitted by a pool as its underlying transports come and go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// At least one usable transport is connected
    Online,
    /// No usable transport is left
    Offline,
    /// A liveness probe was acknowledged
    Pong,
    /// The pool is unusable
    Error(String),
    /// The pool was destroyed
    Closed,
}

/// Information reported once a pool is listening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    pub port: u16,
}

/// Read-only snapshot of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle plus handed-out transports the tunnel client currently holds open
    pub connected_sockets: usize,
    /// Callers waiting for a transport to arrive
    pub waiting_requests: usize,
    /// Listening port, once bound
    pub port: Option<u16>,
}

/// A pool of tunnel-side connections for one session
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Start listening for tunnel-side connections
    async fn listen(&self) -> Result<PoolInfo, PoolError>;

    /// Obtain one connection for outbound relay
    async fn create_connection(&self) -> Result<TunnelStream, PoolError>;

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<PoolEvent>;

    /// Issue a liveness probe. Acknowledgement arrives as [`PoolEvent::Pong`].
    async fn ping(&self);

    fn stats(&self) -> PoolStats;

    /// Release the listening port and every transport. Idempotent.
    fn destroy(&self);
}

/// Creates pools for sessions
pub trait PoolFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Arc<dyn ConnectionPool>;
}
