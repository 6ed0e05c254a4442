//! Connection pools for tunnel sessions
//!
//! A connection pool owns one listening TCP port per session. The tunnel client
//! dials that port with a handful of connections which are then handed out, one
//! per public request, to relay traffic back to the operator's local service.

pub mod pool;
pub mod tcp;

pub use pool::{
    ConnectionPool, PoolError, PoolEvent, PoolFactory, PoolInfo, PoolStats, TunnelIo,
    TunnelStream,
};
pub use tcp::{TcpConnectionPool, TcpPoolConfig, TcpPoolFactory};
