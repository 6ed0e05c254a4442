//! In-memory connection pool for exercising sessions without sockets
//!
//! Every connection handed out is one end of a duplex pipe; the other end is
//! delivered to the test, which plays the operator's local service.

#![allow(dead_code)]

use async_trait::async_trait;
use burrow_control::{RegistryConfig, SessionRegistry};
use burrow_pool::{
    ConnectionPool, PoolError, PoolEvent, PoolFactory, PoolInfo, PoolStats, TunnelStream,
};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc, Notify};

const DUPLEX_BUFFER: usize = 64 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct MockPool {
    pub session_id: String,
    port: u16,
    events: broadcast::Sender<PoolEvent>,
    tunnel_tx: mpsc::UnboundedSender<DuplexStream>,
    tunnel_rx: Mutex<Option<mpsc::UnboundedReceiver<DuplexStream>>>,
    fail_listen: bool,
    hold_listen: bool,
    /// Lets a held `listen` finish
    pub release_listen: Notify,
    /// Answer every ping with a pong
    pub answer_pings: AtomicBool,
    /// Never hand out a connection
    pub stall_connections: AtomicBool,
    pub pings: AtomicUsize,
    pub destroyed: AtomicBool,
}

impl MockPool {
    pub fn new(session_id: &str, port: u16, fail_listen: bool, hold_listen: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (tunnel_tx, tunnel_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            session_id: session_id.to_string(),
            port,
            events,
            tunnel_tx,
            tunnel_rx: Mutex::new(Some(tunnel_rx)),
            fail_listen,
            hold_listen,
            release_listen: Notify::new(),
            answer_pings: AtomicBool::new(false),
            stall_connections: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    /// Tunnel-side ends of every connection the pool hands out
    pub fn tunnel_side(&self) -> mpsc::UnboundedReceiver<DuplexStream> {
        self.tunnel_rx
            .lock()
            .unwrap()
            .take()
            .expect("tunnel side already taken")
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn listen(&self) -> Result<PoolInfo, PoolError> {
        if self.hold_listen {
            self.release_listen.notified().await;
        }
        if self.fail_listen {
            return Err(PoolError::Listen {
                address: "127.0.0.1".to_string(),
                port: self.port,
                reason: "Address already in use".to_string(),
            });
        }
        Ok(PoolInfo { port: self.port })
    }

    async fn create_connection(&self) -> Result<TunnelStream, PoolError> {
        if self.is_destroyed() {
            return Err(PoolError::Exhausted);
        }
        if self.stall_connections.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
        self.tunnel_tx
            .send(far)
            .map_err(|_| PoolError::Exhausted)?;
        Ok(Box::new(near))
    }

    fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.answer_pings.load(Ordering::SeqCst) {
            self.emit(PoolEvent::Pong);
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            connected_sockets: if self.is_destroyed() { 0 } else { 1 },
            waiting_requests: 0,
            port: Some(self.port),
        }
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockFactory {
    pools: Mutex<Vec<Arc<MockPool>>>,
    pub fail_listen: AtomicBool,
    /// Park `listen` until the test releases it
    pub hold_listen: AtomicBool,
    next_port: AtomicU16,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(40000),
            ..Default::default()
        })
    }

    pub fn last_pool(&self) -> Arc<MockPool> {
        self.pools
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no pool created yet")
    }

    pub fn pools(&self) -> Vec<Arc<MockPool>> {
        self.pools.lock().unwrap().clone()
    }
}

impl PoolFactory for MockFactory {
    fn create(&self, session_id: &str) -> Arc<dyn ConnectionPool> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let pool = MockPool::new(
            session_id,
            port,
            self.fail_listen.load(Ordering::SeqCst),
            self.hold_listen.load(Ordering::SeqCst),
        );
        self.pools.lock().unwrap().push(pool.clone());
        pool
    }
}

pub fn registry(multi_pool: bool) -> (SessionRegistry, Arc<MockFactory>) {
    let factory = MockFactory::new();
    let config = RegistryConfig {
        multi_pool,
        ..Default::default()
    };
    (SessionRegistry::new(config, factory.clone()), factory)
}
