//! Session registry
//!
//! Maps public identities to sessions. The registry is the only place that
//! inserts or removes entries; sessions report their own end of life back to it.

use crate::config::RegistryConfig;
use crate::id::random_id;
use crate::session::{Session, SessionObserver};
use burrow_pool::{PoolError, PoolFactory};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to start tunnel pool for {id}: {source}")]
    Listen {
        id: String,
        #[source]
        source: PoolError,
    },

    #[error("Session {0} closed while its pool was starting")]
    Closed(String),
}

/// What a tunnel client needs to connect its pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    /// Port the tunnel client dials
    pub port: u16,
    /// Tunnel connection quota for this session
    pub max_conn_count: usize,
}

/// Aggregate registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Pools attached across all live sessions
    pub tunnels: usize,
    /// Live sessions
    pub sessions: usize,
}

struct RegistryInner {
    config: RegistryConfig,
    factory: Arc<dyn PoolFactory>,
    sessions: DashMap<String, Arc<Session>>,
    tunnels: AtomicUsize,
    this: Weak<RegistryInner>,
}

impl RegistryInner {
    fn new_session(&self, id: &str) -> Arc<Session> {
        let observer: Weak<dyn SessionObserver> = self.this.clone();
        let session = Session::new(id, self.config.session.clone(), Some(observer));
        info!("Created new session: {}", id);
        session
    }

    /// Resolve the session a new pool should join, substituting the identity
    /// when single-identity mode finds it taken
    fn claim_session(&self, requested_id: &str) -> Arc<Session> {
        let mut id = requested_id.to_string();

        loop {
            match self.sessions.entry(id.clone()) {
                Entry::Occupied(mut entry) => {
                    if entry.get().is_closed() {
                        // Its removal is in flight; a fresh session takes the slot.
                        let session = self.new_session(&id);
                        let stale = entry.insert(session.clone());
                        self.tunnels
                            .fetch_sub(stale.counted_pools(), Ordering::SeqCst);
                        return session;
                    }
                    if self.config.multi_pool {
                        return entry.get().clone();
                    }
                    let substitute = random_id();
                    debug!("Session id {} is taken, trying {}", id, substitute);
                    id = substitute;
                }
                Entry::Vacant(entry) => {
                    let session = self.new_session(&id);
                    entry.insert(session.clone());
                    return session;
                }
            }
        }
    }

    fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            self.finish_removal(session);
        }
    }

    /// Remove `session` only if it still owns its identity
    fn remove_exact(&self, session: &Session) {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, current| std::ptr::eq(current.as_ref(), session));
        if let Some((_, session)) = removed {
            self.finish_removal(session);
        }
    }

    fn finish_removal(&self, session: Arc<Session>) {
        // Once closed, the session's tally can no longer grow.
        session.close();
        self.tunnels
            .fetch_sub(session.counted_pools(), Ordering::SeqCst);
        info!("Removed session: {}", session.id());
    }
}

impl SessionObserver for RegistryInner {
    fn session_closed(&self, session: &Session) {
        self.remove_exact(session);
    }
}

/// Registry of live tunnel sessions
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            inner: Arc::new_cyclic(|this| RegistryInner {
                config,
                factory,
                sessions: DashMap::new(),
                tunnels: AtomicUsize::new(0),
                this: this.clone(),
            }),
        }
    }

    /// Register a new pool under `requested_id`
    ///
    /// In single-identity mode a taken identity is replaced by a random one.
    /// If the pool cannot listen, it is detached again, and a session left
    /// without pools is removed, before the error is returned.
    pub async fn create_session(&self, requested_id: &str) -> Result<SessionInfo, RegistryError> {
        let (session, pool, attachment_id) = loop {
            let session = self.inner.claim_session(requested_id);
            let pool = self.inner.factory.create(session.id());
            if let Some(attachment_id) = session.attach(pool.clone()) {
                break (session, pool, attachment_id);
            }
        };

        match pool.listen().await {
            Ok(info) => {
                let tunnels = &self.inner.tunnels;
                let counted = session.count_pool(|| {
                    tunnels.fetch_add(1, Ordering::SeqCst);
                });
                if !counted {
                    return Err(RegistryError::Closed(session.id().to_string()));
                }
                Ok(SessionInfo {
                    id: session.id().to_string(),
                    port: info.port,
                    max_conn_count: self.inner.config.max_tcp_sockets,
                })
            }
            Err(source) => {
                session.detach(attachment_id);
                if session.pool_count() == 0 {
                    self.inner.remove_exact(&session);
                }
                Err(RegistryError::Listen {
                    id: session.id().to_string(),
                    source,
                })
            }
        }
    }

    /// Remove a session and close its pools. No-op if absent.
    pub fn remove_session(&self, id: &str) {
        self.inner.remove(id);
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.inner.sessions.contains_key(id)
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnels: self.inner.tunnels.load(Ordering::SeqCst),
            sessions: self.inner.sessions.len(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let ids: Vec<String> = self.session_ids();
        for id in ids {
            self.inner.remove(&id);
        }
    }
}
