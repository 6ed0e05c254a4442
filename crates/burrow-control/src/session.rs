//! Tunnel sessions and pool supervision
//!
//! A session owns the connection pools registered under one public identity.
//! Every attached pool gets a supervisor task that owns its timers and reacts
//! to the pool's events:
//!
//! ```text
//! connecting --(liveness confirmed)--> online
//! connecting --(grace timeout)-------> closed
//! online     --(liveness lost)-------> offline
//! offline    --(liveness confirmed)--> online
//! offline    --(grace timeout)-------> closed
//! any        --(pool error)----------> closed
//! ```
//!
//! All transitions of one attachment happen inside its supervisor, so they are
//! applied one at a time. When the last attachment closes the session reports
//! its end of life to its observer exactly once.

use crate::config::SessionConfig;
use burrow_pool::{ConnectionPool, PoolEvent, PoolStats};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies one pool attachment within a session
pub type AttachmentId = u64;

/// Liveness of one attached pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveState {
    Connecting,
    Online,
    Offline,
    Closed,
}

/// Why an attachment was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Never confirmed, or not back online, before the grace period ran out
    GraceExpired,
    /// No liveness confirmation within the heartbeat timeout
    HeartbeatTimeout,
    /// The pool reported a fatal error
    PoolError(String),
    /// The pool was destroyed underneath the session
    PoolClosed,
    /// Removed explicitly (rollback or session teardown)
    Detached,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::GraceExpired => write!(f, "grace period expired"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::PoolError(e) => write!(f, "pool error: {}", e),
            CloseReason::PoolClosed => write!(f, "pool closed"),
            CloseReason::Detached => write!(f, "detached"),
        }
    }
}

/// Receives a session's end-of-life notice
pub trait SessionObserver: Send + Sync {
    fn session_closed(&self, session: &Session);
}

struct Attachment {
    id: AttachmentId,
    pool: Arc<dyn ConnectionPool>,
    state: AliveState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SessionState {
    attachments: Vec<Attachment>,
    cursor: usize,
    next_attachment_id: AttachmentId,
    /// Set once the end-of-life notice has been issued
    closed: bool,
}

/// One operator identity and its attached pools
pub struct Session {
    id: String,
    config: SessionConfig,
    state: Mutex<SessionState>,
    observer: Option<Weak<dyn SessionObserver>>,
    /// Successful pool attaches accounted in the registry's statistics
    counted_pools: AtomicUsize,
    this: Weak<Session>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        config: SessionConfig,
        observer: Option<Weak<dyn SessionObserver>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: id.into(),
            config,
            state: Mutex::new(SessionState::default()),
            observer,
            counted_pools: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a pool and start supervising it
    ///
    /// Returns `None` if the session has already reached its end of life.
    pub fn attach(&self, pool: Arc<dyn ConnectionPool>) -> Option<AttachmentId> {
        // Subscribe before the supervisor exists so no event is missed.
        let events = pool.subscribe();
        let cancel = CancellationToken::new();

        let attachment_id = {
            let mut state = self.state();
            if state.closed {
                return None;
            }
            state.next_attachment_id += 1;
            let attachment_id = state.next_attachment_id;
            state.attachments.push(Attachment {
                id: attachment_id,
                pool: pool.clone(),
                state: AliveState::Connecting,
                cancel: cancel.clone(),
            });
            attachment_id
        };

        debug!("Session {} attached pool {}", self.id, attachment_id);

        tokio::spawn(supervise(
            self.this.clone(),
            attachment_id,
            pool,
            events,
            cancel,
            self.config.clone(),
        ));

        Some(attachment_id)
    }

    /// Close one attachment
    pub fn detach(&self, attachment_id: AttachmentId) {
        self.close_attachment(attachment_id, CloseReason::Detached);
    }

    /// Force-close every attachment. Idempotent.
    pub fn close(&self) {
        let (attachments, notify) = {
            let mut state = self.state();
            let attachments = std::mem::take(&mut state.attachments);
            state.cursor = 0;
            let notify = !state.closed;
            state.closed = true;
            (attachments, notify)
        };

        for attachment in attachments {
            attachment.cancel.cancel();
            attachment.pool.destroy();
        }

        if notify {
            info!("Session {} closed", self.id);
            self.notify_closed();
        }
    }

    /// Whether the end-of-life notice has been issued
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn pool_count(&self) -> usize {
        self.state().attachments.len()
    }

    /// Per-pool statistics, in attachment order
    pub fn stats(&self) -> Vec<PoolStats> {
        let pools: Vec<_> = self
            .state()
            .attachments
            .iter()
            .map(|a| a.pool.clone())
            .collect();
        pools.iter().map(|p| p.stats()).collect()
    }

    /// Tunnel connections held open across all pools
    pub fn connected_sockets(&self) -> usize {
        self.stats().iter().map(|s| s.connected_sockets).sum()
    }

    /// Current state of every attachment, in attachment order
    pub fn attachment_states(&self) -> Vec<(AttachmentId, AliveState)> {
        self.state()
            .attachments
            .iter()
            .map(|a| (a.id, a.state))
            .collect()
    }

    /// Pick the next pool round robin
    pub fn next_pool(&self) -> Option<Arc<dyn ConnectionPool>> {
        let mut state = self.state();
        if state.attachments.is_empty() {
            return None;
        }
        let index = state.cursor % state.attachments.len();
        state.cursor = (index + 1) % state.attachments.len();
        Some(state.attachments[index].pool.clone())
    }

    /// Account one listening pool, running `count` under the session lock
    ///
    /// Returns `false` without counting once the session has closed.
    pub(crate) fn count_pool(&self, count: impl FnOnce()) -> bool {
        let state = self.state();
        if state.closed {
            return false;
        }
        self.counted_pools.fetch_add(1, Ordering::SeqCst);
        count();
        true
    }

    pub(crate) fn counted_pools(&self) -> usize {
        self.counted_pools.load(Ordering::SeqCst)
    }

    fn set_state(&self, attachment_id: AttachmentId, alive: AliveState) {
        let mut state = self.state();
        if let Some(attachment) = state
            .attachments
            .iter_mut()
            .find(|a| a.id == attachment_id)
        {
            attachment.state = alive;
        }
    }

    fn close_attachment(&self, attachment_id: AttachmentId, reason: CloseReason) {
        let (attachment, notify) = {
            let mut state = self.state();
            let Some(index) = state
                .attachments
                .iter()
                .position(|a| a.id == attachment_id)
            else {
                return;
            };

            let attachment = state.attachments.remove(index);
            if index < state.cursor {
                state.cursor -= 1;
            }
            if state.cursor >= state.attachments.len() {
                state.cursor = 0;
            }

            let notify = state.attachments.is_empty() && !state.closed;
            if notify {
                state.closed = true;
            }
            (attachment, notify)
        };

        attachment.cancel.cancel();
        attachment.pool.destroy();

        match reason {
            CloseReason::Detached | CloseReason::GraceExpired => {
                debug!(
                    "Session {} closed pool {}: {}",
                    self.id, attachment_id, reason
                )
            }
            _ => warn!(
                "Session {} closed pool {}: {}",
                self.id, attachment_id, reason
            ),
        }

        if notify {
            info!("Session {} has no pools left", self.id);
            self.notify_closed();
        }
    }

    fn notify_closed(&self) {
        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.session_closed(self);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pools", &self.pool_count())
            .finish_non_exhaustive()
    }
}

/// Drives one attachment's state machine until it closes
async fn supervise(
    session: Weak<Session>,
    attachment_id: AttachmentId,
    pool: Arc<dyn ConnectionPool>,
    mut events: broadcast::Receiver<PoolEvent>,
    cancel: CancellationToken,
    config: SessionConfig,
) {
    let mut alive = AliveState::Connecting;
    let mut last_ping_at = Instant::now();
    let mut grace_deadline = Some(Instant::now() + config.grace_period);

    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        let armed = grace_deadline;
        let grace = async move {
            match armed {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let transition = tokio::select! {
            biased;

            _ = cancel.cancelled() => return,

            _ = grace => break CloseReason::GraceExpired,

            _ = heartbeat.tick() => {
                if alive != AliveState::Offline
                    && last_ping_at.elapsed() > config.heartbeat_timeout
                {
                    break CloseReason::HeartbeatTimeout;
                }
                if alive != AliveState::Offline {
                    let pool = pool.clone();
                    tokio::spawn(async move { pool.ping().await });
                }
                None
            }

            event = events.recv() => match event {
                Ok(PoolEvent::Online) | Ok(PoolEvent::Pong) => {
                    grace_deadline = None;
                    last_ping_at = Instant::now();
                    Some(AliveState::Online)
                }
                Ok(PoolEvent::Offline) => {
                    // The grace timer now decides; the heartbeat path stands down.
                    grace_deadline = Some(Instant::now() + config.grace_period);
                    Some(AliveState::Offline)
                }
                Ok(PoolEvent::Error(e)) => break CloseReason::PoolError(e),
                Ok(PoolEvent::Closed) | Err(RecvError::Closed) => break CloseReason::PoolClosed,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Pool {} lagged {} events", attachment_id, skipped);
                    None
                }
            },
        };

        if let Some(next) = transition {
            if next != alive {
                alive = next;
                match session.upgrade() {
                    Some(session) => {
                        debug!(
                            "Session {} pool {} is {:?}",
                            session.id, attachment_id, alive
                        );
                        session.set_state(attachment_id, alive);
                    }
                    None => return,
                }
            }
        }
    };

    if let Some(session) = session.upgrade() {
        session.close_attachment(attachment_id, reason);
    } else {
        pool.destroy();
    }
}
