//! Session and registry configuration

use std::time::Duration;

/// Timings that drive a session's pool supervision
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a pool may stay unconfirmed (or offline) before it is closed
    pub grace_period: Duration,
    /// Interval between liveness probes
    pub heartbeat_interval: Duration,
    /// Maximum time without a liveness confirmation before a pool is closed
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Registry-wide settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Tunnel connection quota reported to clients on session creation
    pub max_tcp_sockets: usize,
    /// Allow several pools under one identity instead of issuing a new identity
    pub multi_pool: bool,
    pub session: SessionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tcp_sockets: 10,
            multi_pool: false,
            session: SessionConfig::default(),
        }
    }
}
