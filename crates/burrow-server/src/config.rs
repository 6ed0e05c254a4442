//! Front-end configuration

use crate::auth::BasicAuth;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Public listener settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address public clients connect to
    pub bind_addr: SocketAddr,
    /// Base domain tunnels live under, e.g. `tunnel.example.com`
    pub domain: Option<String>,
    /// Report `https://` tunnel URLs (TLS terminated in front of the relay)
    pub secure: bool,
    /// Where `GET /` without a tunnel host is redirected
    pub landing: Option<String>,
    /// Credentials for the management endpoints
    pub auth: Option<BasicAuth>,
    /// Upper bound for a request head read off a fresh connection
    pub max_head_size: usize,
}

impl RelayConfig {
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 80),
            domain: None,
            secure: false,
            landing: None,
            auth: None,
            max_head_size: 16 * 1024,
        }
    }
}
