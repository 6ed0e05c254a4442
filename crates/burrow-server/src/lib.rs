//! Public front end of the burrow relay
//!
//! Serves the public HTTP port: requests whose `Host` names a tunnel are
//! relayed through that tunnel's session, everything else reaches the
//! management endpoints.

pub mod api;
pub mod auth;
pub mod config;
pub mod server;

pub use api::ManagementApi;
pub use auth::BasicAuth;
pub use config::RelayConfig;
pub use server::{session_id_from_host, RelayServer, RelayServerError};
