//! Session control for the tunnel relay
//!
//! A [`SessionRegistry`] maps public identities to [`Session`]s. Each session
//! owns one or more connection pools, supervises their liveness, and relays
//! public HTTP requests and raw upgrade streams through them round robin.

pub mod bridge;
pub mod config;
pub mod head;
pub mod id;
pub mod registry;
pub mod session;

pub use bridge::{ProxyBody, ProxyError};
pub use config::{RegistryConfig, SessionConfig};
pub use head::{read_request_head, HeadError, HeadRead, RequestHead};
pub use id::{is_valid_id, random_id};
pub use registry::{RegistryError, RegistryStats, SessionInfo, SessionRegistry};
pub use session::{AliveState, AttachmentId, CloseReason, Session, SessionObserver};
