//! Management endpoints served on the relay's own host
//!
//! - `GET /?new` creates a session under a random identity
//! - `GET /<id>` creates a session under a requested identity
//! - `GET /api/status` reports registry statistics
//! - `GET /api/tunnels/<id>/status` reports one session's pool statistics
//! - `GET /` redirects to the landing page, if one is configured

use crate::config::RelayConfig;
use burrow_control::bridge::{full_body, ProxyBody};
use burrow_control::{is_valid_id, random_id, SessionRegistry};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_TYPE, HOST, LOCATION};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

const INVALID_SUBDOMAIN: &str = "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

#[derive(Debug, Serialize)]
pub struct NewSessionResponse {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Pools attached across all sessions
    pub tunnels: usize,
    pub sessions: usize,
    pub started_at: DateTime<Utc>,
    pub mem: MemoryStats,
}

#[derive(Debug, Serialize)]
pub struct MemoryStats {
    /// Resident set size in bytes, where the platform exposes it
    pub rss: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TunnelStatusResponse {
    pub connected_sockets: usize,
}

#[derive(Debug, Serialize)]
struct MessageResponse<'a> {
    message: &'a str,
}

/// Handles requests that are not addressed to a tunnel
#[derive(Clone)]
pub struct ManagementApi {
    registry: Arc<SessionRegistry>,
    config: Arc<RelayConfig>,
    started_at: DateTime<Utc>,
}

impl ManagementApi {
    pub fn new(registry: Arc<SessionRegistry>, config: Arc<RelayConfig>) -> Self {
        Self {
            registry,
            config,
            started_at: Utc::now(),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody> {
        // Every endpoint is a GET; the body is never read.
        let (parts, _) = req.into_parts();

        if let Some(auth) = &self.config.auth {
            if !auth.authenticate(&parts.headers) {
                return auth.unauthorized_response();
            }
        }

        if parts.method != Method::GET {
            return message(StatusCode::NOT_FOUND, "Not Found");
        }

        let path = parts.uri.path();
        let host = request_host(&parts.headers);
        debug!("Management request {}", parts.uri);

        if path == "/" {
            if wants_new_session(parts.uri.query()) {
                return self.create_session(&random_id(), host).await;
            }
            return self.landing();
        }

        if path == "/api/status" {
            return self.status();
        }

        if let Some(id) = tunnel_status_id(path) {
            return self.tunnel_status(id);
        }

        // Anything else with a single path segment is an identity request.
        let requested = path.strip_prefix('/').unwrap_or(path);
        if requested.contains('/') {
            return message(StatusCode::NOT_FOUND, "Not Found");
        }
        if !is_valid_id(requested) {
            return message(StatusCode::FORBIDDEN, INVALID_SUBDOMAIN);
        }
        self.create_session(requested, host).await
    }

    async fn create_session(&self, requested_id: &str, host: Option<&str>) -> Response<ProxyBody> {
        info!("Making new session with id {}", requested_id);

        let info = match self.registry.create_session(requested_id).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to create session {}: {}", requested_id, e);
                return message(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };

        let host = host
            .or(self.config.domain.as_deref())
            .unwrap_or("localhost");
        let url = format!("{}://{}.{}", self.config.scheme(), info.id, host);

        json(
            StatusCode::OK,
            &NewSessionResponse {
                id: info.id,
                port: info.port,
                max_conn_count: info.max_conn_count,
                url,
            },
        )
    }

    fn status(&self) -> Response<ProxyBody> {
        let stats = self.registry.stats();
        json(
            StatusCode::OK,
            &StatusResponse {
                tunnels: stats.tunnels,
                sessions: stats.sessions,
                started_at: self.started_at,
                mem: MemoryStats {
                    rss: resident_memory_bytes(),
                },
            },
        )
    }

    fn tunnel_status(&self, id: &str) -> Response<ProxyBody> {
        match self.registry.get_session(id) {
            Some(session) => json(
                StatusCode::OK,
                &TunnelStatusResponse {
                    connected_sockets: session.connected_sockets(),
                },
            ),
            None => message(StatusCode::NOT_FOUND, "Tunnel not found"),
        }
    }

    fn landing(&self) -> Response<ProxyBody> {
        let Some(landing) = &self.config.landing else {
            return message(StatusCode::NOT_FOUND, "Not Found");
        };

        let mut response = Response::new(full_body(Bytes::new()));
        *response.status_mut() = StatusCode::FOUND;
        match landing.parse() {
            Ok(location) => {
                response.headers_mut().insert(LOCATION, location);
                response
            }
            Err(_) => {
                error!("Landing URL {} is not a valid header value", landing);
                message(StatusCode::NOT_FOUND, "Not Found")
            }
        }
    }
}

/// JSON `{"message": ...}` response
pub fn message(status: StatusCode, message: &str) -> Response<ProxyBody> {
    json(status, &MessageResponse { message })
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            let mut response = Response::new(full_body(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }
    };

    let mut response = Response::new(full_body(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers.get(HOST)?.to_str().ok()
}

/// `?new`, `?new=`, or `new` among other query parameters
fn wants_new_session(query: Option<&str>) -> bool {
    query
        .map(|q| {
            q.split('&')
                .any(|param| param == "new" || param.starts_with("new="))
        })
        .unwrap_or(false)
}

/// Identity in `/api/tunnels/<id>/status`
fn tunnel_status_id(path: &str) -> Option<&str> {
    let id = path
        .strip_prefix("/api/tunnels/")?
        .strip_suffix("/status")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

/// Resident set size from `/proc/self/status`
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}
