//! HTTP Basic Authentication (RFC 7617) for the management endpoints
//!
//! ```text
//! Authorization: Basic <base64(username:password)>
//! ```
//!
//! Tunnel traffic is never challenged; only requests addressed to the relay
//! itself are.

use base64::Engine;
use burrow_control::bridge::{full_body, ProxyBody};
use bytes::Bytes;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, Response, StatusCode};
use tracing::debug;

/// Single set of credentials guarding the management endpoints
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
    realm: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: "burrow".to_string(),
        }
    }

    /// Decode `username:password` from an Authorization header value
    fn extract_credentials(auth_header: &str) -> Option<(String, String)> {
        let (scheme, encoded) = auth_header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;

        // Passwords may contain ':'; usernames may not.
        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }

    /// Whether the request carries these credentials
    pub fn authenticate(&self, headers: &HeaderMap) -> bool {
        for value in headers.get_all(AUTHORIZATION) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            match Self::extract_credentials(value) {
                Some((username, password))
                    if username == self.username && password == self.password =>
                {
                    debug!("Basic auth: valid credentials");
                    return true;
                }
                Some(_) => debug!("Basic auth: invalid credentials"),
                None => debug!("Basic auth: could not decode credentials"),
            }
        }
        false
    }

    /// `401` carrying the Basic challenge
    pub fn unauthorized_response(&self) -> Response<ProxyBody> {
        let realm_escaped = self.realm.replace('"', "\\\"");
        let mut response = Response::new(full_body(Bytes::from_static(
            b"Authentication required (Basic)",
        )));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        if let Ok(challenge) = format!("Basic realm=\"{}\"", realm_escaped).parse() {
            response.headers_mut().insert(WWW_AUTHENTICATE, challenge);
        }
        response
    }
}
