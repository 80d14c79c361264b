//! Bearer-token authentication and per-user authorization.
//!
//! Tokens are opaque to us: they are verified against the configured
//! identity provider's userinfo endpoint and the resulting identity is
//! cached briefly. Every user-scoped route must pass `ensure_user_scope` —
//! the userId in the payload has to match the authenticated identity.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use moka::future::Cache;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::SwapError;

/// How long a verified identity stays cached.
const IDENTITY_TTL: Duration = Duration::from_secs(60);

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub is_admin: bool,
}

/// Constant-time string comparison. The length check leaks length, which is
/// acceptable for fixed-format tokens; the protection that matters is
/// against byte-by-byte guessing.
fn ct_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Pull the bearer token out of an Authorization header value.
fn extract_bearer(raw: &str) -> Option<&str> {
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Userinfo payload from the identity provider.
#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    is_admin: bool,
}

pub struct AuthVerifier {
    client: reqwest::Client,
    issuer: String,
    ops_token: Option<String>,
    cache: Cache<String, Identity>,
}

impl AuthVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let ops_token = if config.ops_token.is_empty() {
            None
        } else {
            Some(config.ops_token.expose().to_string())
        };
        Self {
            client: reqwest::Client::new(),
            issuer: config.token_issuer.trim_end_matches('/').to_string(),
            ops_token,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(IDENTITY_TTL)
                .build(),
        }
    }

    /// Authenticate a request. 401 on anything short of a verified token.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, SwapError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer)
            .ok_or_else(|| SwapError::Unauthorized("missing bearer token".into()))?;

        if let Some(expected) = &self.ops_token {
            if ct_eq(token, expected) {
                return Ok(Identity {
                    user_id: "ops".into(),
                    is_admin: true,
                });
            }
        }

        if self.issuer.is_empty() {
            return Err(SwapError::Unauthorized(
                "no identity provider configured".into(),
            ));
        }

        if let Some(identity) = self.cache.get(token).await {
            return Ok(identity);
        }

        let response = self
            .client
            .get(format!("{}/userinfo", self.issuer))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SwapError::Unauthorized(format!("identity provider unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(SwapError::Unauthorized("token rejected".into()));
        }

        let info: UserInfo = response
            .json()
            .await
            .map_err(|e| SwapError::Unauthorized(format!("malformed userinfo: {e}")))?;

        let identity = Identity {
            user_id: info.sub,
            is_admin: info.is_admin,
        };
        debug!(user_id = %identity.user_id, "token verified");
        self.cache.insert(token.to_string(), identity.clone()).await;
        Ok(identity)
    }
}

/// IDOR guard: the target userId must be the caller (admins excepted).
pub fn ensure_user_scope(identity: &Identity, user_id: &str) -> Result<(), SwapError> {
    if identity.is_admin || identity.user_id == user_id {
        Ok(())
    } else {
        Err(SwapError::Forbidden(
            "userId does not match authenticated identity".into(),
        ))
    }
}

/// Admin-only routes.
pub fn ensure_admin(identity: &Identity) -> Result<(), SwapError> {
    if identity.is_admin {
        Ok(())
    } else {
        Err(SwapError::Forbidden("admin privileges required".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("Bearer   spaced  "), Some("spaced"));
        assert_eq!(extract_bearer("Basic abc123"), None);
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer(""), None);
    }

    #[test]
    fn constant_time_compare() {
        assert!(ct_eq("token-a", "token-a"));
        assert!(!ct_eq("token-a", "token-b"));
        assert!(!ct_eq("short", "longer-token"));
        assert!(!ct_eq("", "x"));
        assert!(ct_eq("", ""));
    }

    #[test]
    fn user_scope_guard() {
        let user = Identity {
            user_id: "user-1".into(),
            is_admin: false,
        };
        assert!(ensure_user_scope(&user, "user-1").is_ok());
        assert!(matches!(
            ensure_user_scope(&user, "user-2"),
            Err(SwapError::Forbidden(_))
        ));

        let admin = Identity {
            user_id: "ops".into(),
            is_admin: true,
        };
        assert!(ensure_user_scope(&admin, "user-2").is_ok());
        assert!(ensure_admin(&admin).is_ok());
        assert!(matches!(ensure_admin(&user), Err(SwapError::Forbidden(_))));
    }
}
