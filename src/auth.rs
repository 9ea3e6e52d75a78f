//! Session-token verification and identity resolution.
//!
//! Tokens are HS256 JWTs issued by the main application; this service only
//! verifies them. The WebSocket handshake additionally accepts an unvalidated
//! `user_id` query parameter as a fallback identity, preserved from the
//! legacy client which cannot attach headers to the socket handshake.

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, StatusCode};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Verifies signed session tokens against the shared application secret.
pub struct SessionVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SessionVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Resolve a token to a user id; fails on bad signature or expiry.
    pub fn verify(&self, token: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims.sub)
    }
}

/// Identity resolved for a live connection at handshake time.
///
/// `Claimed` is the unvalidated query-parameter fallback: the id is taken at
/// face value, with no signature check. Both `Verified` and `Claimed`
/// connections are registered for presence and targeted delivery; `Anonymous`
/// connections only observe presence broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Verified(String),
    Claimed(String),
    Anonymous,
}

impl Identity {
    /// The user id this connection registers under, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::Verified(uid) | Identity::Claimed(uid) => Some(uid),
            Identity::Anonymous => None,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Identity::Verified(_))
    }
}

/// Resolve the handshake identity: signed token first, then the unvalidated
/// user-id fallback, else anonymous. Never fails; a bad token degrades to the
/// next option rather than rejecting the connection.
pub fn resolve_identity(
    verifier: &SessionVerifier,
    token: Option<&str>,
    user_id_hint: Option<&str>,
) -> Identity {
    if let Some(token) = token {
        match verifier.verify(token) {
            Ok(uid) => return Identity::Verified(uid),
            Err(err) => debug!("ws handshake token rejected: {err}"),
        }
    }
    match user_id_hint {
        Some(uid) if !uid.trim().is_empty() => Identity::Claimed(uid.trim().to_string()),
        _ => Identity::Anonymous,
    }
}

/// Extractor for the authenticated HTTP caller (`Authorization: Bearer <jwt>`).
pub struct CurrentUser(pub String);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or((StatusCode::UNAUTHORIZED, "Missing Authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or((StatusCode::UNAUTHORIZED, "Expected Bearer token"))?;
        state
            .verifier
            .verify(token)
            .map(CurrentUser)
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid session token"))
    }
}
