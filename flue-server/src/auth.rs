use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{prelude::BASE64_STANDARD, Engine};
use serde_json::Value;
use tracing::debug;

use crate::AppState;

/// The single username/password pair the server accepts.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Missing fields never match.
    pub fn matches(&self, username: Option<&str>, password: Option<&str>) -> bool {
        username == Some(self.username.as_str()) && password == Some(self.password.as_str())
    }

    /// Checks the `{username, password}` payload a streaming client sends first.
    pub fn matches_handshake(&self, payload: &Value) -> bool {
        self.matches(
            payload.get("username").and_then(Value::as_str),
            payload.get("password").and_then(Value::as_str),
        )
    }
}

/// Splits an `Authorization: Basic ...` header value into username and password.
fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Rejects synchronous requests without matching HTTP Basic credentials.
pub async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic)
        .is_some_and(|(username, password)| {
            state.credentials.matches(Some(&username), Some(&password))
        });

    if authorized {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "Rejected unauthorized request");
        (StatusCode::UNAUTHORIZED, [(WWW_AUTHENTICATE, "Basic")]).into_response()
    }
}
