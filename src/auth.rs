use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;
use ulid::Ulid;

/// Maps bearer tokens to user ids. Issuing tokens happens elsewhere.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<Ulid>;
}

/// Fixed token table, optionally seeded from a JSON object `{ "<token>": "<user id>" }`.
#[derive(Debug, Default)]
pub struct StaticSessions {
    tokens: DashMap<String, Ulid>,
}

impl StaticSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let table: HashMap<String, Ulid> = serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let sessions = Self::new();
        for (token, user) in table {
            sessions.insert(token, user);
        }
        Ok(sessions)
    }

    pub fn insert(&self, token: impl Into<String>, user_id: Ulid) {
        self.tokens.insert(token.into(), user_id);
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl SessionResolver for StaticSessions {
    async fn resolve(&self, token: &str) -> Option<Ulid> {
        self.tokens.get(token).map(|e| *e.value())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Token not provided")]
    Missing,
    #[error("Token invalid")]
    Invalid,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(json!({ "Erro": self.to_string() }))).into_response()
    }
}

/// The authenticated user behind a request.
///
/// Reads `Authorization: Bearer <token>` and resolves it through the state's
/// [`SessionResolver`]. Handlers taking a `Caller` reject anonymous requests with 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Ulid);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
    Arc<dyn SessionResolver>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?.to_string();
        let sessions = Arc::<dyn SessionResolver>::from_ref(state);
        sessions.resolve(&token).await.map(Caller).ok_or(AuthError::Invalid)
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Invalid)?;
    match header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(AuthError::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[derive(Clone)]
    struct State(Arc<dyn SessionResolver>);

    impl FromRef<State> for Arc<dyn SessionResolver> {
        fn from_ref(state: &State) -> Self {
            state.0.clone()
        }
    }

    async fn extract(header: Option<&str>, state: &State) -> Result<Caller, AuthError> {
        let mut builder = Request::builder().uri("/appointments");
        if let Some(h) = header {
            builder = builder.header(AUTHORIZATION, h);
        }
        let (mut parts, ()) = builder.body(()).unwrap().into_parts();
        Caller::from_request_parts(&mut parts, state).await
    }

    fn state_with(token: &str, user: Ulid) -> State {
        let sessions = StaticSessions::new();
        sessions.insert(token, user);
        State(Arc::new(sessions))
    }

    #[tokio::test]
    async fn resolves_bearer_token() {
        let user = Ulid::new();
        let state = state_with("abc", user);
        assert_eq!(extract(Some("Bearer abc"), &state).await, Ok(Caller(user)));
        assert_eq!(extract(Some("bearer  abc "), &state).await, Ok(Caller(user)));
    }

    #[tokio::test]
    async fn missing_header() {
        let state = state_with("abc", Ulid::new());
        assert_eq!(extract(None, &state).await, Err(AuthError::Missing));
    }

    #[tokio::test]
    async fn wrong_scheme_or_unknown_token() {
        let state = state_with("abc", Ulid::new());
        assert_eq!(extract(Some("Basic abc"), &state).await, Err(AuthError::Invalid));
        assert_eq!(extract(Some("Bearer nope"), &state).await, Err(AuthError::Invalid));
        assert_eq!(extract(Some("Bearer"), &state).await, Err(AuthError::Invalid));
    }

    #[tokio::test]
    async fn seed_from_json() {
        let user = Ulid::new();
        let path = std::env::temp_dir().join(format!("slotbook_sessions_{}.json", Ulid::new()));
        std::fs::write(&path, format!(r#"{{"t1":"{user}"}}"#)).unwrap();
        let sessions = StaticSessions::from_json_file(&path).unwrap();
        assert_eq!(sessions.resolve("t1").await, Some(user));
        let _ = std::fs::remove_file(&path);
    }
}
