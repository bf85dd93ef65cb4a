use std::collections::HashMap;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, header::AUTHORIZATION};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::state::AppState;
use keyrelay_core::CallerIdentity;

/// Static bearer-token table resolving credentials to caller identities.
///
/// Tokens are opaque; the resolved identity lives only in the request
/// extensions and is dropped with the request.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    subjects: HashMap<String, CallerIdentity>,
}

impl TokenRegistry {
    /// Build a registry from `(token, subject)` pairs, validating subjects.
    pub fn from_pairs<I, T, S>(pairs: I) -> keyrelay_core::Result<Self>
    where
        I: IntoIterator<Item = (T, S)>,
        T: Into<String>,
        S: Into<String>,
    {
        let mut subjects = HashMap::new();
        for (token, subject) in pairs {
            subjects.insert(token.into(), CallerIdentity::new(subject)?);
        }
        Ok(Self { subjects })
    }

    pub fn resolve(&self, token: &str) -> Option<CallerIdentity> {
        self.subjects.get(token).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix("Bearer ") {
        Some(rest.trim())
    } else if let Some(rest) = value.strip_prefix("bearer ") {
        Some(rest.trim())
    } else {
        None
    }
}

pub async fn http_layer(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(str::to_owned);

    let token = match token {
        Some(token) => token,
        None => return AppError::unauthorized("missing authorization header").into_response(),
    };

    match state.tokens.resolve(&token) {
        Some(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        None => AppError::unauthorized("unknown token").into_response(),
    }
}
