use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;
use crate::state::AppState;

/// Check an `Authorization: Bearer <token>` header against `expected`.
/// No expected token means admin auth is disabled and everything passes.
pub fn bearer_matches(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

/// Guards the admin routes with the configured `admin_token`.
pub async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !bearer_matches(request.headers(), state.config.admin_token.as_deref()) {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request");
        return Err(AppError::Unauthorized("missing or invalid bearer token".into()));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn disabled_auth_allows_everything() {
        assert!(bearer_matches(&HeaderMap::new(), None));
    }

    #[test]
    fn token_must_match_exactly() {
        assert!(bearer_matches(&headers("Bearer s3cret"), Some("s3cret")));
        assert!(!bearer_matches(&headers("Bearer wrong"), Some("s3cret")));
        assert!(!bearer_matches(&headers("s3cret"), Some("s3cret")));
        assert!(!bearer_matches(&HeaderMap::new(), Some("s3cret")));
    }
}
