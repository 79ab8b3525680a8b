use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: usize,
    pub matches: usize,
}

/// Liveness plus a few counters.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.ws_connection_count.load(Ordering::Relaxed);
    let matches = state.matches.read().await.len();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections,
        matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes() {
        let resp = HealthResponse {
            status: "healthy",
            version: "0.1.0",
            connections: 4,
            matches: 1,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"healthy\""));
        assert!(json.contains("\"connections\":4"));
        assert!(json.contains("\"matches\":1"));
    }
}
