use axum::extract::{Path, State};
use axum::response::Json;
use serde::Serialize;

use crate::error::AppError;
use crate::match_loop::{MatchHandle, MatchSummary};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct MatchListResponse {
    pub matches: Vec<MatchSummary>,
}

async fn lookup(state: &AppState, match_id: &str) -> Result<MatchHandle, AppError> {
    state
        .matches
        .read()
        .await
        .get(match_id)
        .ok_or_else(|| AppError::NotFound(format!("match {match_id:?} not found")))
}

/// GET /api/v1/matches: summaries of every live match, sorted by id.
pub async fn list_matches(State(state): State<AppState>) -> Json<MatchListResponse> {
    let handles: Vec<MatchHandle> = {
        let registry = state.matches.read().await;
        registry
            .match_ids()
            .iter()
            .filter_map(|id| registry.get(id))
            .collect()
    };
    let mut matches = Vec::with_capacity(handles.len());
    for handle in handles {
        // An actor stopped mid-listing is skipped.
        if let Some(summary) = handle.summary().await {
            matches.push(summary);
        }
    }
    Json(MatchListResponse { matches })
}

/// GET /api/v1/matches/{match_id}
pub async fn get_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<MatchSummary>, AppError> {
    let handle = lookup(&state, &match_id).await?;
    handle
        .summary()
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("match {match_id:?} has stopped")))
}

/// POST /api/v1/matches/{match_id}/reset: start a new generation now.
pub async fn reset_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<MatchSummary>, AppError> {
    let handle = lookup(&state, &match_id).await?;
    let summary = handle
        .reset()
        .await
        .ok_or_else(|| AppError::NotFound(format!("match {match_id:?} has stopped")))?;
    tracing::info!(match_id = %match_id, generation = summary.generation, "Match reset by admin");
    Ok(Json(summary))
}
