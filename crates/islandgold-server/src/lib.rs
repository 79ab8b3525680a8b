pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod match_loop;
pub mod match_registry;
pub mod state;
pub mod ws;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;

use config::ServerConfig;
use state::AppState;

/// Build the Axum router and application state from a config.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    let web_root = config.web_root.clone();
    let state = AppState::new(config);

    // Admin routes (behind bearer auth when a token is configured)
    let admin_routes = Router::new()
        .route("/matches/{match_id}/reset", post(api::reset_match))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::admin_auth,
        ));

    let api_routes = Router::new()
        .route("/matches", get(api::list_matches))
        .route("/matches/{match_id}", get(api::get_match))
        .merge(admin_routes);

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/ws/{match_id}", get(ws::ws_match_handler))
        .route("/health", get(health::health_check))
        .nest("/api/v1", api_routes)
        .fallback_service(ServeDir::new(&web_root))
        .with_state(state.clone());

    (app, state)
}

/// Background task that periodically stops matches nobody is connected to.
pub fn spawn_idle_reaper(state: AppState) -> JoinHandle<()> {
    let every = state.config.matches.idle_check_interval();
    let idle_for = state.config.matches.idle_timeout();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let removed = state.matches.write().await.reap_idle(idle_for);
            if removed > 0 {
                tracing::info!(removed, "Reaped idle matches");
            }
        }
    })
}
