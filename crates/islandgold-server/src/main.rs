use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use islandgold_server::config::{LogFormat, ServerConfig};
use islandgold_server::{build_app, spawn_idle_reaper};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() {
    let config = match ServerConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        },
    };
    init_tracing(config.log_format);

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    tracing::info!(
        default_match = %config.matches.default_match,
        duration_secs = config.game.duration_secs,
        treasures = config.game.treasure_count,
        start_policy = ?config.game.start_policy,
        admin_auth = config.admin_token.is_some(),
        "Configuration loaded"
    );

    let listen_addr = config.listen_addr.clone();
    let (app, state) = build_app(config);
    let reaper = spawn_idle_reaper(state.clone());

    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %listen_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        },
    };
    tracing::info!(addr = %listen_addr, "Island Gold server listening");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutting down");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    reaper.abort();
    state.matches.write().await.stop_all();
}
