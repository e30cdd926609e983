use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

use server::config;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = config::load_config().expect("failed to load configuration");
    let bind_addr = config.server.bind.clone();

    info!("connecting to database...");
    let pool = server::db::create_pool(&config.postgres.url, config.postgres.max_connections)
        .await
        .expect("failed to connect to Postgres");
    server::db::run_migrations(&pool)
        .await
        .expect("failed to run database migrations");
    info!("migrations applied");

    let state = server::build_state(config, pool).expect("failed to build pipeline state");
    server::enable_keyspace_notifications(&state.cache)
        .await
        .expect("failed to enable cache keyspace notifications");
    let _background = server::spawn_background(&state).expect("failed to spawn background tasks");

    let router = server::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
