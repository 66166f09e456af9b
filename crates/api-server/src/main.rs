use std::net::SocketAddr;

use api_server::{build_app_state, http};
use shared::config::Settings;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "api_server=debug,shared=info,tower_http=info";

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!("failed to read config: {err}");
            std::process::exit(1);
        }
    };

    let app_state = match build_app_state(&settings).await {
        Ok(app_state) => app_state,
        Err(err) => {
            error!("failed to initialize chat server: {err}");
            std::process::exit(1);
        }
    };
    let app = http::build_router(app_state);

    let addr: SocketAddr = match settings.server.bind_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(
                "invalid bind address {}: {err}",
                settings.server.bind_addr
            );
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };

    info!(
        model = %settings.model.model_id(),
        default_institution = %settings.knowledge_base.default_institution_id,
        "chat server listening on {}",
        listener.local_addr().unwrap_or(addr)
    );

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("chat server stopped with error: {err}");
        std::process::exit(1);
    }
    info!("chat server shut down");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}
