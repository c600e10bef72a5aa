mod cli;
mod config;
mod error;
mod handlers;
mod media;
mod negotiation;
mod registry;
mod session;
mod signaling;
mod websocket;

use anyhow::Context;
use axum::{
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    cli::{Cli, Commands},
    config::{Config, RelayMode},
    handlers::{delete_session_offer, get_offer, get_session_offer, health_check},
    media::{RelayOnlyFactory, SharedPeerFactory, WebRtcPeerFactory},
    registry::SessionRegistry,
    websocket::{default_websocket_handler, websocket_handler, SignalingState},
};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Default to WARN level if neither RUST_LOG nor --log-level is set
    let filter = match (&cli.log_level, EnvFilter::try_from_default_env()) {
        (Some(level), _) => EnvFilter::new(level),
        (None, Ok(filter)) => filter,
        (None, Err(_)) => EnvFilter::new("warn"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(Commands::Send {
        url,
        session,
        kind,
        data,
        wait,
    }) = cli.command
    {
        if let Err(e) = cli::run_send_client(url, session, kind, data, wait).await {
            error!("Send client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    if let Err(e) = serve(config).await {
        error!("Beach Relay failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        "Starting Beach Relay on {}:{} ({:?} mode)",
        config.bind_address, config.port, config.relay_mode
    );
    info!(
        "Offer TTL: {:?}, max sessions: {}, negotiation timeout: {:?}",
        config.offer_ttl(),
        config.max_sessions,
        config.negotiation_timeout_seconds
    );

    if config.room_relay && !config.room_relay_enabled() {
        warn!("ROOM_RELAY ignored: room relay needs RELAY_MODE=relay, the media peer already answers offers");
    }

    let registry = Arc::new(SessionRegistry::new(config.offer_ttl(), config.max_sessions));
    if config.offer_ttl().is_some() {
        registry.spawn_sweeper(config.sweep_interval());
    }

    let peers: SharedPeerFactory = match config.relay_mode {
        RelayMode::Media => Arc::new(
            WebRtcPeerFactory::new(config.ice_servers.clone())
                .context("failed to initialise WebRTC media engine")?,
        ),
        RelayMode::Relay => Arc::new(RelayOnlyFactory),
    };

    let state = SignalingState {
        registry,
        peers,
        settings: config.session_settings(),
        default_session_id: config.default_session_id.clone(),
    };

    let app = app(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("Beach Relay listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn app(state: SignalingState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/get-offer", get(get_offer))
        .route(
            "/sessions/:session_id/offer",
            get(get_session_offer).delete(delete_session_offer),
        )
        .route("/v1/ws", get(default_websocket_handler))
        .route("/v1/ws/:session_id", get(websocket_handler))
        .with_state(state)
}
