//! Smartly Bridge
//!
//! Main entry point for the bridge process.

use smartly_bridge::audit::log_lifecycle;
use smartly_bridge::hub::RestHub;
use smartly_bridge::push::PushPipeline;
use smartly_bridge::web_api;
use smartly_bridge::{AppConfig, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartly_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Smartly Bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env();
    tracing::info!(
        instance_id = %config.credentials.instance_id,
        client_id = %config.credentials.client_id,
        hub_url = %config.hub_url,
        go2rtc_url = %config.go2rtc_url,
        trust_proxy = config.credentials.trust_proxy.as_str(),
        "Configuration loaded"
    );

    let hub = Arc::new(RestHub::new(config.hub_url.clone(), config.hub_token.clone()));
    let push_interval = config.push_batch_interval;
    let credentials = config.credentials.clone();

    let state = AppState::new(config, hub.clone());
    log_lifecycle("setup_start", &credentials.instance_id);

    // Background sweepers, bound to this process lifetime
    let nonce_sweeper = state.nonce_cache.start_sweeper();
    let camera_sweeper = state.camera.start_sweeper();
    let webrtc_sweeper = state.webrtc.start_sweeper();

    // Push pipeline: single owner of the hub event subscription
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let push = Arc::new(PushPipeline::new(hub, &credentials, push_interval));
    let push_task = push.start(shutdown_rx);

    let app = web_api::create_router(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    log_lifecycle("setup_complete", &credentials.instance_id);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await?;

    // Tear down owned tasks: flush the push buffer, stop the sweepers
    log_lifecycle("shutdown_start", &credentials.instance_id);
    let _ = shutdown_tx.send(true);
    let _ = push_task.await;
    nonce_sweeper.abort();
    camera_sweeper.abort();
    webrtc_sweeper.abort();
    log_lifecycle("shutdown_complete", &credentials.instance_id);

    Ok(())
}
