//! Application state
//!
//! Holds configuration and the shared component handles. Everything is
//! bound to this object rather than process statics so tear-down stays
//! deterministic.

use crate::auth::{NonceCache, RateLimiter, RATE_LIMIT, RATE_WINDOW};
use crate::camera::CameraManager;
use crate::credentials::{
    generate_client_id, generate_client_secret, parse_cidrs, Credentials, TrustProxyMode,
    TurnServer,
};
use crate::go2rtc::Go2rtcClient;
use crate::hub::Hub;
use crate::webrtc::WebRtcManager;
use std::sync::Arc;
use std::time::Duration;

/// Default debounce for the push batcher, in seconds.
pub const DEFAULT_PUSH_BATCH_INTERVAL: f64 = 0.5;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server bind host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Hub supervisor URL
    pub hub_url: String,
    /// Hub supervisor bearer token
    pub hub_token: String,
    /// go2rtc URL
    pub go2rtc_url: String,
    /// Debounce interval for the push batcher
    pub push_batch_interval: Duration,
    /// Platform client credentials
    pub credentials: Credentials,
}

impl AppConfig {
    /// Load from the environment. Credentials are generated on first start
    /// when unset; the generated client id is logged, the secret is not.
    pub fn from_env() -> Self {
        let client_id = std::env::var("CLIENT_ID").unwrap_or_else(|_| {
            let generated = generate_client_id();
            tracing::info!(client_id = %generated, "generated new client id");
            generated
        });
        let client_secret = std::env::var("CLIENT_SECRET").unwrap_or_else(|_| {
            tracing::info!("generated new client secret");
            generate_client_secret()
        });

        let turn = match (
            std::env::var("TURN_URL"),
            std::env::var("TURN_USERNAME"),
            std::env::var("TURN_CREDENTIAL"),
        ) {
            (Ok(url), Ok(username), Ok(credential)) => Some(TurnServer {
                url,
                username,
                credential,
            }),
            _ => None,
        };

        let credentials = Credentials {
            instance_id: std::env::var("INSTANCE_ID").unwrap_or_else(|_| "default".to_string()),
            client_id,
            client_secret,
            allowed_cidrs: parse_cidrs(&std::env::var("ALLOWED_CIDRS").unwrap_or_default()),
            webhook_url: std::env::var("WEBHOOK_URL").unwrap_or_default(),
            trust_proxy: TrustProxyMode::parse(
                &std::env::var("TRUST_PROXY_MODE").unwrap_or_default(),
            ),
            turn,
        };

        let push_batch_interval = std::env::var("PUSH_BATCH_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0)
            .unwrap_or(DEFAULT_PUSH_BATCH_INTERVAL);

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8127),
            hub_url: std::env::var("HUB_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string()),
            hub_token: std::env::var("HUB_TOKEN").unwrap_or_default(),
            go2rtc_url: std::env::var("GO2RTC_URL")
                .unwrap_or_else(|_| "http://localhost:1984".to_string()),
            push_batch_interval: Duration::from_secs_f64(push_batch_interval),
            credentials,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub hub: Arc<dyn Hub>,
    pub nonce_cache: Arc<NonceCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub camera: Arc<CameraManager>,
    pub webrtc: Arc<WebRtcManager>,
    pub go2rtc: Arc<Go2rtcClient>,
}

impl AppState {
    pub fn new(config: AppConfig, hub: Arc<dyn Hub>) -> Self {
        let go2rtc = Arc::new(Go2rtcClient::new(config.go2rtc_url.clone()));
        let camera = Arc::new(CameraManager::new(Arc::clone(&hub), Arc::clone(&go2rtc)));
        let webrtc = Arc::new(WebRtcManager::new(config.credentials.turn.clone()));

        Self {
            config: Arc::new(config),
            hub,
            nonce_cache: Arc::new(NonceCache::new()),
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT, RATE_WINDOW)),
            camera,
            webrtc,
            go2rtc,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.config.credentials
    }
}
