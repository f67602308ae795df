//! Smartly Bridge
//!
//! Security bridge between the Smartly platform and a home-automation
//! hub. The platform talks to signed HTTP endpoints; the bridge owns the
//! credentials, the allow-list and the media plane, and pushes state
//! changes back to the platform webhook.
//!
//! ## Components
//!
//! 1. AuthGate - HMAC verification, nonces, rate limits, trust-proxy
//! 2. ACL - entity/service allow-lists and topology assembly
//! 3. Audit - structured control/deny records
//! 4. WebAPI - control, sync, history, camera and WebRTC endpoints
//! 5. CameraManager - snapshot cache, MJPEG proxy, HLS bookkeeping
//! 6. WebRtcManager - token/session tables for signalling
//! 7. Go2rtcClient - local media server adapter
//! 8. PushPipeline - batched, signed state push with heartbeat
//! 9. Hub - the one seam to the hub runtime

pub mod acl;
pub mod audit;
pub mod auth;
pub mod camera;
pub mod credentials;
pub mod error;
pub mod formatting;
pub mod go2rtc;
pub mod hub;
pub mod push;
pub mod state;
pub mod web_api;
pub mod webrtc;

pub use error::{Error, Result};
pub use state::{AppConfig, AppState};
