//! WebRTC signalling state.
//!
//! Tokens are single-use capabilities minted after HMAC authentication;
//! the SDP exchange consumes the token and produces a session id, which
//! is the capability for ICE and hangup. Both tables are process-local
//! and swept periodically.

use crate::credentials::TurnServer;
use crate::error::{DenyReason, Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Token validity window in seconds.
pub const TOKEN_TTL_SECS: i64 = 300;

/// Sessions idle longer than this are dropped by the sweeper, in seconds.
pub const SESSION_IDLE_TIMEOUT_SECS: i64 = 600;

/// Sweep interval for expired tokens and idle sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Token entropy in bytes (256 bits).
const TOKEN_BYTES: usize = 32;

/// Single-use signalling token.
#[derive(Debug, Clone)]
pub struct WebRtcToken {
    pub token: String,
    pub entity_id: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl WebRtcToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn remaining_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Post-SDP signalling session.
#[derive(Debug, Clone, Serialize)]
pub struct WebRtcSession {
    pub session_id: String,
    pub entity_id: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl WebRtcSession {
    fn is_idle_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity > ChronoDuration::seconds(SESSION_IDLE_TIMEOUT_SECS)
    }
}

/// Token and session tables for the signalling flow.
pub struct WebRtcManager {
    tokens: Mutex<HashMap<String, WebRtcToken>>,
    sessions: Mutex<HashMap<String, WebRtcSession>>,
    turn: Option<TurnServer>,
}

impl WebRtcManager {
    pub fn new(turn: Option<TurnServer>) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            turn,
        }
    }

    /// Mint a fresh single-use token bound to one camera and the
    /// authenticated client.
    pub async fn issue_token(&self, entity_id: &str, client_id: &str) -> WebRtcToken {
        let mut raw = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let now = Utc::now();

        let token = WebRtcToken {
            token: URL_SAFE_NO_PAD.encode(raw),
            entity_id: entity_id.to_string(),
            client_id: client_id.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(TOKEN_TTL_SECS),
            consumed: false,
        };
        self.tokens
            .lock()
            .await
            .insert(token.token.clone(), token.clone());
        token
    }

    /// Consume a token for the SDP exchange. Exactly one consume per token
    /// can succeed; expiry, prior use or a camera mismatch all fail the
    /// same way.
    pub async fn consume_token(&self, token_str: &str, entity_id: &str) -> Result<WebRtcToken> {
        let mut tokens = self.tokens.lock().await;
        let token = tokens
            .get_mut(token_str)
            .ok_or(Error::AuthDenied(DenyReason::InvalidOrExpiredToken))?;

        if token.consumed || token.is_expired_at(Utc::now()) || token.entity_id != entity_id {
            return Err(Error::AuthDenied(DenyReason::InvalidOrExpiredToken));
        }

        token.consumed = true;
        Ok(token.clone())
    }

    /// Open a session after a successful SDP exchange.
    pub async fn create_session(&self, entity_id: &str, client_id: &str) -> WebRtcSession {
        let now = Utc::now();
        let session = WebRtcSession {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            entity_id: entity_id.to_string(),
            client_id: client_id.to_string(),
            created_at: now,
            last_activity: now,
        };
        self.sessions
            .lock()
            .await
            .insert(session.session_id.clone(), session.clone());
        session
    }

    /// Refresh a session's activity clock. A session id from another
    /// camera behaves exactly like an unknown one.
    pub async fn touch_session(&self, session_id: &str, entity_id: &str) -> Result<WebRtcSession> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(session) if session.entity_id == entity_id => {
                session.last_activity = Utc::now();
                Ok(session.clone())
            }
            _ => Err(Error::NotFound("session_not_found")),
        }
    }

    /// Remove a session (hangup).
    pub async fn remove_session(&self, session_id: &str, entity_id: &str) -> Result<WebRtcSession> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(session) if session.entity_id == entity_id => {
                Ok(sessions.remove(session_id).unwrap())
            }
            _ => Err(Error::NotFound("session_not_found")),
        }
    }

    /// The ICE server set handed to callers: fixed STUN plus the
    /// configured TURN relay when present.
    pub fn ice_servers(&self) -> Vec<Value> {
        let mut servers = vec![
            json!({ "urls": ["stun:stun.l.google.com:19302"] }),
            json!({ "urls": ["stun:stun1.l.google.com:19302"] }),
        ];
        if let Some(turn) = &self.turn {
            servers.push(json!({
                "urls": [turn.url.clone()],
                "username": turn.username.clone(),
                "credential": turn.credential.clone(),
            }));
        }
        servers
    }

    /// Drop expired tokens and idle sessions.
    pub async fn sweep(&self) {
        let now = Utc::now();
        self.tokens
            .lock()
            .await
            .retain(|_, token| !token.is_expired_at(now));
        self.sessions
            .lock()
            .await
            .retain(|_, session| !session.is_idle_at(now));
    }

    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                manager.sweep().await;
            }
        })
    }
}
