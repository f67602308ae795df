//! Camera manager.
//!
//! ## Responsibilities
//!
//! - Snapshot cache with ETag/TTL and conditional requests
//! - Camera registry (direct HTTP sources, credentials in memory only)
//! - MJPEG proxy source selection
//! - HLS session bookkeeping against the media server

mod stream;

pub use stream::{rechunk, STREAM_CHUNK_SIZE};

use crate::error::{Error, Result};
use crate::go2rtc::Go2rtcClient;
use crate::hub::{ByteStream, Hub};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Snapshot cache TTL in seconds.
pub const SNAPSHOT_CACHE_TTL_SECS: i64 = 30;

/// Sweep interval for expired snapshots and idle HLS sessions.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// HLS sessions idle longer than this are dropped, in seconds.
pub const HLS_IDLE_TIMEOUT_SECS: i64 = 600;

/// Upper bound on cached snapshots before oldest-first pruning.
const SNAPSHOT_CACHE_MAX: usize = 64;

/// Registered direct camera source. Credentials never leave memory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub snapshot_url: Option<String>,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_verify_ssl() -> bool {
    true
}

/// Cached camera snapshot.
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    pub entity_id: String,
    pub bytes: Bytes,
    pub content_type: String,
    pub captured_at: DateTime<Utc>,
    pub etag: String,
}

impl CachedSnapshot {
    fn new(entity_id: &str, bytes: Bytes, content_type: String) -> Self {
        let etag = hex::encode(Sha256::digest(&bytes));
        Self {
            entity_id: entity_id.to_string(),
            bytes,
            content_type,
            captured_at: Utc::now(),
            etag,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: ChronoDuration) -> bool {
        now - self.captured_at > ttl
    }

    pub fn is_expired(&self, ttl: ChronoDuration) -> bool {
        self.is_expired_at(Utc::now(), ttl)
    }
}

/// Outcome of a snapshot lookup.
#[derive(Debug)]
pub enum SnapshotOutcome {
    /// Client's ETag still matches; reply 304.
    NotModified,
    Image(CachedSnapshot),
}

/// Active HLS session.
#[derive(Debug, Clone, Serialize)]
pub struct HlsSession {
    pub stream_id: String,
    pub entity_id: String,
    pub started_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub clients_connected: u32,
}

impl HlsSession {
    fn is_idle_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_access > ChronoDuration::seconds(HLS_IDLE_TIMEOUT_SECS)
    }
}

/// Camera manager instance.
pub struct CameraManager {
    hub: Arc<dyn Hub>,
    go2rtc: Arc<Go2rtcClient>,
    client: reqwest::Client,
    insecure_client: reqwest::Client,
    cache: RwLock<HashMap<String, CachedSnapshot>>,
    configs: RwLock<HashMap<String, CameraConfig>>,
    hls_sessions: Mutex<HashMap<String, HlsSession>>,
    cache_ttl: ChronoDuration,
}

impl CameraManager {
    pub fn new(hub: Arc<dyn Hub>, go2rtc: Arc<Go2rtcClient>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build camera HTTP client");
        let insecure_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .expect("failed to build camera HTTP client");

        Self {
            hub,
            go2rtc,
            client,
            insecure_client,
            cache: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            hls_sessions: Mutex::new(HashMap::new()),
            cache_ttl: ChronoDuration::seconds(SNAPSHOT_CACHE_TTL_SECS),
        }
    }

    pub fn cache_ttl_secs(&self) -> i64 {
        self.cache_ttl.num_seconds()
    }

    // ---- registry -------------------------------------------------------

    pub async fn register_camera(&self, config: CameraConfig) {
        tracing::info!(entity_id = %config.entity_id, "registered camera");
        self.configs
            .write()
            .await
            .insert(config.entity_id.clone(), config);
    }

    pub async fn unregister_camera(&self, entity_id: &str) {
        self.configs.write().await.remove(entity_id);
        self.cache.write().await.remove(entity_id);
        tracing::info!(entity_id, "unregistered camera");
    }

    pub async fn camera_config(&self, entity_id: &str) -> Option<CameraConfig> {
        self.configs.read().await.get(entity_id).cloned()
    }

    pub async fn list_registered(&self) -> Vec<serde_json::Value> {
        self.configs
            .read()
            .await
            .values()
            .map(|config| {
                json!({
                    "entity_id": config.entity_id.clone(),
                    "name": config.name.clone().unwrap_or_else(|| config.entity_id.clone()),
                    "has_snapshot": config.snapshot_url.is_some(),
                    "has_stream": config.stream_url.is_some(),
                })
            })
            .collect()
    }

    // ---- snapshots ------------------------------------------------------

    /// Cached-or-fresh snapshot with conditional-request support.
    pub async fn get_snapshot(
        &self,
        entity_id: &str,
        force_refresh: bool,
        if_none_match: Option<&str>,
    ) -> Result<SnapshotOutcome> {
        if !force_refresh {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(entity_id) {
                if !cached.is_expired(self.cache_ttl) {
                    if if_none_match == Some(cached.etag.as_str()) {
                        return Ok(SnapshotOutcome::NotModified);
                    }
                    return Ok(SnapshotOutcome::Image(cached.clone()));
                }
            }
        }

        let snapshot = self.fetch_snapshot(entity_id).await?;
        {
            let mut cache = self.cache.write().await;
            cache.insert(entity_id.to_string(), snapshot.clone());
            prune_oldest(&mut cache, SNAPSHOT_CACHE_MAX);
        }

        if if_none_match == Some(snapshot.etag.as_str()) {
            return Ok(SnapshotOutcome::NotModified);
        }
        Ok(SnapshotOutcome::Image(snapshot))
    }

    /// Registered HTTP source first, hub camera API as fallback.
    async fn fetch_snapshot(&self, entity_id: &str) -> Result<CachedSnapshot> {
        if let Some(config) = self.camera_config(entity_id).await {
            if config.snapshot_url.is_some() {
                match self.fetch_from_url(&config).await {
                    Ok(snapshot) => return Ok(snapshot),
                    Err(err) => {
                        tracing::warn!(entity_id, error = %err, "direct snapshot source failed");
                    }
                }
            }
        }

        match self.hub.camera_image(entity_id).await {
            Ok(image) => Ok(CachedSnapshot::new(entity_id, image.bytes, image.content_type)),
            Err(err) => {
                tracing::debug!(entity_id, error = %err, "hub snapshot failed");
                Err(Error::NotFound("snapshot_unavailable"))
            }
        }
    }

    fn source_request(
        &self,
        config: &CameraConfig,
        url: &str,
    ) -> reqwest::RequestBuilder {
        let client = if config.verify_ssl {
            &self.client
        } else {
            &self.insecure_client
        };
        let mut request = client.get(url);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            request = request.basic_auth(user, Some(pass));
        }
        for (name, value) in &config.extra_headers {
            request = request.header(name, value);
        }
        request
    }

    async fn fetch_from_url(&self, config: &CameraConfig) -> Result<CachedSnapshot> {
        let url = config
            .snapshot_url
            .as_deref()
            .ok_or(Error::NotFound("snapshot_unavailable"))?;
        let resp = self.source_request(config, url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "snapshot source returned {}",
                resp.status()
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = resp.bytes().await?;
        Ok(CachedSnapshot::new(&config.entity_id, bytes, content_type))
    }

    pub async fn clear_cache(&self, entity_id: Option<&str>) -> usize {
        let mut cache = self.cache.write().await;
        match entity_id {
            Some(id) => {
                if cache.remove(id).is_some() {
                    1
                } else {
                    0
                }
            }
            None => {
                let count = cache.len();
                cache.clear();
                count
            }
        }
    }

    pub async fn cache_stats(&self) -> serde_json::Value {
        let cache = self.cache.read().await;
        let configs = self.configs.read().await;
        let now = Utc::now();
        json!({
            "cached_snapshots": cache.len(),
            "registered_cameras": configs.len(),
            "cache_entries": cache.values().map(|snapshot| json!({
                "entity_id": snapshot.entity_id.clone(),
                "age_seconds": (now - snapshot.captured_at).num_seconds(),
                "size_bytes": snapshot.bytes.len(),
                "content_type": snapshot.content_type.clone(),
            })).collect::<Vec<_>>(),
        })
    }

    // ---- MJPEG ----------------------------------------------------------

    /// The raw MJPEG body for a camera: registered stream source when
    /// configured, hub proxy otherwise. Body bytes only, never upstream
    /// headers.
    pub async fn mjpeg_stream(&self, entity_id: &str) -> Result<ByteStream> {
        if let Some(config) = self.camera_config(entity_id).await {
            if let Some(url) = config.stream_url.clone() {
                let resp = self.source_request(&config, &url).send().await?;
                if !resp.status().is_success() {
                    return Err(Error::upstream(
                        "camera_not_found",
                        format!("stream source returned {}", resp.status()),
                    ));
                }
                let upstream: ByteStream = Box::pin(resp.bytes_stream().map(|chunk| {
                    chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                }));
                return Ok(rechunk(upstream));
            }
        }

        let upstream = self
            .hub
            .camera_mjpeg_stream(entity_id)
            .await
            .map_err(|_| Error::NotFound("camera_not_found"))?;
        Ok(rechunk(upstream))
    }

    // ---- HLS bookkeeping ------------------------------------------------

    /// Start (or rejoin) an HLS session and return the playlist URLs the
    /// media server exposes.
    pub async fn start_hls(&self, entity_id: &str) -> Result<serde_json::Value> {
        let source = self
            .hub
            .camera_stream_source(entity_id)
            .await?
            .or(self.camera_config(entity_id).await.and_then(|c| c.stream_url));
        let Some(source) = source else {
            return Err(Error::upstream(
                "stream_source_not_found",
                format!("no stream source for {entity_id}"),
            ));
        };

        self.go2rtc.add_stream(entity_id, &source).await?;

        let mut sessions = self.hls_sessions.lock().await;
        let now = Utc::now();
        let session = sessions
            .entry(entity_id.to_string())
            .and_modify(|s| {
                s.last_access = now;
                s.clients_connected += 1;
            })
            .or_insert_with(|| HlsSession {
                stream_id: uuid::Uuid::new_v4().simple().to_string(),
                entity_id: entity_id.to_string(),
                started_at: now,
                last_access: now,
                clients_connected: 1,
            });

        let urls = self.go2rtc.stream_urls(entity_id);
        Ok(json!({
            "entity_id": entity_id,
            "stream_id": session.stream_id.clone(),
            "stream_type": "hls",
            "hls_url": urls.hls_url,
            "started_at": session.started_at,
            "clients_connected": session.clients_connected,
            "is_active": true,
        }))
    }

    pub async fn stop_hls(&self, entity_id: &str) -> bool {
        self.hls_sessions.lock().await.remove(entity_id).is_some()
    }

    pub async fn hls_session(&self, entity_id: &str) -> Option<HlsSession> {
        let mut sessions = self.hls_sessions.lock().await;
        sessions.get_mut(entity_id).map(|session| {
            session.last_access = Utc::now();
            session.clone()
        })
    }

    pub async fn hls_info(&self, entity_id: &str) -> Result<serde_json::Value> {
        let source = self.hub.camera_stream_source(entity_id).await?;
        let config = self.camera_config(entity_id).await;
        let supports_hls = source.is_some() || config.as_ref().and_then(|c| c.stream_url.as_ref()).is_some();
        let active = self.hls_sessions.lock().await.get(entity_id).cloned();

        Ok(json!({
            "entity_id": entity_id,
            "capabilities": {
                "snapshot": true,
                "mjpeg": true,
                "hls": supports_hls,
                "webrtc": supports_hls,
            },
            "endpoints": {
                "snapshot": format!("/api/smartly/camera/{entity_id}/snapshot"),
                "mjpeg": format!("/api/smartly/camera/{entity_id}/stream"),
                "hls": supports_hls.then(|| format!("/api/smartly/camera/{entity_id}/stream/hls")),
            },
            "is_streaming": active.is_some(),
            "session": active,
        }))
    }

    pub async fn hls_stats(&self) -> serde_json::Value {
        let sessions = self.hls_sessions.lock().await;
        let now = Utc::now();
        json!({
            "active_streams": sessions.len(),
            "clients_connected": sessions.values().map(|s| s.clients_connected).sum::<u32>(),
            "streams": sessions.values().map(|s| json!({
                "entity_id": s.entity_id.clone(),
                "stream_id": s.stream_id.clone(),
                "age_seconds": (now - s.started_at).num_seconds(),
                "idle_seconds": (now - s.last_access).num_seconds(),
                "clients_connected": s.clients_connected,
            })).collect::<Vec<_>>(),
        })
    }

    // ---- maintenance ----------------------------------------------------

    /// Drop expired snapshots and idle HLS sessions.
    pub async fn sweep(&self) {
        let now = Utc::now();
        {
            let mut cache = self.cache.write().await;
            cache.retain(|_, snapshot| !snapshot.is_expired_at(now, self.cache_ttl));
        }
        {
            let mut sessions = self.hls_sessions.lock().await;
            sessions.retain(|entity_id, session| {
                let keep = !session.is_idle_at(now);
                if !keep {
                    tracing::info!(entity_id, "dropped idle HLS session");
                }
                keep
            });
        }
    }

    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_INTERVAL).await;
                manager.sweep().await;
            }
        })
    }
}

/// Evict the oldest entries until the cache fits its bound.
fn prune_oldest(cache: &mut HashMap<String, CachedSnapshot>, max_entries: usize) {
    while cache.len() > max_entries {
        let oldest = cache
            .iter()
            .min_by_key(|(_, s)| s.captured_at)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                cache.remove(&key);
            }
            None => break,
        }
    }
}
