//! go2rtc integration.
//!
//! The local media server terminates WebRTC and serves HLS; the bridge
//! only brokers SDP/ICE and keeps session bookkeeping. Streams are
//! addressed by camera entity id and auto-registered on first use.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Playlist and frame URLs the media server exposes for one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamUrls {
    pub entity_id: String,
    pub hls_url: String,
    pub mjpeg_url: String,
    pub snapshot_url: String,
}

#[derive(Debug, Deserialize)]
struct WebRtcAnswer {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

/// go2rtc HTTP adapter.
pub struct Go2rtcClient {
    client: reqwest::Client,
    base_url: String,
}

impl Go2rtcClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build go2rtc HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Playlist URLs for a stream (go2rtc v1.9.x layout).
    pub fn stream_urls(&self, entity_id: &str) -> StreamUrls {
        StreamUrls {
            entity_id: entity_id.to_string(),
            hls_url: format!("{}/api/stream.m3u8?src={}", self.base_url, entity_id),
            mjpeg_url: format!("{}/api/stream.mjpeg?src={}", self.base_url, entity_id),
            snapshot_url: format!("{}/api/frame.jpeg?src={}", self.base_url, entity_id),
        }
    }

    /// Register a stream source. go2rtc v1.9.x takes PUT with query
    /// parameters; a 400 with yaml warnings still registers the stream.
    pub async fn add_stream(&self, name: &str, source: &str) -> Result<()> {
        let url = format!(
            "{}/api/streams?name={}&src={}",
            self.base_url,
            urlencoding::encode(name),
            urlencoding::encode(source)
        );

        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| Error::upstream("go2rtc_not_available", e.to_string()))?;

        if resp.status().is_success() || resp.status().as_u16() == 400 {
            tracing::debug!(name, status = %resp.status(), "go2rtc stream add response");
            return Ok(());
        }

        Err(Error::upstream(
            "webrtc_failed",
            format!("stream registration returned {}", resp.status()),
        ))
    }

    async fn post_offer(&self, entity_id: &str, sdp: &str) -> Result<reqwest::Response> {
        let url = format!(
            "{}/api/webrtc?src={}",
            self.base_url,
            urlencoding::encode(entity_id)
        );
        self.client
            .post(&url)
            .json(&json!({ "type": "offer", "sdp": sdp }))
            .send()
            .await
            .map_err(|e| Error::upstream("go2rtc_not_available", e.to_string()))
    }

    /// SDP offer/answer exchange. A 404 means the stream is unknown to the
    /// media server: auto-register from the hub's stream source and retry
    /// once.
    pub async fn exchange_offer(
        &self,
        entity_id: &str,
        stream_source: &str,
        sdp: &str,
    ) -> Result<String> {
        let mut resp = self.post_offer(entity_id, sdp).await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            self.add_stream(entity_id, stream_source).await?;
            resp = self.post_offer(entity_id, sdp).await?;
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::upstream(
                "webrtc_failed",
                format!("offer exchange returned {status}: {body}"),
            ));
        }

        let answer: WebRtcAnswer = resp
            .json()
            .await
            .map_err(|e| Error::upstream("webrtc_failed", e.to_string()))?;
        if answer.kind != "answer" {
            return Err(Error::upstream(
                "webrtc_failed",
                format!("unexpected SDP type {:?}", answer.kind),
            ));
        }
        Ok(answer.sdp)
    }

    /// Forward a trickle ICE candidate. Best-effort; the media server may
    /// have gathered everything from the SDP already.
    pub async fn add_candidate(&self, entity_id: &str, candidate: &serde_json::Value) -> Result<()> {
        let url = format!(
            "{}/api/webrtc?src={}",
            self.base_url,
            urlencoding::encode(entity_id)
        );
        match self
            .client
            .post(&url)
            .json(&json!({ "type": "candidate", "candidate": candidate }))
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                tracing::debug!(entity_id, status = %resp.status(), "go2rtc candidate not accepted");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(entity_id, error = %err, "go2rtc candidate forward failed");
            }
        }
        Ok(())
    }

    /// Tell the media server to drop consumers of a stream. Best-effort:
    /// peers also time out on their own once ICE goes silent.
    pub async fn close_stream(&self, entity_id: &str) {
        let url = format!(
            "{}/api/webrtc?src={}",
            self.base_url,
            urlencoding::encode(entity_id)
        );
        if let Err(err) = self.client.delete(&url).send().await {
            tracing::debug!(entity_id, error = %err, "go2rtc close failed");
        }
    }

    /// Whether the media server answers at all.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/streams", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
