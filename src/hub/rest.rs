//! REST adapter for the hub supervisor API.
//!
//! Registry, state, service and recorder calls go over plain HTTP with a
//! bearer token. State-change events come from the hub's SSE stream and
//! are forwarded into an mpsc channel; the reader task reconnects with a
//! flat backoff until the receiving side goes away.

use super::{
    AreaEntry, ByteStream, CameraImage, DeviceEntry, EntityEntry, FloorEntry, HistoryState, Hub,
    StateChangedEvent, StateSnapshot, StatisticsPeriod, StatisticsRow,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_STREAM_RECONNECT: Duration = Duration::from_secs(5);

/// Hub adapter over the supervisor HTTP API.
pub struct RestHub {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestHub {
    pub fn new(base_url: String, token: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build hub HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(&self.token)
    }

    /// GET a JSON resource, mapping 404 to `None`.
    async fn fetch_optional<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let resp = self.get(path).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "hub returned {} for {}",
                resp.status(),
                path
            )));
        }
        Ok(Some(resp.json().await?))
    }
}

#[derive(Debug, Deserialize)]
struct StreamSourceResponse {
    stream_source: Option<String>,
}

/// One SSE event from the hub event bus.
#[derive(Debug, Deserialize)]
struct BusEvent {
    event_type: String,
    #[serde(default)]
    data: BusEventData,
    #[serde(default)]
    time_fired: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct BusEventData {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    old_state: Option<StateSnapshot>,
    #[serde(default)]
    new_state: Option<StateSnapshot>,
}

fn parse_sse_line(line: &str) -> Option<StateChangedEvent> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    let event: BusEvent = serde_json::from_str(payload).ok()?;
    if event.event_type != "state_changed" {
        return None;
    }
    let entity_id = event.data.entity_id?;
    Some(StateChangedEvent {
        entity_id,
        old_state: event.data.old_state,
        new_state: event.data.new_state,
        timestamp: event.time_fired.unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl Hub for RestHub {
    async fn entity(&self, entity_id: &str) -> Result<Option<EntityEntry>> {
        self.fetch_optional(&format!("/api/registry/entities/{entity_id}")).await
    }

    async fn entities(&self) -> Result<Vec<EntityEntry>> {
        let resp = self.get("/api/registry/entities").send().await?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "hub entity registry returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceEntry>> {
        self.fetch_optional(&format!("/api/registry/devices/{device_id}")).await
    }

    async fn area(&self, area_id: &str) -> Result<Option<AreaEntry>> {
        self.fetch_optional(&format!("/api/registry/areas/{area_id}")).await
    }

    async fn floor(&self, floor_id: &str) -> Result<Option<FloorEntry>> {
        self.fetch_optional(&format!("/api/registry/floors/{floor_id}")).await
    }

    async fn state(&self, entity_id: &str) -> Result<Option<StateSnapshot>> {
        self.fetch_optional(&format!("/api/states/{entity_id}")).await
    }

    async fn call_service(&self, domain: &str, action: &str, data: Value) -> Result<()> {
        let resp = self
            .post(&format!("/api/services/{domain}/{action}"))
            .json(&data)
            .send()
            .await
            .map_err(|e| Error::upstream("service_call_failed", e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::upstream(
                "service_call_failed",
                format!("{domain}.{action} -> {status}: {body}"),
            ));
        }
        Ok(())
    }

    async fn significant_states(
        &self,
        entity_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        significant_changes_only: bool,
    ) -> Result<HashMap<String, Vec<HistoryState>>> {
        let resp = self
            .post("/api/history/significant_states")
            .json(&json!({
                "entity_ids": entity_ids,
                "start_time": start,
                "end_time": end,
                "significant_changes_only": significant_changes_only,
            }))
            .send()
            .await
            .map_err(|e| Error::upstream("history_query_failed", e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::upstream(
                "history_query_failed",
                format!("recorder returned {}", resp.status()),
            ));
        }
        resp.json()
            .await
            .map_err(|e| Error::upstream("history_query_failed", e.to_string()))
    }

    async fn statistics_during_period(
        &self,
        statistic_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: StatisticsPeriod,
    ) -> Result<Vec<StatisticsRow>> {
        let resp = self
            .post("/api/history/statistics")
            .json(&json!({
                "statistic_id": statistic_id,
                "start_time": start,
                "end_time": end,
                "period": period.as_str(),
            }))
            .send()
            .await
            .map_err(|e| Error::upstream("statistics_query_failed", e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::upstream(
                "statistics_query_failed",
                format!("recorder returned {}", resp.status()),
            ));
        }
        resp.json()
            .await
            .map_err(|e| Error::upstream("statistics_query_failed", e.to_string()))
    }

    async fn camera_image(&self, entity_id: &str) -> Result<CameraImage> {
        let resp = self.get(&format!("/api/camera_proxy/{entity_id}")).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "hub camera proxy returned {} for {}",
                resp.status(),
                entity_id
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = resp.bytes().await?;
        Ok(CameraImage { content_type, bytes })
    }

    async fn camera_stream_source(&self, entity_id: &str) -> Result<Option<String>> {
        let resp: Option<StreamSourceResponse> = self
            .fetch_optional(&format!("/api/camera/{entity_id}/stream_source"))
            .await?;
        Ok(resp.and_then(|r| r.stream_source))
    }

    async fn camera_mjpeg_stream(&self, entity_id: &str) -> Result<ByteStream> {
        let resp = self
            .get(&format!("/api/camera_proxy_stream/{entity_id}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "hub MJPEG proxy returned {} for {}",
                resp.status(),
                entity_id
            )));
        }
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        Ok(Box::pin(stream))
    }

    fn subscribe_state_changes(&self) -> mpsc::UnboundedReceiver<StateChangedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = self.url("/api/stream");
        let token = self.token.clone();

        tokio::spawn(async move {
            loop {
                match client.get(&url).bearer_auth(&token).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        let mut stream = resp.bytes_stream();
                        let mut buffer = String::new();
                        while let Some(chunk) = stream.next().await {
                            let chunk = match chunk {
                                Ok(c) => c,
                                Err(err) => {
                                    tracing::debug!(error = %err, "event stream read error");
                                    break;
                                }
                            };
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                            while let Some(pos) = buffer.find('\n') {
                                let line = buffer[..pos].trim_end_matches('\r').to_string();
                                buffer.drain(..=pos);
                                if let Some(event) = parse_sse_line(&line) {
                                    if tx.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Ok(resp) => {
                        tracing::warn!(status = %resp.status(), "event stream rejected");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "event stream connect failed");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(EVENT_STREAM_RECONNECT).await;
            }
        });

        rx
    }
}
