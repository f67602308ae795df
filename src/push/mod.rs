//! Push pipeline.
//!
//! One long-lived task owns the hub event subscription, the event buffer,
//! the debounce timer and the heartbeat. Batches are signed with the same
//! HMAC scheme as inbound requests and delivered to the platform webhook
//! with a bounded retry; a dropped batch is never re-queued so a slow
//! webhook cannot amplify into the next batch.

use crate::acl::is_entity_allowed;
use crate::audit::{log_push_fail, log_push_success};
use crate::auth::sign_outgoing_request;
use crate::credentials::Credentials;
use crate::formatting::{decimal_places, format_numeric_attributes, format_state_value};
use crate::hub::{Hub, StateChangedEvent, StateSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Delivery attempts per batch.
pub const PUSH_RETRY_MAX: u32 = 3;

/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Cap applied to a webhook's Retry-After on 429.
const RETRY_AFTER_CAP: u64 = 4;

/// Per-attempt delivery timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// A state rendered for the platform: display-ready numbers, formatted
/// attributes.
#[derive(Debug, Clone, Serialize)]
pub struct PushedState {
    pub state: Value,
    pub attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PushedState {
    fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let device_class = snapshot
            .attributes
            .get("device_class")
            .and_then(Value::as_str)
            .unwrap_or("");
        let unit = snapshot
            .attributes
            .get("unit_of_measurement")
            .and_then(Value::as_str)
            .unwrap_or("");
        let places = decimal_places(device_class, unit);

        Self {
            state: format_state_value(&snapshot.state, places),
            attributes: format_numeric_attributes(&snapshot.attributes),
            last_changed: snapshot.last_changed,
            last_updated: snapshot.last_updated,
        }
    }
}

/// One buffered event awaiting the next flush.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_state: Option<PushedState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<PushedState>,
    pub timestamp: DateTime<Utc>,
}

impl QueuedEvent {
    pub fn state_changed(event: &StateChangedEvent) -> Self {
        Self {
            event_type: "state_changed",
            entity_id: Some(event.entity_id.clone()),
            old_state: event.old_state.as_ref().map(PushedState::from_snapshot),
            new_state: event.new_state.as_ref().map(PushedState::from_snapshot),
            timestamp: event.timestamp,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            event_type: "heartbeat",
            entity_id: None,
            old_state: None,
            new_state: None,
            timestamp: Utc::now(),
        }
    }
}

/// State push pipeline, one per bridge instance.
pub struct PushPipeline {
    hub: Arc<dyn Hub>,
    client: reqwest::Client,
    instance_id: String,
    client_secret: String,
    webhook_url: Option<reqwest::Url>,
    signing_path: String,
    batch_interval: Duration,
    backoff_base: Duration,
}

impl PushPipeline {
    pub fn new(hub: Arc<dyn Hub>, credentials: &Credentials, batch_interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("failed to build push HTTP client");

        let (webhook_url, signing_path) = resolve_webhook(&credentials.webhook_url);

        Self {
            hub,
            client,
            instance_id: credentials.instance_id.clone(),
            client_secret: credentials.client_secret.clone(),
            webhook_url,
            signing_path,
            batch_interval,
            backoff_base: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Spawn the single owner task.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn is_allowed(&self, entity_id: &str) -> bool {
        match self.hub.entity(entity_id).await {
            Ok(entry) => is_entity_allowed(entry.as_ref()),
            Err(err) => {
                tracing::debug!(entity_id, error = %err, "entity lookup failed, skipping event");
                false
            }
        }
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.hub.subscribe_state_changes();
        let mut buffer: Vec<QueuedEvent> = Vec::new();
        let mut flush_at: Option<Instant> = None;
        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("push pipeline started");

        loop {
            let flush_timer = async move {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if self.is_allowed(&event.entity_id).await {
                                buffer.push(QueuedEvent::state_changed(&event));
                                if flush_at.is_none() {
                                    flush_at = Some(Instant::now() + self.batch_interval);
                                }
                            }
                        }
                        None => break,
                    }
                }
                _ = flush_timer => {
                    flush_at = None;
                    let batch = std::mem::take(&mut buffer);
                    if !batch.is_empty() {
                        self.deliver(&batch, PUSH_RETRY_MAX).await;
                    }
                }
                // heartbeat is its own cadence; it never resets the debounce
                _ = heartbeat.tick() => {
                    self.deliver(&[QueuedEvent::heartbeat()], PUSH_RETRY_MAX).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        // best-effort flush of whatever is pending, single attempt
        if !buffer.is_empty() {
            self.deliver(&buffer, 1).await;
        }
        tracing::info!("push pipeline stopped");
    }

    /// Deliver one batch with bounded exponential backoff. Exhausted
    /// batches are dropped, never re-queued.
    pub async fn deliver(&self, batch: &[QueuedEvent], max_attempts: u32) {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("no webhook URL configured, skipping push");
            return;
        };

        let body = match serde_json::to_vec(&json!({ "events": batch })) {
            Ok(body) => body,
            Err(err) => {
                log_push_fail(&self.instance_id, batch.len(), "serialization_failed");
                tracing::error!(error = %err, "failed to serialize push batch");
                return;
            }
        };

        for attempt in 0..max_attempts {
            let headers =
                sign_outgoing_request(&self.client_secret, &self.instance_id, &self.signing_path, &body);
            let mut request = self.client.post(url.clone()).body(body.clone());
            for (name, value) in headers {
                request = request.header(name, value);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    log_push_success(&self.instance_id, batch.len());
                    return;
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(1)
                        .min(RETRY_AFTER_CAP);
                    tracing::warn!(retry_after, "platform rate limited push");
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                    }
                    continue;
                }
                Ok(resp) => {
                    tracing::warn!(
                        status = %resp.status(),
                        attempt = attempt + 1,
                        max_attempts,
                        "push rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        attempt = attempt + 1,
                        max_attempts,
                        "push request failed"
                    );
                }
            }

            if attempt + 1 < max_attempts {
                tokio::time::sleep(self.backoff_base * 2u32.pow(attempt)).await;
            }
        }

        log_push_fail(&self.instance_id, batch.len(), "max_retries_exceeded");
    }
}

/// Normalize the configured webhook URL to its `/events` delivery
/// endpoint and extract the path the signature covers.
fn resolve_webhook(raw: &str) -> (Option<reqwest::Url>, String) {
    if raw.trim().is_empty() {
        return (None, String::new());
    }
    let normalized = if raw.ends_with("/events") {
        raw.to_string()
    } else {
        format!("{}/events", raw.trim_end_matches('/'))
    };
    match reqwest::Url::parse(&normalized) {
        Ok(url) => {
            let path = url.path().to_string();
            (Some(url), path)
        }
        Err(err) => {
            tracing::warn!(webhook_url = raw, error = %err, "invalid webhook URL, push disabled");
            (None, String::new())
        }
    }
}
