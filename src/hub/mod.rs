//! Hub interface.
//!
//! The bridge never owns hub state: entity/device/label registries, the
//! state machine, `services.call`, the recorder and the camera subsystem
//! all live in the hub. This module defines the one seam the rest of the
//! bridge talks through, plus the concrete adapters.
//!
//! State-change events arrive over a channel with a single consumer (the
//! push pipeline); the adapter only holds the sending half.

mod memory;
mod rest;

pub use memory::MemoryHub;
pub use rest::RestHub;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Raw upstream byte stream (camera proxying).
pub type ByteStream = Pin<Box<dyn futures::Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Entity registry entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityEntry {
    pub entity_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub original_icon: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl EntityEntry {
    /// Display name with registry precedence.
    pub fn display_name(&self) -> Option<String> {
        self.name.clone().or_else(|| self.original_name.clone())
    }
}

/// Device registry entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
}

/// Area registry entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AreaEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub floor_id: Option<String>,
}

/// Floor registry entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloorEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A point-in-time entity state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// One recorded state in an entity's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryState {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// One aggregated statistics bucket from the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsRow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<f64>,
}

/// Aggregation period for recorder statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsPeriod {
    FiveMinute,
    Hour,
    Day,
    Week,
    Month,
}

impl StatisticsPeriod {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "5minute" => Some(StatisticsPeriod::FiveMinute),
            "hour" => Some(StatisticsPeriod::Hour),
            "day" => Some(StatisticsPeriod::Day),
            "week" => Some(StatisticsPeriod::Week),
            "month" => Some(StatisticsPeriod::Month),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticsPeriod::FiveMinute => "5minute",
            StatisticsPeriod::Hour => "hour",
            StatisticsPeriod::Day => "day",
            StatisticsPeriod::Week => "week",
            StatisticsPeriod::Month => "month",
        }
    }
}

/// A state-change event from the hub event bus.
#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<StateSnapshot>,
    pub new_state: Option<StateSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// A camera image fetched through the hub.
#[derive(Debug, Clone)]
pub struct CameraImage {
    pub content_type: String,
    pub bytes: Bytes,
}

/// Everything the bridge needs from the hub runtime.
#[async_trait]
pub trait Hub: Send + Sync {
    async fn entity(&self, entity_id: &str) -> Result<Option<EntityEntry>>;

    async fn entities(&self) -> Result<Vec<EntityEntry>>;

    async fn device(&self, device_id: &str) -> Result<Option<DeviceEntry>>;

    async fn area(&self, area_id: &str) -> Result<Option<AreaEntry>>;

    async fn floor(&self, floor_id: &str) -> Result<Option<FloorEntry>>;

    async fn state(&self, entity_id: &str) -> Result<Option<StateSnapshot>>;

    /// Invoke a hub service and wait for completion.
    async fn call_service(&self, domain: &str, action: &str, data: Value) -> Result<()>;

    /// Significant-state history for a set of entities, recorder order.
    async fn significant_states(
        &self,
        entity_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        significant_changes_only: bool,
    ) -> Result<HashMap<String, Vec<HistoryState>>>;

    /// Period-aggregated statistics for one statistic id.
    async fn statistics_during_period(
        &self,
        statistic_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: StatisticsPeriod,
    ) -> Result<Vec<StatisticsRow>>;

    /// A fresh still image from the hub camera subsystem.
    async fn camera_image(&self, entity_id: &str) -> Result<CameraImage>;

    /// The camera's upstream stream source URL, if it has one.
    async fn camera_stream_source(&self, entity_id: &str) -> Result<Option<String>>;

    /// The hub-proxied MJPEG body for a camera, as raw bytes.
    async fn camera_mjpeg_stream(&self, entity_id: &str) -> Result<ByteStream>;

    /// Subscribe to state-change events. Intended for a single consumer.
    fn subscribe_state_changes(&self) -> mpsc::UnboundedReceiver<StateChangedEvent>;
}
