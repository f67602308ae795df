//! In-memory hub implementation.
//!
//! Backs the test suite and standalone development runs: registries,
//! states and history live in plain maps, service calls are recorded and
//! can rewrite the target entity's state.

use super::{
    AreaEntry, ByteStream, CameraImage, DeviceEntry, EntityEntry, FloorEntry, HistoryState, Hub,
    StateChangedEvent, StateSnapshot, StatisticsPeriod, StatisticsRow,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

/// A recorded `services.call` invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub domain: String,
    pub action: String,
    pub data: Value,
}

#[derive(Default)]
struct Registry {
    entities: HashMap<String, EntityEntry>,
    devices: HashMap<String, DeviceEntry>,
    areas: HashMap<String, AreaEntry>,
    floors: HashMap<String, FloorEntry>,
}

/// In-memory hub.
#[derive(Default)]
pub struct MemoryHub {
    registry: RwLock<Registry>,
    states: RwLock<HashMap<String, StateSnapshot>>,
    history: RwLock<HashMap<String, Vec<HistoryState>>>,
    statistics: RwLock<HashMap<String, Vec<StatisticsRow>>>,
    camera_images: RwLock<HashMap<String, CameraImage>>,
    stream_sources: RwLock<HashMap<String, String>>,
    mjpeg_bodies: RwLock<HashMap<String, Bytes>>,
    calls: Mutex<Vec<RecordedCall>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StateChangedEvent>>>,
    /// When set, a successful service call flips the entity to this state.
    post_call_state: RwLock<HashMap<String, StateSnapshot>>,
    fail_service_calls: RwLock<bool>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_entity(&self, entry: EntityEntry) {
        self.registry
            .write()
            .unwrap()
            .entities
            .insert(entry.entity_id.clone(), entry);
    }

    pub fn insert_device(&self, device: DeviceEntry) {
        self.registry
            .write()
            .unwrap()
            .devices
            .insert(device.id.clone(), device);
    }

    pub fn insert_area(&self, area: AreaEntry) {
        self.registry.write().unwrap().areas.insert(area.id.clone(), area);
    }

    pub fn insert_floor(&self, floor: FloorEntry) {
        self.registry.write().unwrap().floors.insert(floor.id.clone(), floor);
    }

    pub fn set_state(&self, snapshot: StateSnapshot) {
        self.states
            .write()
            .unwrap()
            .insert(snapshot.entity_id.clone(), snapshot);
    }

    pub fn set_history(&self, entity_id: &str, states: Vec<HistoryState>) {
        self.history.write().unwrap().insert(entity_id.to_string(), states);
    }

    pub fn set_statistics(&self, statistic_id: &str, rows: Vec<StatisticsRow>) {
        self.statistics
            .write()
            .unwrap()
            .insert(statistic_id.to_string(), rows);
    }

    pub fn set_camera_image(&self, entity_id: &str, content_type: &str, bytes: Bytes) {
        self.camera_images.write().unwrap().insert(
            entity_id.to_string(),
            CameraImage {
                content_type: content_type.to_string(),
                bytes,
            },
        );
    }

    pub fn set_stream_source(&self, entity_id: &str, source: &str) {
        self.stream_sources
            .write()
            .unwrap()
            .insert(entity_id.to_string(), source.to_string());
    }

    pub fn set_mjpeg_body(&self, entity_id: &str, body: Bytes) {
        self.mjpeg_bodies
            .write()
            .unwrap()
            .insert(entity_id.to_string(), body);
    }

    /// After a successful service call the entity reads back this state.
    pub fn set_post_call_state(&self, snapshot: StateSnapshot) {
        self.post_call_state
            .write()
            .unwrap()
            .insert(snapshot.entity_id.clone(), snapshot);
    }

    pub fn fail_service_calls(&self, fail: bool) {
        *self.fail_service_calls.write().unwrap() = fail;
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Fire a state-change event at every subscriber.
    pub fn emit_state_change(&self, event: StateChangedEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl Hub for MemoryHub {
    async fn entity(&self, entity_id: &str) -> Result<Option<EntityEntry>> {
        Ok(self.registry.read().unwrap().entities.get(entity_id).cloned())
    }

    async fn entities(&self) -> Result<Vec<EntityEntry>> {
        let mut entries: Vec<EntityEntry> =
            self.registry.read().unwrap().entities.values().cloned().collect();
        entries.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(entries)
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceEntry>> {
        Ok(self.registry.read().unwrap().devices.get(device_id).cloned())
    }

    async fn area(&self, area_id: &str) -> Result<Option<AreaEntry>> {
        Ok(self.registry.read().unwrap().areas.get(area_id).cloned())
    }

    async fn floor(&self, floor_id: &str) -> Result<Option<FloorEntry>> {
        Ok(self.registry.read().unwrap().floors.get(floor_id).cloned())
    }

    async fn state(&self, entity_id: &str) -> Result<Option<StateSnapshot>> {
        Ok(self.states.read().unwrap().get(entity_id).cloned())
    }

    async fn call_service(&self, domain: &str, action: &str, data: Value) -> Result<()> {
        if *self.fail_service_calls.read().unwrap() {
            return Err(Error::upstream("service_call_failed", "simulated failure"));
        }
        let entity_id = data
            .get("entity_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.calls.lock().unwrap().push(RecordedCall {
            domain: domain.to_string(),
            action: action.to_string(),
            data,
        });
        if let Some(entity_id) = entity_id {
            if let Some(next) = self.post_call_state.read().unwrap().get(&entity_id).cloned() {
                self.states.write().unwrap().insert(entity_id, next);
            }
        }
        Ok(())
    }

    async fn significant_states(
        &self,
        entity_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _significant_changes_only: bool,
    ) -> Result<HashMap<String, Vec<HistoryState>>> {
        let history = self.history.read().unwrap();
        let mut result = HashMap::new();
        for entity_id in entity_ids {
            let states: Vec<HistoryState> = history
                .get(entity_id)
                .map(|states| {
                    states
                        .iter()
                        .filter(|s| s.last_updated >= start && s.last_updated <= end)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            result.insert(entity_id.clone(), states);
        }
        Ok(result)
    }

    async fn statistics_during_period(
        &self,
        statistic_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _period: StatisticsPeriod,
    ) -> Result<Vec<StatisticsRow>> {
        Ok(self
            .statistics
            .read()
            .unwrap()
            .get(statistic_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.start >= start && r.start <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn camera_image(&self, entity_id: &str) -> Result<CameraImage> {
        self.camera_images
            .read()
            .unwrap()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no camera image for {entity_id}")))
    }

    async fn camera_stream_source(&self, entity_id: &str) -> Result<Option<String>> {
        Ok(self.stream_sources.read().unwrap().get(entity_id).cloned())
    }

    async fn camera_mjpeg_stream(&self, entity_id: &str) -> Result<ByteStream> {
        let body = self
            .mjpeg_bodies
            .read()
            .unwrap()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no MJPEG body for {entity_id}")))?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok::<_, std::io::Error>(body)
        })))
    }

    fn subscribe_state_changes(&self) -> mpsc::UnboundedReceiver<StateChangedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}
