//! Topology assembly: floors → areas → devices → entities.
//!
//! Entities whose device has no area land in a synthetic "Unassigned"
//! area; areas with no floor land in a synthetic "No Floor" floor. Every
//! allowed entity appears exactly once.

use super::{entity_domain, resolve_icon};
use crate::error::Result;
use crate::hub::{EntityEntry, Hub};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Synthetic id for missing floors and areas.
pub const UNASSIGNED_ID: &str = "_unassigned";

/// Synthetic id for entities without a device.
pub const VIRTUAL_DEVICE_ID: &str = "_virtual";

#[derive(Debug, Clone, Serialize)]
pub struct EntityNode {
    pub entity_id: String,
    pub domain: String,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub device_id: Option<String>,
    pub area_id: String,
    pub floor_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceNode {
    pub id: String,
    pub name: Option<String>,
    pub entities: Vec<EntityNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AreaNode {
    pub id: String,
    pub name: Option<String>,
    pub devices: Vec<DeviceNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FloorNode {
    pub id: String,
    pub name: Option<String>,
    pub areas: Vec<AreaNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AreaRef {
    pub area_id: String,
    pub name: Option<String>,
    pub floor_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRef {
    pub device_id: String,
    pub name: Option<String>,
    pub area_id: String,
}

/// The sync/structure payload: the nested tree plus flat projections with
/// foreign keys.
#[derive(Debug, Clone, Serialize)]
pub struct StructureResponse {
    pub floors: Vec<FloorNode>,
    pub areas: Vec<AreaRef>,
    pub devices: Vec<DeviceRef>,
    pub entities: Vec<EntityNode>,
}

#[derive(Default)]
struct DeviceSlot {
    name: Option<String>,
    entities: Vec<EntityNode>,
}

/// Assemble the topology tree for the given allowed entities.
pub async fn build_structure(hub: &dyn Hub, allowed: &[EntityEntry]) -> Result<StructureResponse> {
    let mut device_cache: HashMap<String, Option<crate::hub::DeviceEntry>> = HashMap::new();
    let mut area_cache: HashMap<String, Option<crate::hub::AreaEntry>> = HashMap::new();
    let mut floor_cache: HashMap<String, Option<crate::hub::FloorEntry>> = HashMap::new();

    // (floor_key -> area_key -> device_key -> slot), BTreeMap for stable output
    let mut tree: BTreeMap<String, BTreeMap<String, BTreeMap<String, DeviceSlot>>> =
        BTreeMap::new();
    let mut floor_names: HashMap<String, Option<String>> = HashMap::new();
    let mut area_names: HashMap<String, Option<String>> = HashMap::new();
    let mut entities_flat = Vec::with_capacity(allowed.len());

    for entry in allowed {
        let device = match &entry.device_id {
            Some(id) => {
                if !device_cache.contains_key(id) {
                    let fetched = hub.device(id).await?;
                    device_cache.insert(id.clone(), fetched);
                }
                device_cache.get(id).and_then(|d| d.clone())
            }
            None => None,
        };

        let area_id = device.as_ref().and_then(|d| d.area_id.clone());
        let area = match &area_id {
            Some(id) => {
                if !area_cache.contains_key(id) {
                    let fetched = hub.area(id).await?;
                    area_cache.insert(id.clone(), fetched);
                }
                area_cache.get(id).and_then(|a| a.clone())
            }
            None => None,
        };

        let floor_id = area.as_ref().and_then(|a| a.floor_id.clone());
        let floor = match &floor_id {
            Some(id) => {
                if !floor_cache.contains_key(id) {
                    let fetched = hub.floor(id).await?;
                    floor_cache.insert(id.clone(), fetched);
                }
                floor_cache.get(id).and_then(|f| f.clone())
            }
            None => None,
        };

        let floor_key = floor_id.clone().unwrap_or_else(|| UNASSIGNED_ID.to_string());
        let area_key = area_id.clone().unwrap_or_else(|| UNASSIGNED_ID.to_string());
        let device_key = entry
            .device_id
            .clone()
            .unwrap_or_else(|| VIRTUAL_DEVICE_ID.to_string());

        floor_names.entry(floor_key.clone()).or_insert_with(|| {
            if floor_key == UNASSIGNED_ID {
                Some("No Floor".to_string())
            } else {
                floor.as_ref().and_then(|f| f.name.clone())
            }
        });
        area_names.entry(area_key.clone()).or_insert_with(|| {
            if area_key == UNASSIGNED_ID {
                Some("Unassigned".to_string())
            } else {
                area.as_ref().and_then(|a| a.name.clone())
            }
        });

        let node = EntityNode {
            entity_id: entry.entity_id.clone(),
            domain: entity_domain(&entry.entity_id).to_string(),
            name: entry.display_name(),
            icon: resolve_icon(entry),
            device_id: entry.device_id.clone(),
            area_id: area_key.clone(),
            floor_id: floor_key.clone(),
        };
        entities_flat.push(node.clone());

        let slot = tree
            .entry(floor_key)
            .or_default()
            .entry(area_key)
            .or_default()
            .entry(device_key)
            .or_default();
        if slot.name.is_none() {
            slot.name = device.as_ref().and_then(|d| d.name.clone());
        }
        slot.entities.push(node);
    }

    let mut floors = Vec::new();
    let mut areas = Vec::new();
    let mut devices = Vec::new();

    for (floor_key, floor_areas) in tree {
        let floor_name = floor_names.get(&floor_key).cloned().flatten();

        let mut area_nodes = Vec::new();
        for (area_key, area_devices) in floor_areas {
            let area_name = area_names.get(&area_key).cloned().flatten();
            areas.push(AreaRef {
                area_id: area_key.clone(),
                name: area_name.clone(),
                floor_id: floor_key.clone(),
            });

            let mut device_nodes = Vec::new();
            for (device_key, slot) in area_devices {
                devices.push(DeviceRef {
                    device_id: device_key.clone(),
                    name: slot.name.clone(),
                    area_id: area_key.clone(),
                });
                device_nodes.push(DeviceNode {
                    id: device_key,
                    name: slot.name,
                    entities: slot.entities,
                });
            }

            area_nodes.push(AreaNode {
                id: area_key,
                name: area_name,
                devices: device_nodes,
            });
        }

        floors.push(FloorNode {
            id: floor_key,
            name: floor_name,
            areas: area_nodes,
        });
    }

    Ok(StructureResponse {
        floors,
        areas,
        devices,
        entities: entities_flat,
    })
}
