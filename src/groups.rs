//! Logical device groups backed by native Zigbee group membership
//! (cluster 0x0004). Groups are created from compatible devices, carry
//! the capability intersection of their members, appear in HA discovery
//! as one virtual entity, and fan commands out to every member.
//!
//! Persistence: `./data/groups/groups.json`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::capabilities::{cluster_id as cid, Capability};
use crate::device::frame_zcl;
use crate::handlers::general::pct_to_raw;
use crate::handlers::ZclRequest;
use crate::ieee::Ieee;
use crate::mqtt::{safe_name, MqttService};
use crate::radio::RadioDriver;
use crate::storage::DataDir;

const GROUPS_FILE: &str = "groups/groups.json";

// Groups cluster commands.
const CMD_ADD_GROUP: u8 = 0x00;
const CMD_REMOVE_GROUP: u8 = 0x03;

/// What the group manager needs to know about devices.
pub trait GroupDirectory: Send + Sync {
    fn device_exists(&self, ieee: &Ieee) -> bool;
    fn capabilities(&self, ieee: &Ieee) -> Vec<Capability>;
    /// Endpoint carrying the given input cluster, if any.
    fn endpoint_for_cluster(&self, ieee: &Ieee, cluster: u16) -> Option<u8>;
    fn device_state(&self, ieee: &Ieee) -> Option<Map<String, Value>>;
    fn is_available(&self, ieee: &Ieee) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupInfo {
    pub id: u16,
    pub name: String,
    pub device_ieees: Vec<Ieee>,
    pub group_type: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupsFile {
    #[serde(default)]
    groups: HashMap<String, GroupInfo>,
    #[serde(default = "first_group_id")]
    next_id: u16,
}

fn first_group_id() -> u16 {
    1
}

impl Default for GroupsFile {
    fn default() -> Self {
        Self { groups: HashMap::new(), next_id: first_group_id() }
    }
}

#[derive(Debug, Serialize)]
pub struct GroupOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

impl GroupOutcome {
    fn ok(group: GroupInfo) -> Self {
        Self { success: true, error: None, group: Some(group), results: None }
    }
    fn err(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()), group: None, results: None }
    }
}

/// Functional kind of a device, for compatibility checks. Lights can
/// group with lights, switches with switches, covers with covers.
fn device_kind(caps: &[Capability]) -> Option<&'static str> {
    if caps.contains(&Capability::Light) {
        Some("light")
    } else if caps.contains(&Capability::Cover) {
        Some("cover")
    } else if caps.contains(&Capability::Switch) {
        Some("switch")
    } else {
        None
    }
}

pub struct GroupManager {
    data: DataDir,
    mqtt: MqttService,
    state: Mutex<GroupsFile>,
}

impl GroupManager {
    pub fn load(data: DataDir, mqtt: MqttService) -> Self {
        let file: GroupsFile = data.load_json(GROUPS_FILE);
        if !file.groups.is_empty() {
            tracing::info!("Loaded {} groups", file.groups.len());
        }
        Self { data, mqtt, state: Mutex::new(file) }
    }

    fn save(&self, file: &GroupsFile) {
        self.data.save_json(GROUPS_FILE, file);
    }

    pub fn groups(&self) -> Vec<GroupInfo> {
        let state = self.state.lock().expect("groups lock");
        let mut groups: Vec<GroupInfo> = state.groups.values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    pub fn group(&self, id: u16) -> Option<GroupInfo> {
        self.state.lock().expect("groups lock").groups.get(&id.to_string()).cloned()
    }

    pub fn group_by_name(&self, name: &str) -> Option<GroupInfo> {
        let state = self.state.lock().expect("groups lock");
        state
            .groups
            .values()
            .find(|g| safe_name(&g.name).eq_ignore_ascii_case(name) || g.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    // ── Create ──────────────────────────────────────────

    pub async fn create(
        &self,
        name: &str,
        ieees: &[Ieee],
        directory: &dyn GroupDirectory,
        radio: &Arc<dyn RadioDriver>,
    ) -> GroupOutcome {
        if ieees.len() < 2 {
            return GroupOutcome::err("A group needs at least two devices");
        }

        // Compatibility: every member must resolve to the same kind.
        let mut kind: Option<&'static str> = None;
        let mut common: Option<Vec<Capability>> = None;
        for ieee in ieees {
            if !directory.device_exists(ieee) {
                return GroupOutcome::err(format!("Device not found: {ieee}"));
            }
            let caps = directory.capabilities(ieee);
            let Some(this_kind) = device_kind(&caps) else {
                return GroupOutcome::err(format!("Device {ieee} is not groupable"));
            };
            match kind {
                None => kind = Some(this_kind),
                Some(k) if k != this_kind => {
                    return GroupOutcome::err(format!(
                        "Incompatible devices: {k} and {this_kind} cannot share a group"
                    ));
                }
                _ => {}
            }
            common = Some(match common {
                None => caps,
                Some(prev) => prev.into_iter().filter(|c| caps.contains(c)).collect(),
            });
        }
        let kind = kind.expect("at least two devices").to_string();
        let common = common.unwrap_or_default();

        let group = {
            let mut state = self.state.lock().expect("groups lock");
            let id = state.next_id;
            state.next_id += 1;
            let group = GroupInfo {
                id,
                name: name.to_string(),
                device_ieees: ieees.to_vec(),
                group_type: kind,
                capabilities: common.iter().map(|c| format!("{c:?}").to_lowercase()).collect(),
            };
            state.groups.insert(id.to_string(), group.clone());
            self.save(&state);
            group
        };

        // Native membership: Add Group on cluster 0x0004, per member.
        for ieee in ieees {
            let endpoint = directory.endpoint_for_cluster(ieee, cid::GROUPS).unwrap_or(1);
            let mut args = group.id.to_le_bytes().to_vec();
            args.push(0x00); // empty group name string
            let frame = frame_zcl(0, &ZclRequest::Command { command_id: CMD_ADD_GROUP, args });
            if let Err(e) = radio.send_unicast(ieee, endpoint, cid::GROUPS, &frame).await {
                tracing::warn!("[{}] add to group {} failed: {}", ieee, group.id, e);
            }
        }

        self.publish_discovery(&group);
        self.publish_state(&group, directory);
        tracing::info!("Created group {} '{}' ({} members)", group.id, group.name, ieees.len());
        GroupOutcome::ok(group)
    }

    // ── Remove ──────────────────────────────────────────

    pub async fn remove(
        &self,
        id: u16,
        directory: &dyn GroupDirectory,
        radio: &Arc<dyn RadioDriver>,
    ) -> GroupOutcome {
        let group = {
            let mut state = self.state.lock().expect("groups lock");
            let Some(group) = state.groups.remove(&id.to_string()) else {
                return GroupOutcome::err(format!("Group not found: {id}"));
            };
            self.save(&state);
            group
        };

        for ieee in &group.device_ieees {
            let endpoint = directory.endpoint_for_cluster(ieee, cid::GROUPS).unwrap_or(1);
            let args = group.id.to_le_bytes().to_vec();
            let frame = frame_zcl(0, &ZclRequest::Command { command_id: CMD_REMOVE_GROUP, args });
            if let Err(e) = radio.send_unicast(ieee, endpoint, cid::GROUPS, &frame).await {
                tracing::warn!("[{}] remove from group {} failed: {}", ieee, group.id, e);
            }
        }

        self.remove_discovery(&group);
        tracing::info!("Removed group {} '{}'", group.id, group.name);
        GroupOutcome::ok(group)
    }

    // ── Control ─────────────────────────────────────────

    /// Fan a command out to every member as direct unicasts, collecting
    /// per-member results.
    pub async fn control(
        &self,
        id: u16,
        data: &Value,
        directory: &dyn GroupDirectory,
        radio: &Arc<dyn RadioDriver>,
    ) -> GroupOutcome {
        let Some(group) = self.group(id) else {
            return GroupOutcome::err(format!("Group not found: {id}"));
        };

        let requests = group_requests(data);
        if requests.is_empty() {
            return GroupOutcome::err("No recognised command in payload");
        }

        let mut results = Map::new();
        for ieee in &group.device_ieees {
            let mut member_ok = true;
            for (cluster, request) in &requests {
                let Some(endpoint) = directory.endpoint_for_cluster(ieee, *cluster) else {
                    continue;
                };
                let frame = frame_zcl(0, request);
                if let Err(e) = radio.send_unicast(ieee, endpoint, *cluster, &frame).await {
                    tracing::warn!("[{}] group {} command failed: {}", ieee, id, e);
                    member_ok = false;
                }
            }
            results.insert(ieee.to_string(), json!(member_ok));
        }

        // Optimistic group state for the retained topic.
        let mut optimistic = Map::new();
        if let Some(state) = data.get("state").and_then(|v| v.as_str()) {
            optimistic.insert("state".into(), json!(state.to_uppercase()));
        }
        if let Some(brightness) = data.get("brightness") {
            optimistic.insert("brightness".into(), brightness.clone());
        }
        if !optimistic.is_empty() {
            let topic = format!("{}/group/{}", self.mqtt.base_topic(), safe_name(&group.name));
            let body = serde_json::to_vec(&Value::Object(optimistic)).unwrap_or_default();
            self.mqtt.queue.publish_nowait(&topic, body, 0, true);
        }

        GroupOutcome {
            success: true,
            error: None,
            group: Some(group),
            results: Some(Value::Object(results)),
        }
    }

    // ── MQTT surface ────────────────────────────────────

    fn group_topic(&self, group: &GroupInfo) -> String {
        format!("{}/group/{}", self.mqtt.base_topic(), safe_name(&group.name))
    }

    pub fn publish_discovery(&self, group: &GroupInfo) {
        let node_id = format!("group_{}", group.id);
        let component = match group.group_type.as_str() {
            "light" => "light",
            "cover" => "cover",
            _ => "switch",
        };
        let state_topic = self.group_topic(group);
        let mut config = json!({
            "name": group.name,
            "unique_id": format!("{node_id}_{component}"),
            "state_topic": state_topic,
            "command_topic": format!("{state_topic}/set"),
            "value_template": "{{ value_json.get('state', 'OFF') }}",
            "availability": [{
                "topic": self.mqtt.bridge_state_topic(),
                "payload_available": "online",
                "payload_not_available": "offline",
            }],
            "device": {
                "identifiers": [node_id],
                "name": group.name,
                "model": "Zigbee group",
                "manufacturer": "waggle",
                "via_device": self.mqtt.base_topic(),
            },
        });
        if component == "light" && group.capabilities.iter().any(|c| c == "levelcontrol") {
            config["brightness"] = json!(true);
            config["brightness_scale"] = json!(254);
        }
        let topic = format!("homeassistant/{component}/{node_id}/{component}/config");
        let body = serde_json::to_vec(&config).unwrap_or_default();
        self.mqtt.queue.publish_nowait(&topic, body, 1, true);
    }

    fn remove_discovery(&self, group: &GroupInfo) {
        let node_id = format!("group_{}", group.id);
        let component = match group.group_type.as_str() {
            "light" => "light",
            "cover" => "cover",
            _ => "switch",
        };
        let topic = format!("homeassistant/{component}/{node_id}/{component}/config");
        self.mqtt.queue.publish_nowait(&topic, Vec::new(), 1, true);
    }

    /// Seed the retained group topic from the first available member.
    pub fn publish_state(&self, group: &GroupInfo, directory: &dyn GroupDirectory) {
        let member_state = group
            .device_ieees
            .iter()
            .filter(|ieee| directory.is_available(ieee))
            .find_map(|ieee| directory.device_state(ieee));
        let Some(state) = member_state else { return };

        let mut payload = Map::new();
        for field in ["state", "brightness", "color_temp", "position"] {
            if let Some(value) = state.get(field) {
                payload.insert(field.into(), value.clone());
            }
        }
        if payload.is_empty() {
            return;
        }
        let body = serde_json::to_vec(&Value::Object(payload)).unwrap_or_default();
        self.mqtt.queue.publish_nowait(&self.group_topic(group), body, 0, true);
    }
}

/// Translate a group command payload into per-cluster ZCL requests.
fn group_requests(data: &Value) -> Vec<(u16, ZclRequest)> {
    let mut requests = Vec::new();

    if let Some(state) = data.get("state").and_then(|v| v.as_str()) {
        let command_id = if state.eq_ignore_ascii_case("on") { 0x01 } else { 0x00 };
        requests.push((cid::ON_OFF, ZclRequest::Command { command_id, args: Vec::new() }));
    }
    if let Some(brightness) = data.get("brightness").and_then(|v| v.as_f64()) {
        // HA sends 0-254 raw.
        let raw = if brightness <= 100.0 { pct_to_raw(brightness) } else { brightness.min(254.0) as u8 };
        let mut args = vec![raw];
        args.extend_from_slice(&1u16.to_le_bytes());
        requests.push((cid::LEVEL_CONTROL, ZclRequest::Command { command_id: 0x04, args }));
    }
    if let Some(mireds) = data.get("color_temp").and_then(|v| v.as_u64()) {
        let mut args = (mireds.min(u16::MAX as u64) as u16).to_le_bytes().to_vec();
        args.extend_from_slice(&1u16.to_le_bytes());
        requests.push((cid::COLOR_CONTROL, ZclRequest::Command { command_id: 0x0A, args }));
    }
    if let Some(position) = data.get("position").and_then(|v| v.as_u64()) {
        let lift = (100 - position.min(100)) as u8;
        requests.push((cid::WINDOW_COVERING, ZclRequest::Command { command_id: 0x05, args: vec![lift] }));
    }

    requests
}
