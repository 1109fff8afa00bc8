//! Per-device wrapper: endpoints, handlers, capability set, canonical
//! state map, availability. `update_state` is the choke point every
//! state change flows through.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::capabilities::{Capabilities, Capability, EndpointRole};
use crate::handlers::{
    ClusterHandler, CommandDescriptor, DiscoveryEntity, HandlerContext, HandlerRegistry,
    PollAttribute, ReportConfig, StateDelta, ZclRequest,
};
use crate::ieee::Ieee;
use crate::overrides::OverrideManager;
use crate::radio::{DeviceDescriptor, DeviceRole, EndpointDescriptor};

/// Non-passive devices go unavailable after this long without a report.
pub const AVAILABILITY_TIMEOUT_MS: i64 = 25 * 3600 * 1000;

/// Fields forwarded even when the value did not change, so downstream
/// automations see edge events.
pub const ALWAYS_REPORT: &[&str] = &[
    "occupancy", "presence", "motion", "contact", "alarm", "temperature", "tamper",
    "battery_low", "vibration", "on_with_timed_off", "action",
];

/// Transient sensor fields dropped when restoring persisted state, so a
/// stale "occupied" cannot survive a restart.
pub const TRANSIENT_FIELDS: &[&str] = &["occupancy", "motion", "presence", "radar_state"];

const LIGHT_ATTRS: &[&str] = &[
    "state", "on", "brightness", "level", "color_temp", "color_temperature",
    "color_temperature_mireds", "color_temp_kelvin", "hue", "saturation", "x", "y",
];

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Outcome of an `update_state` call.
#[derive(Debug, Default)]
pub struct UpdateResult {
    /// Fields that should be forwarded downstream.
    pub changed: Map<String, Value>,
    /// Duplicate-endpoint reports dropped as outliers.
    pub duplicates: Vec<Value>,
}

impl UpdateResult {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

/// A (endpoint, cluster) pair with the declarative work configure/poll
/// needs, snapshotted so the radio I/O can run without holding the
/// device entry.
#[derive(Debug, Clone)]
pub struct ClusterPlan {
    pub endpoint: u8,
    pub cluster: u16,
    pub reports: Vec<ReportConfig>,
    pub pollable: Vec<PollAttribute>,
}

pub struct Device {
    pub ieee: Ieee,
    pub nwk: u16,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub role: DeviceRole,
    pub power_source: Option<String>,
    pub endpoints: Vec<EndpointDescriptor>,
    pub capabilities: Capabilities,
    pub state: Map<String, Value>,
    pub last_seen: i64,
    pub lqi: u8,
    available: bool,
    handlers: HashMap<(u8, u16), Box<dyn ClusterHandler>>,
    /// cluster -> first matching handler key, for endpoint-less dispatch.
    primary: HashMap<u16, (u8, u16)>,
    /// field -> endpoint -> last report time, for duplicate detection.
    attribute_sources: HashMap<String, HashMap<u8, i64>>,
    preferred_endpoints: HashMap<String, u8>,
    tsn: u8,
}

impl Device {
    pub fn new(
        descriptor: &DeviceDescriptor,
        registry: &HandlerRegistry,
        overrides: Option<Arc<OverrideManager>>,
    ) -> Self {
        let capabilities = Capabilities::infer(
            &descriptor.endpoints,
            descriptor.manufacturer.as_deref(),
            descriptor.model.as_deref(),
        );
        let mut device = Self {
            ieee: descriptor.ieee.clone(),
            nwk: descriptor.nwk,
            manufacturer: descriptor.manufacturer.clone(),
            model: descriptor.model.clone(),
            role: descriptor.role,
            power_source: descriptor.power_source.clone(),
            endpoints: descriptor.endpoints.clone(),
            capabilities,
            state: Map::new(),
            last_seen: now_ms(),
            lqi: 0,
            available: true,
            handlers: HashMap::new(),
            primary: HashMap::new(),
            attribute_sources: HashMap::new(),
            preferred_endpoints: HashMap::new(),
            tsn: 0,
        };
        device.rebuild_handlers(registry, overrides);
        device
    }

    /// (Re)attach handlers for every input and output cluster. Previous
    /// handler instances are dropped first so a rebuilt wrapper never
    /// leaves stale listeners firing twice.
    pub fn rebuild_handlers(
        &mut self,
        registry: &HandlerRegistry,
        overrides: Option<Arc<OverrideManager>>,
    ) {
        self.handlers.clear();
        self.primary.clear();

        let suffix_endpoint = self.capabilities.has(Capability::MultiSwitch);

        for ep in &self.endpoints {
            if ep.id == 0 {
                continue; // ZDO
            }
            let clusters: Vec<u16> = ep
                .input_clusters
                .iter()
                .chain(ep.output_clusters.iter())
                .copied()
                .collect();
            for cluster in clusters {
                let key = (ep.id, cluster);
                if self.handlers.contains_key(&key) {
                    continue;
                }
                let ctx = HandlerContext {
                    ieee: self.ieee.clone(),
                    endpoint: ep.id,
                    cluster,
                    manufacturer: self.manufacturer.clone(),
                    model: self.model.clone(),
                    capabilities: self.capabilities.clone(),
                    suffix_endpoint,
                    overrides: overrides.clone(),
                };
                self.handlers.insert(key, registry.create(ctx));
                self.primary.entry(cluster).or_insert(key);
            }
        }
        tracing::debug!("[{}] attached {} handlers", self.ieee, self.handlers.len());
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn handler_keys(&self) -> Vec<(u8, u16)> {
        self.handlers.keys().copied().collect()
    }

    fn handler(&self, endpoint: u8, cluster: u16) -> Option<&dyn ClusterHandler> {
        self.handlers
            .get(&(endpoint, cluster))
            .or_else(|| self.primary.get(&cluster).and_then(|key| self.handlers.get(key)))
            .map(|b| b.as_ref())
    }

    pub fn next_tsn(&mut self) -> u8 {
        self.tsn = self.tsn.wrapping_add(1);
        self.tsn
    }

    // ── Inbound dispatch ────────────────────────────────

    pub fn handle_attribute_report(
        &mut self,
        endpoint: u8,
        cluster: u16,
        attr_id: u16,
        value: &Value,
    ) -> UpdateResult {
        let mut delta = StateDelta::new();
        if let Some(handler) = self.handler(endpoint, cluster) {
            handler.attribute_updated(attr_id, value, &mut delta);
        }
        if delta.is_empty() {
            self.touch();
            return UpdateResult::default();
        }
        self.update_state(delta, Some(endpoint))
    }

    pub fn handle_cluster_command(
        &mut self,
        endpoint: u8,
        cluster: u16,
        tsn: u8,
        command_id: u8,
        payload: &[u8],
    ) -> UpdateResult {
        let mut delta = StateDelta::new();
        if let Some(handler) = self.handler(endpoint, cluster) {
            handler.cluster_command(tsn, command_id, payload, &mut delta);
        }
        if delta.is_empty() {
            self.touch();
            return UpdateResult::default();
        }
        self.update_state(delta, Some(endpoint))
    }

    /// Record traffic without a state change.
    pub fn touch(&mut self) {
        self.last_seen = self.last_seen.max(now_ms());
        self.state.insert("last_seen".into(), json!(self.last_seen));
        self.available = true;
    }

    // ── The choke point ─────────────────────────────────

    pub fn update_state(&mut self, data: StateDelta, endpoint_id: Option<u8>) -> UpdateResult {
        // 1. Capability filter.
        let data = self.capabilities.filter_state_update(&data);
        if data.is_empty() {
            return UpdateResult::default();
        }

        let mut changed = Map::new();
        let mut duplicates = Vec::new();
        let mut dropped: std::collections::HashSet<String> = std::collections::HashSet::new();
        let now = now_ms();

        for (key, value) in &data {
            // 2. Duplicate handling for multi-endpoint devices.
            if let Some(ep) = endpoint_id {
                let sources = self.attribute_sources.entry(key.clone()).or_default();
                sources.insert(ep, now);
                if sources.len() > 1 {
                    if let Some(preferred) = self.preferred_endpoints.get(key) {
                        if *preferred != ep {
                            dropped.insert(key.clone());
                            continue;
                        }
                    } else if value.as_f64() == Some(0.0) {
                        // A zero where another endpoint holds data is an
                        // outlier, not a reading.
                        duplicates.push(json!({
                            "attribute": key,
                            "value": value,
                            "endpoint": ep,
                            "reason": "outlier_zero",
                        }));
                        dropped.insert(key.clone());
                        continue;
                    }
                }
            }

            // 3. Always-report fields pass even unchanged.
            if ALWAYS_REPORT.contains(&key.as_str()) || self.state.get(key) != Some(value) {
                changed.insert(key.clone(), value.clone());
            }
        }

        // 4. Light consistency merge: any lighting change republishes the
        // whole light object.
        if self.capabilities.has(Capability::Light) {
            let touches_light = data.keys().any(|k| {
                LIGHT_ATTRS.contains(&k.as_str())
                    || LIGHT_ATTRS.iter().any(|attr| k.starts_with(&format!("{attr}_")))
            });
            if touches_light {
                for attr in ["state", "on", "brightness", "level", "color_temp"] {
                    if !changed.contains_key(attr) {
                        if let Some(current) = self.state.get(attr) {
                            changed.insert(attr.to_string(), current.clone());
                        }
                    }
                }
                if let Some(ep) = endpoint_id {
                    for attr in ["state", "on"] {
                        let key = format!("{attr}_{ep}");
                        if !changed.contains_key(&key) {
                            if let Some(current) = self.state.get(&key) {
                                changed.insert(key, current.clone());
                            }
                        }
                    }
                }
            }
        }

        // 5. Merge and stamp. Dropped duplicates never enter the map.
        for (key, value) in data {
            if !dropped.contains(&key) {
                self.state.insert(key, value);
            }
        }
        if let Some(manufacturer) = &self.manufacturer {
            self.state.entry("manufacturer".to_string()).or_insert_with(|| json!(manufacturer));
        }
        if let Some(model) = &self.model {
            self.state.entry("model".to_string()).or_insert_with(|| json!(model));
        }
        self.last_seen = self.last_seen.max(now);
        self.state.insert("last_seen".into(), json!(self.last_seen));
        self.available = true;

        if !changed.is_empty() {
            changed.insert("last_seen".into(), json!(self.last_seen));
        }

        UpdateResult { changed, duplicates }
    }

    // ── Availability ────────────────────────────────────

    pub fn is_battery_powered(&self) -> bool {
        match &self.power_source {
            Some(source) => source.to_lowercase().contains("battery"),
            None => self.capabilities.has(Capability::Battery) && self.role == DeviceRole::EndDevice,
        }
    }

    /// Passive sensors report on their own schedule and are never polled.
    pub fn is_passive(&self) -> bool {
        self.is_battery_powered()
            && (self.capabilities.has(Capability::IasZone)
                || self.capabilities.has(Capability::OccupancySensing))
    }

    pub fn is_available(&self) -> bool {
        if self.role == DeviceRole::Coordinator {
            return true;
        }
        if self.is_passive() {
            return true;
        }
        now_ms() - self.last_seen < AVAILABILITY_TIMEOUT_MS
    }

    /// Re-derive the cached availability flag. True when it flipped.
    pub fn check_availability_change(&mut self) -> bool {
        let now_available = self.is_available();
        if now_available != self.available {
            self.available = now_available;
            tracing::info!(
                "[{}] availability changed to {}",
                self.ieee,
                if now_available { "online" } else { "offline" }
            );
            return true;
        }
        false
    }

    // ── Restore / sanitise ──────────────────────────────

    /// Drop transient sensor state so a restart never resurrects a stale
    /// "occupied", then apply the capability filter to scrub fields the
    /// device can no longer produce.
    pub fn sanitise_restored(&self, cached: &Map<String, Value>) -> Map<String, Value> {
        cached
            .iter()
            .filter(|(k, _)| !TRANSIENT_FIELDS.contains(&k.as_str()))
            .filter(|(k, _)| self.capabilities.allows_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn restore_state(&mut self, cached: &Map<String, Value>) {
        let clean = self.sanitise_restored(cached);
        for (key, value) in clean {
            self.state.insert(key, value);
        }
        if let Some(ls) = self.state.get("last_seen").and_then(|v| v.as_i64()) {
            self.last_seen = self.last_seen.max(ls);
            self.available = self.is_available();
        }
    }

    // ── Preferred endpoints ─────────────────────────────

    pub fn set_preferred_endpoint(&mut self, attribute: &str, endpoint: u8) {
        tracing::info!("[{}] pinned {} to endpoint {}", self.ieee, attribute, endpoint);
        self.preferred_endpoints.insert(attribute.to_string(), endpoint);
    }

    pub fn preferred_endpoints(&self) -> &HashMap<String, u8> {
        &self.preferred_endpoints
    }

    pub fn load_preferred_endpoints(&mut self, map: HashMap<String, u8>) {
        self.preferred_endpoints = map;
    }

    // ── Command encoding ────────────────────────────────

    /// Resolve a control verb to the handler owning it and a framed ZCL
    /// payload. Endpoint preference: explicit endpoint, then first
    /// handler that recognises the verb.
    pub fn encode_command(
        &mut self,
        verb: &str,
        value: Option<&Value>,
        endpoint_id: Option<u8>,
    ) -> Option<(u8, u16, Vec<u8>)> {
        let mut candidates: Vec<(u8, u16)> = self.handlers.keys().copied().collect();
        candidates.sort_unstable();
        if let Some(ep) = endpoint_id {
            candidates.retain(|(e, _)| *e == ep);
        }

        for key in candidates {
            let request = match self.handlers.get(&key) {
                Some(handler) => handler.encode_command(verb, value),
                None => None,
            };
            if let Some(request) = request {
                let tsn = self.next_tsn();
                return Some((key.0, key.1, frame_zcl(tsn, &request)));
            }
        }
        None
    }

    // ── Aggregation for configure / poll / discovery ────

    /// Clusters worth configuring: input clusters with a configurable
    /// handler, skipping controller-role endpoints.
    pub fn configure_plan(&self) -> Vec<ClusterPlan> {
        let mut plans = Vec::new();
        for ((endpoint, cluster), handler) in &self.handlers {
            if !handler.configurable() {
                continue;
            }
            if self.capabilities.endpoint_role(*endpoint) == Some(EndpointRole::Controller) {
                continue;
            }
            if !self.capabilities.is_cluster_configurable(*cluster, *endpoint) {
                continue;
            }
            let reports = handler.report_config();
            if reports.is_empty() {
                continue;
            }
            plans.push(ClusterPlan {
                endpoint: *endpoint,
                cluster: *cluster,
                reports,
                pollable: handler.pollable_attributes(),
            });
        }
        plans.sort_by_key(|p| (p.endpoint, p.cluster));
        plans
    }

    pub fn poll_plan(&self) -> Vec<ClusterPlan> {
        let mut plans = Vec::new();
        for ((endpoint, cluster), handler) in &self.handlers {
            let pollable = handler.pollable_attributes();
            if pollable.is_empty() {
                continue;
            }
            plans.push(ClusterPlan {
                endpoint: *endpoint,
                cluster: *cluster,
                reports: Vec::new(),
                pollable,
            });
        }
        plans.sort_by_key(|p| (p.endpoint, p.cluster));
        plans
    }

    /// Parse a polled raw attribute through the owning handler.
    pub fn parse_polled(
        &self,
        endpoint: u8,
        cluster: u16,
        attr_id: u16,
        value: &Value,
    ) -> StateDelta {
        let mut delta = StateDelta::new();
        if let Some(handler) = self.handler(endpoint, cluster) {
            handler.attribute_updated(attr_id, value, &mut delta);
        }
        delta
    }

    /// Aggregate discovery entities across handlers, first contribution
    /// per object id wins.
    pub fn discovery_entities(&self) -> Vec<DiscoveryEntity> {
        let mut seen = std::collections::HashSet::new();
        let mut entities = Vec::new();
        let mut keys: Vec<(u8, u16)> = self.handlers.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            if let Some(handler) = self.handlers.get(&key) {
                for entity in handler.discovery() {
                    if seen.insert(entity.object_id.clone()) {
                        entities.push(entity);
                    }
                }
            }
        }
        entities
    }

    pub fn control_commands(&self) -> Vec<CommandDescriptor> {
        let mut seen = std::collections::HashSet::new();
        let mut commands = Vec::new();
        let mut keys: Vec<(u8, u16)> = self.handlers.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            if let Some(handler) = self.handlers.get(&key) {
                for command in handler.commands() {
                    if seen.insert(command.command.clone()) {
                        commands.push(command);
                    }
                }
            }
        }
        commands
    }

    pub fn role_name(&self) -> &'static str {
        match self.role {
            DeviceRole::Coordinator => "Coordinator",
            DeviceRole::Router => "Router",
            DeviceRole::EndDevice => "EndDevice",
        }
    }
}

/// Frame a ZCL request: cluster-specific commands get frame control 0x01,
/// global write-attributes 0x00/0x02.
pub fn frame_zcl(tsn: u8, request: &ZclRequest) -> Vec<u8> {
    match request {
        ZclRequest::Command { command_id, args } => {
            let mut frame = vec![0x01, tsn, *command_id];
            frame.extend_from_slice(args);
            frame
        }
        ZclRequest::WriteAttribute { attr, data_type, value } => {
            let mut frame = vec![0x00, tsn, 0x02];
            frame.extend_from_slice(&attr.to_le_bytes());
            frame.push(*data_type);
            frame.extend_from_slice(value);
            frame
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::cluster_id as cid;

    fn descriptor(clusters_per_ep: &[(u8, &[u16])]) -> DeviceDescriptor {
        DeviceDescriptor {
            ieee: Ieee::parse("00:11:22:33:44:55:66:77").unwrap(),
            nwk: 0x1234,
            manufacturer: Some("Acme".into()),
            model: Some("Widget".into()),
            role: DeviceRole::Router,
            power_source: Some("Mains".into()),
            endpoints: clusters_per_ep
                .iter()
                .map(|(id, clusters)| EndpointDescriptor {
                    id: *id,
                    profile: 0x0104,
                    input_clusters: clusters.to_vec(),
                    output_clusters: vec![],
                })
                .collect(),
        }
    }

    fn make_device(clusters_per_ep: &[(u8, &[u16])]) -> Device {
        Device::new(&descriptor(clusters_per_ep), &HandlerRegistry::standard(), None)
    }

    #[test]
    fn rebuild_leaves_exactly_one_handler_per_triple() {
        let registry = HandlerRegistry::standard();
        let mut device = make_device(&[(1, &[cid::ON_OFF, cid::LEVEL_CONTROL])]);
        let before = device.handler_count();

        device.rebuild_handlers(&registry, None);
        device.rebuild_handlers(&registry, None);

        assert_eq!(device.handler_count(), before);
        let mut keys = device.handler_keys();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), before);
    }

    #[test]
    fn attribute_report_flows_to_state() {
        let mut device = make_device(&[(1, &[cid::ON_OFF])]);
        let result = device.handle_attribute_report(1, cid::ON_OFF, 0x0000, &json!(1));
        assert_eq!(result.changed["state"], json!("ON"));
        assert_eq!(device.state["state"], json!("ON"));
        assert!(result.changed.contains_key("last_seen"));
    }

    #[test]
    fn capability_filter_blocks_foreign_fields() {
        let mut device = make_device(&[(1, &[cid::ON_OFF])]);
        let mut delta = StateDelta::new();
        delta.insert("occupancy".into(), json!(true));
        let result = device.update_state(delta, Some(1));
        assert!(result.is_empty());
        assert!(!device.state.contains_key("occupancy"));
    }

    #[test]
    fn unchanged_values_are_not_rereported_unless_edge_field() {
        let mut device = make_device(&[(1, &[cid::ON_OFF, cid::OCCUPANCY_SENSING])]);

        let mut delta = StateDelta::new();
        delta.insert("state".into(), json!("ON"));
        let first = device.update_state(delta.clone(), Some(1));
        assert!(first.changed.contains_key("state"));
        let second = device.update_state(delta, Some(1));
        assert!(!second.changed.contains_key("state"));

        // occupancy is an edge field: repeats always forward.
        let mut occ = StateDelta::new();
        occ.insert("occupancy".into(), json!(true));
        device.update_state(occ.clone(), Some(1));
        let repeat = device.update_state(occ, Some(1));
        assert_eq!(repeat.changed["occupancy"], json!(true));
    }

    #[test]
    fn last_seen_is_monotonic() {
        let mut device = make_device(&[(1, &[cid::ON_OFF])]);
        device.last_seen = now_ms() + 60_000; // device clock ahead of us
        let before = device.last_seen;
        let mut delta = StateDelta::new();
        delta.insert("state".into(), json!("ON"));
        device.update_state(delta, Some(1));
        assert!(device.last_seen >= before);
    }

    #[test]
    fn duplicate_zero_from_second_endpoint_is_dropped() {
        let mut device = make_device(&[(1, &[cid::ELECTRICAL_MEASUREMENT]), (2, &[cid::ELECTRICAL_MEASUREMENT])]);
        let mut delta = StateDelta::new();
        delta.insert("power".into(), json!(120.0));
        device.update_state(delta, Some(1));

        let mut zero = StateDelta::new();
        zero.insert("power".into(), json!(0.0));
        let result = device.update_state(zero, Some(2));
        assert!(!result.changed.contains_key("power"));
        assert_eq!(result.duplicates.len(), 1);
        assert_eq!(device.state["power"], json!(120.0));
    }

    #[test]
    fn preferred_endpoint_pins_duplicates() {
        let mut device = make_device(&[(1, &[cid::TEMPERATURE_MEASUREMENT]), (2, &[cid::TEMPERATURE_MEASUREMENT])]);
        device.set_preferred_endpoint("temperature", 2);

        let mut d1 = StateDelta::new();
        d1.insert("temperature".into(), json!(20.0));
        device.update_state(d1, Some(2));

        let mut d2 = StateDelta::new();
        d2.insert("temperature".into(), json!(99.0));
        let result = device.update_state(d2, Some(1));
        assert!(!result.changed.contains_key("temperature"));
        assert_eq!(device.state["temperature"], json!(20.0));
    }

    #[test]
    fn restore_drops_transient_sensor_state() {
        let mut device = make_device(&[(1, &[cid::OCCUPANCY_SENSING, cid::TEMPERATURE_MEASUREMENT])]);
        let mut cached = Map::new();
        cached.insert("occupancy".into(), json!(true));
        cached.insert("temperature".into(), json!(21.0));
        cached.insert("brightness".into(), json!(200)); // not allowed for this device

        device.restore_state(&cached);
        assert!(!device.state.contains_key("occupancy"));
        assert!(!device.state.contains_key("brightness"));
        assert_eq!(device.state["temperature"], json!(21.0));
    }

    #[test]
    fn sanitise_is_idempotent() {
        let device = make_device(&[(1, &[cid::OCCUPANCY_SENSING, cid::TEMPERATURE_MEASUREMENT])]);
        let mut cached = Map::new();
        cached.insert("occupancy".into(), json!(true));
        cached.insert("temperature".into(), json!(21.0));
        let once = device.sanitise_restored(&cached);
        let twice = device.sanitise_restored(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn command_routes_to_explicit_endpoint() {
        let mut device = make_device(&[(1, &[cid::ON_OFF]), (2, &[cid::ON_OFF])]);
        let (endpoint, cluster, frame) = device.encode_command("on", None, Some(2)).unwrap();
        assert_eq!(endpoint, 2);
        assert_eq!(cluster, cid::ON_OFF);
        // Frame control, tsn, command id.
        assert_eq!(frame[0], 0x01);
        assert_eq!(frame[2], 0x01);
    }

    #[test]
    fn light_merge_keeps_payload_consistent() {
        let mut device = make_device(&[(1, &[cid::ON_OFF, cid::LEVEL_CONTROL])]);
        let mut initial = StateDelta::new();
        initial.insert("state".into(), json!("ON"));
        initial.insert("on".into(), json!(true));
        initial.insert("brightness".into(), json!(200));
        device.update_state(initial, Some(1));

        let mut only_brightness = StateDelta::new();
        only_brightness.insert("brightness".into(), json!(120));
        let result = device.update_state(only_brightness, Some(1));
        // The unchanged state field rides along for payload consistency.
        assert_eq!(result.changed["state"], json!("ON"));
        assert_eq!(result.changed["brightness"], json!(120));
    }

    #[test]
    fn passive_battery_sensor_is_always_available() {
        let mut descriptor = descriptor(&[(1, &[cid::IAS_ZONE, cid::POWER_CONFIGURATION])]);
        descriptor.power_source = Some("Battery".into());
        descriptor.role = DeviceRole::EndDevice;
        let mut device = Device::new(&descriptor, &HandlerRegistry::standard(), None);
        device.last_seen = 0; // decades ago
        assert!(device.is_passive());
        assert!(device.is_available());
    }

    #[test]
    fn mains_device_goes_stale_after_timeout() {
        let mut device = make_device(&[(1, &[cid::ON_OFF])]);
        device.last_seen = now_ms() - AVAILABILITY_TIMEOUT_MS - 1;
        assert!(!device.is_available());
        assert!(device.check_availability_change());
        assert!(!device.check_availability_change());
    }

    #[test]
    fn configure_plan_skips_controller_endpoints() {
        let descriptor = DeviceDescriptor {
            ieee: Ieee::parse("00:17:88:01:02:03:04:05").unwrap(),
            nwk: 0x0001,
            manufacturer: Some("Philips".into()),
            model: Some("SML001".into()),
            role: DeviceRole::EndDevice,
            power_source: Some("Battery".into()),
            endpoints: vec![
                EndpointDescriptor {
                    id: 1,
                    profile: 0x0104,
                    input_clusters: vec![cid::ON_OFF],
                    output_clusters: vec![cid::ON_OFF],
                },
                EndpointDescriptor {
                    id: 2,
                    profile: 0x0104,
                    input_clusters: vec![cid::OCCUPANCY_SENSING, cid::ILLUMINANCE_MEASUREMENT],
                    output_clusters: vec![],
                },
            ],
        };
        let device = Device::new(&descriptor, &HandlerRegistry::standard(), None);
        let plan = device.configure_plan();
        assert!(plan.iter().all(|p| p.endpoint == 2));
        assert!(plan.iter().any(|p| p.cluster == cid::OCCUPANCY_SENSING));
    }
}
