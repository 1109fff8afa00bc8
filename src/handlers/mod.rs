//! Cluster handlers: one strategy per ZCL cluster.
//!
//! A handler is a stateless parser/encoder bound to a specific
//! (device, endpoint, cluster) triple. The hot path is synchronous: a
//! handler turns an attribute report or cluster command into a state
//! delta and never awaits. Binding, reporting configuration and polling
//! are driven by the device from the declarative tables a handler
//! exposes.

pub mod aqara;
pub mod blinds;
pub mod diagnostics;
pub mod general;
pub mod generic;
pub mod hvac;
pub mod lighting;
pub mod power;
pub mod security;
pub mod sensors;
pub mod tuya;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::capabilities::{cluster_id as cid, Capabilities};
use crate::ieee::Ieee;
use crate::overrides::OverrideManager;

pub type StateDelta = Map<String, Value>;

/// Context a handler is constructed with. Quirk decisions (endpoint
/// suffixing, model-specific DP tables) key off this.
#[derive(Clone)]
pub struct HandlerContext {
    pub ieee: Ieee,
    pub endpoint: u8,
    pub cluster: u16,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub capabilities: Capabilities,
    /// Multi-switch devices suffix per-endpoint fields (`state_N`).
    pub suffix_endpoint: bool,
    pub overrides: Option<Arc<OverrideManager>>,
}

impl HandlerContext {
    /// `state` or `state_N` depending on the device shape.
    pub fn field(&self, base: &str) -> String {
        if self.suffix_endpoint {
            format!("{}_{}", base, self.endpoint)
        } else {
            base.to_string()
        }
    }
}

/// Per-attribute reporting tuple installed during configure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportConfig {
    pub attr: u16,
    pub min_s: u16,
    pub max_s: u16,
    pub change: u32,
}

/// An attribute a handler wants polled, with the state field it feeds.
#[derive(Debug, Clone)]
pub struct PollAttribute {
    pub attr: u16,
    pub name: String,
}

/// A ZCL request a handler encodes for a control verb. The device owns
/// the transaction sequence number and final framing.
#[derive(Debug, Clone, PartialEq)]
pub enum ZclRequest {
    /// Cluster-specific command with pre-encoded arguments.
    Command { command_id: u8, args: Vec<u8> },
    /// Global Write Attributes for a single attribute.
    WriteAttribute { attr: u16, data_type: u8, value: Vec<u8> },
}

/// Home-Assistant discovery entity contributed by a handler. The MQTT
/// service fills in topics, device block and availability.
#[derive(Debug, Clone)]
pub struct DiscoveryEntity {
    pub component: &'static str,
    pub object_id: String,
    pub config: Value,
}

/// A control verb exposed for UI/automation enumeration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandDescriptor {
    pub command: String,
    pub value_kind: Option<&'static str>,
    pub description: String,
}

pub trait ClusterHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn cluster_id(&self) -> u16;

    /// Parse one attribute report into canonical state fields.
    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta);

    /// Cluster-specific command received from the device (Tuya DP frames,
    /// IAS notifications, button events).
    fn cluster_command(&self, _tsn: u8, _command_id: u8, _payload: &[u8], _delta: &mut StateDelta) {}

    /// Whether configure should bind and install reporting at all.
    fn configurable(&self) -> bool {
        true
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        Vec::new()
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        Vec::new()
    }

    /// Encode a control verb, if this handler owns it.
    fn encode_command(&self, _verb: &str, _value: Option<&Value>) -> Option<ZclRequest> {
        None
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        Vec::new()
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        Vec::new()
    }
}

// ── Registry ────────────────────────────────────────────

pub type HandlerCtor = fn(HandlerContext) -> Box<dyn ClusterHandler>;

/// Process-wide cluster-id -> constructor map, populated once at start.
pub struct HandlerRegistry {
    map: HashMap<u16, HandlerCtor>,
}

impl HandlerRegistry {
    pub fn standard() -> Self {
        let mut map: HashMap<u16, HandlerCtor> = HashMap::new();
        map.insert(cid::BASIC, general::BasicHandler::create);
        map.insert(cid::IDENTIFY, general::IdentifyHandler::create);
        map.insert(cid::ON_OFF, general::OnOffHandler::create);
        map.insert(cid::LEVEL_CONTROL, general::LevelControlHandler::create);
        map.insert(cid::COLOR_CONTROL, lighting::ColorControlHandler::create);
        map.insert(cid::BALLAST, lighting::BallastHandler::create);
        map.insert(cid::POWER_CONFIGURATION, sensors::PowerConfigurationHandler::create);
        map.insert(cid::DEVICE_TEMPERATURE, sensors::DeviceTemperatureHandler::create);
        map.insert(cid::ILLUMINANCE_MEASUREMENT, sensors::IlluminanceHandler::create);
        map.insert(cid::TEMPERATURE_MEASUREMENT, sensors::TemperatureHandler::create);
        map.insert(cid::PRESSURE_MEASUREMENT, sensors::PressureHandler::create);
        map.insert(cid::RELATIVE_HUMIDITY, sensors::HumidityHandler::create);
        map.insert(cid::OCCUPANCY_SENSING, sensors::OccupancyHandler::create);
        map.insert(cid::CO2_MEASUREMENT, sensors::Co2Handler::create);
        map.insert(cid::PM25_MEASUREMENT, sensors::Pm25Handler::create);
        map.insert(cid::IAS_ZONE, security::IasZoneHandler::create);
        map.insert(cid::THERMOSTAT, hvac::ThermostatHandler::create);
        map.insert(cid::FAN_CONTROL, hvac::FanControlHandler::create);
        map.insert(cid::ELECTRICAL_MEASUREMENT, power::ElectricalMeasurementHandler::create);
        map.insert(cid::METERING, power::MeteringHandler::create);
        map.insert(cid::WINDOW_COVERING, blinds::WindowCoveringHandler::create);
        map.insert(cid::TUYA_MANUFACTURER, tuya::TuyaHandler::create);
        map.insert(cid::AQARA_MANUFACTURER, aqara::AqaraHandler::create);
        map.insert(cid::MULTISTATE_INPUT, aqara::MultistateInputHandler::create);
        map.insert(cid::DIAGNOSTICS, diagnostics::DiagnosticsHandler::create);
        tracing::debug!("Registered {} cluster handlers", map.len());
        Self { map }
    }

    pub fn lookup(&self, cluster: u16) -> Option<HandlerCtor> {
        self.map.get(&cluster).copied()
    }

    /// Instantiate the registered handler, or the generic fallback.
    pub fn create(&self, ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        match self.lookup(ctx.cluster) {
            Some(ctor) => ctor(ctx),
            None => generic::GenericHandler::create(ctx),
        }
    }

    pub fn supported_clusters(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

// ── Shared parse helpers ────────────────────────────────

pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::Bool(b) => Some(*b as u64),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn value_to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().map(|v| v != 0),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "on" | "1" => Some(true),
            "false" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Round to two decimals the way sensor values are published.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
pub fn test_context(cluster: u16) -> HandlerContext {
    use crate::radio::EndpointDescriptor;
    HandlerContext {
        ieee: Ieee::parse("00:11:22:33:44:55:66:77").unwrap(),
        endpoint: 1,
        cluster,
        manufacturer: None,
        model: None,
        capabilities: Capabilities::infer(
            &[EndpointDescriptor {
                id: 1,
                profile: 0x0104,
                input_clusters: vec![cluster],
                output_clusters: vec![],
            }],
            None,
            None,
        ),
        suffix_endpoint: false,
        overrides: None,
    }
}
