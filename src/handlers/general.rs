//! General clusters: Basic, Identify, On/Off, Level Control.

use serde_json::{json, Value};

use super::{
    value_to_bool, value_to_f64, value_to_u64, ClusterHandler, CommandDescriptor,
    DiscoveryEntity, HandlerContext, PollAttribute, ReportConfig, StateDelta, ZclRequest,
};
use crate::capabilities::Capability;

// ── Basic (0x0000) ──────────────────────────────────────

pub struct BasicHandler {
    ctx: HandlerContext,
}

const BASIC_MANUFACTURER: u16 = 0x0004;
const BASIC_MODEL: u16 = 0x0005;
const BASIC_POWER_SOURCE: u16 = 0x0007;
const BASIC_SW_BUILD_ID: u16 = 0x4000;

impl BasicHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

fn power_source_name(v: u64) -> &'static str {
    match v {
        1 | 2 => "Mains",
        3 => "Battery",
        4 => "DC Source",
        _ => "Unknown",
    }
}

impl ClusterHandler for BasicHandler {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn configurable(&self) -> bool {
        false
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            BASIC_MANUFACTURER => {
                if let Some(s) = value.as_str() {
                    delta.insert("manufacturer".into(), json!(s.trim_end_matches('\0')));
                }
            }
            BASIC_MODEL => {
                if let Some(s) = value.as_str() {
                    delta.insert("model".into(), json!(s.trim_end_matches('\0')));
                }
            }
            BASIC_POWER_SOURCE => {
                if let Some(v) = value_to_u64(value) {
                    delta.insert("power_source".into(), json!(power_source_name(v)));
                    delta.insert("power_source_raw".into(), json!(v));
                }
            }
            BASIC_SW_BUILD_ID => {
                if let Some(s) = value.as_str() {
                    delta.insert("sw_version".into(), json!(s));
                }
            }
            _ => {}
        }
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![
            PollAttribute { attr: BASIC_POWER_SOURCE, name: "power_source".into() },
            PollAttribute { attr: BASIC_SW_BUILD_ID, name: "sw_version".into() },
        ]
    }
}

// ── Identify (0x0003) ───────────────────────────────────

pub struct IdentifyHandler {
    ctx: HandlerContext,
}

impl IdentifyHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for IdentifyHandler {
    fn name(&self) -> &'static str {
        "identify"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn configurable(&self) -> bool {
        false
    }

    fn attribute_updated(&self, _attr_id: u16, _value: &Value, _delta: &mut StateDelta) {}

    fn encode_command(&self, verb: &str, value: Option<&Value>) -> Option<ZclRequest> {
        if verb != "identify" {
            return None;
        }
        let seconds = value.and_then(value_to_u64).unwrap_or(5) as u16;
        Some(ZclRequest::Command { command_id: 0x00, args: seconds.to_le_bytes().to_vec() })
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![CommandDescriptor {
            command: "identify".into(),
            value_kind: Some("seconds"),
            description: "Blink the device for identification".into(),
        }]
    }
}

// ── On/Off (0x0006) ─────────────────────────────────────

const ONOFF_STATE: u16 = 0x0000;
const ONOFF_ON_TIME: u16 = 0x4001;

const CMD_OFF: u8 = 0x00;
const CMD_ON: u8 = 0x01;
const CMD_TOGGLE: u8 = 0x02;

pub struct OnOffHandler {
    ctx: HandlerContext,
}

impl OnOffHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for OnOffHandler {
    fn name(&self) -> &'static str {
        "on_off"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            ONOFF_STATE => {
                let Some(on) = value_to_bool(value) else { return };
                let state = if on { "ON" } else { "OFF" };
                delta.insert("state".into(), json!(state));
                delta.insert("on".into(), json!(on));
                if self.ctx.suffix_endpoint {
                    delta.insert(self.ctx.field("state"), json!(state));
                    delta.insert(self.ctx.field("on"), json!(on));
                }
            }
            ONOFF_ON_TIME => {
                if let Some(v) = value_to_u64(value) {
                    delta.insert("on_with_timed_off".into(), json!(v));
                }
            }
            _ => {}
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: ONOFF_STATE, min_s: 0, max_s: 300, change: 1 }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: ONOFF_STATE, name: self.ctx.field("state") }]
    }

    fn encode_command(&self, verb: &str, _value: Option<&Value>) -> Option<ZclRequest> {
        let command_id = match verb {
            "on" => CMD_ON,
            "off" => CMD_OFF,
            "toggle" => CMD_TOGGLE,
            _ => return None,
        };
        Some(ZclRequest::Command { command_id, args: Vec::new() })
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor { command: "on".into(), value_kind: None, description: "Turn on".into() },
            CommandDescriptor { command: "off".into(), value_kind: None, description: "Turn off".into() },
            CommandDescriptor { command: "toggle".into(), value_kind: None, description: "Toggle".into() },
        ]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        // Lights get their entity from the Level handler so brightness and
        // state live on one object.
        if self.ctx.capabilities.has(Capability::Light)
            || self.ctx.capabilities.has(Capability::Cover)
        {
            return Vec::new();
        }
        let object_id = self.ctx.field("switch");
        let state_field = self.ctx.field("state");
        vec![DiscoveryEntity {
            component: "switch",
            object_id,
            config: json!({
                "name": if self.ctx.suffix_endpoint {
                    format!("Switch {}", self.ctx.endpoint)
                } else {
                    "Switch".to_string()
                },
                "value_template": format!("{{{{ value_json.{state_field} }}}}"),
                "state_on": "ON",
                "state_off": "OFF",
            }),
        }]
    }
}

// ── Level Control (0x0008) ──────────────────────────────

const LEVEL_CURRENT: u16 = 0x0000;

const CMD_MOVE_TO_LEVEL_WITH_ON_OFF: u8 = 0x04;

pub struct LevelControlHandler {
    ctx: HandlerContext,
}

impl LevelControlHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

/// UI percent (0-100) to raw ZCL level (0-254).
pub fn pct_to_raw(pct: f64) -> u8 {
    (pct * 2.54).round().clamp(0.0, 254.0) as u8
}

/// Raw ZCL level (0-254) to UI percent.
pub fn raw_to_pct(raw: u8) -> u8 {
    ((raw as f64) / 2.54).round().clamp(0.0, 100.0) as u8
}

impl ClusterHandler for LevelControlHandler {
    fn name(&self) -> &'static str {
        "level_control"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id != LEVEL_CURRENT {
            return;
        }
        let Some(raw) = value_to_u64(value) else { return };
        let raw = raw.min(254) as u8;
        // Canonical state carries both representations.
        delta.insert("brightness".into(), json!(raw));
        delta.insert("level".into(), json!(raw_to_pct(raw)));
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: LEVEL_CURRENT, min_s: 1, max_s: 300, change: 1 }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: LEVEL_CURRENT, name: "brightness".into() }]
    }

    fn encode_command(&self, verb: &str, value: Option<&Value>) -> Option<ZclRequest> {
        match verb {
            "brightness" | "level" => {
                let pct = value.and_then(value_to_f64)?.clamp(0.0, 100.0);
                let raw = pct_to_raw(pct);
                let transition: u16 = 1; // tenths of a second
                let mut args = vec![raw];
                args.extend_from_slice(&transition.to_le_bytes());
                Some(ZclRequest::Command { command_id: CMD_MOVE_TO_LEVEL_WITH_ON_OFF, args })
            }
            // Off with a transition rides the level cluster: fade to zero.
            "off_with_transition" => {
                let seconds = value.and_then(value_to_f64).unwrap_or(0.0).max(0.0);
                let transition = (seconds * 10.0).round() as u16;
                let mut args = vec![0u8];
                args.extend_from_slice(&transition.to_le_bytes());
                Some(ZclRequest::Command { command_id: CMD_MOVE_TO_LEVEL_WITH_ON_OFF, args })
            }
            _ => None,
        }
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![CommandDescriptor {
            command: "brightness".into(),
            value_kind: Some("percent"),
            description: "Set brightness 0-100%".into(),
        }]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        if !self.ctx.capabilities.has(Capability::Light) {
            return Vec::new();
        }
        let object_id = self.ctx.field("light");
        let state_field = self.ctx.field("state");
        let mut config = json!({
            "name": if self.ctx.suffix_endpoint {
                format!("Light {}", self.ctx.endpoint)
            } else {
                "Light".to_string()
            },
            "value_template": format!("{{{{ value_json.{state_field} }}}}"),
            "state_value_template": format!("{{{{ value_json.{state_field} }}}}"),
            "brightness": true,
            "brightness_scale": 254,
            "brightness_state_topic": "STATE_TOPIC_PLACEHOLDER",
            "brightness_value_template": "{{ value_json.brightness }}",
        });
        if self.ctx.capabilities.has(Capability::ColorControl) {
            config["color_mode"] = json!(true);
            config["color_temp_state_topic"] = json!("STATE_TOPIC_PLACEHOLDER");
            config["color_temp_value_template"] = json!("{{ value_json.color_temp }}");
        }
        vec![DiscoveryEntity { component: "light", object_id, config }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_context;
    use crate::capabilities::cluster_id as cid;

    #[test]
    fn onoff_report_produces_state_pair() {
        let handler = OnOffHandler::create(test_context(cid::ON_OFF));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ONOFF_STATE, &json!(1), &mut delta);
        assert_eq!(delta["state"], json!("ON"));
        assert_eq!(delta["on"], json!(true));
        assert!(!delta.contains_key("state_1"));
    }

    #[test]
    fn onoff_suffixes_on_multi_switch() {
        let mut ctx = test_context(cid::ON_OFF);
        ctx.suffix_endpoint = true;
        ctx.endpoint = 2;
        let handler = OnOffHandler::create(ctx);
        let mut delta = StateDelta::new();
        handler.attribute_updated(ONOFF_STATE, &json!(0), &mut delta);
        assert_eq!(delta["state"], json!("OFF"));
        assert_eq!(delta["state_2"], json!("OFF"));
        assert_eq!(delta["on_2"], json!(false));
    }

    #[test]
    fn onoff_encodes_verbs() {
        let handler = OnOffHandler::create(test_context(cid::ON_OFF));
        assert_eq!(
            handler.encode_command("on", None),
            Some(ZclRequest::Command { command_id: 0x01, args: vec![] })
        );
        assert_eq!(
            handler.encode_command("off", None),
            Some(ZclRequest::Command { command_id: 0x00, args: vec![] })
        );
        assert!(handler.encode_command("brightness", None).is_none());
    }

    #[test]
    fn level_report_carries_both_domains() {
        let handler = LevelControlHandler::create(test_context(cid::LEVEL_CONTROL));
        let mut delta = StateDelta::new();
        handler.attribute_updated(LEVEL_CURRENT, &json!(254), &mut delta);
        assert_eq!(delta["brightness"], json!(254));
        assert_eq!(delta["level"], json!(100));
    }

    #[test]
    fn brightness_percent_mapping_clamps() {
        assert_eq!(pct_to_raw(100.0), 254);
        assert_eq!(pct_to_raw(0.0), 0);
        assert_eq!(pct_to_raw(50.0), 127);
        assert_eq!(raw_to_pct(254), 100);
        assert_eq!(raw_to_pct(0), 0);
    }

    #[test]
    fn level_encodes_brightness_command() {
        let handler = LevelControlHandler::create(test_context(cid::LEVEL_CONTROL));
        let request = handler.encode_command("brightness", Some(&json!(100))).unwrap();
        match request {
            ZclRequest::Command { command_id, args } => {
                assert_eq!(command_id, CMD_MOVE_TO_LEVEL_WITH_ON_OFF);
                assert_eq!(args[0], 254);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn basic_parses_identity_attributes() {
        let handler = BasicHandler::create(test_context(cid::BASIC));
        let mut delta = StateDelta::new();
        handler.attribute_updated(BASIC_MANUFACTURER, &json!("IKEA of Sweden"), &mut delta);
        handler.attribute_updated(BASIC_POWER_SOURCE, &json!(3), &mut delta);
        assert_eq!(delta["manufacturer"], json!("IKEA of Sweden"));
        assert_eq!(delta["power_source"], json!("Battery"));
    }
}
