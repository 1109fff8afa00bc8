//! HVAC clusters: Thermostat (TRVs, boiler controls) and Fan Control.
//! Setpoints are 0.01 degree units on the wire.

use serde_json::{json, Value};

use super::{
    round2, value_to_f64, value_to_u64, ClusterHandler, CommandDescriptor, DiscoveryEntity,
    HandlerContext, PollAttribute, ReportConfig, StateDelta, ZclRequest,
};

// ── Thermostat (0x0201) ─────────────────────────────────

const ATTR_LOCAL_TEMPERATURE: u16 = 0x0000;
const ATTR_PI_HEATING_DEMAND: u16 = 0x0008;
const ATTR_OCCUPIED_HEATING_SETPOINT: u16 = 0x0012;
const ATTR_SYSTEM_MODE: u16 = 0x001C;
const ATTR_RUNNING_STATE: u16 = 0x0029;

const ZCL_TYPE_I16: u8 = 0x29;
const ZCL_TYPE_ENUM8: u8 = 0x30;

fn system_mode_name(v: u64) -> &'static str {
    match v {
        0x00 => "off",
        0x01 => "auto",
        0x03 => "cool",
        0x04 => "heat",
        0x05 => "emergency_heat",
        0x06 => "precooling",
        0x07 => "fan_only",
        0x08 => "dry",
        0x09 => "sleep",
        _ => "unknown",
    }
}

fn system_mode_value(name: &str) -> Option<u8> {
    match name {
        "off" => Some(0x00),
        "auto" => Some(0x01),
        "cool" => Some(0x03),
        "heat" => Some(0x04),
        "emergency_heat" => Some(0x05),
        "fan_only" => Some(0x07),
        "dry" => Some(0x08),
        _ => None,
    }
}

fn running_state_name(bits: u64) -> &'static str {
    if bits & 0x0001 != 0 {
        "heat"
    } else if bits & 0x0002 != 0 {
        "cool"
    } else if bits & 0x0004 != 0 {
        "fan"
    } else {
        "idle"
    }
}

pub struct ThermostatHandler {
    ctx: HandlerContext,
}

impl ThermostatHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for ThermostatHandler {
    fn name(&self) -> &'static str {
        "thermostat"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            ATTR_LOCAL_TEMPERATURE => {
                if let Some(raw) = value_to_f64(value) {
                    delta.insert("local_temperature".into(), json!(round2(raw / 100.0)));
                }
            }
            ATTR_OCCUPIED_HEATING_SETPOINT => {
                if let Some(raw) = value_to_f64(value) {
                    delta.insert("occupied_heating_setpoint".into(), json!(round2(raw / 100.0)));
                }
            }
            ATTR_PI_HEATING_DEMAND => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("pi_heating_demand".into(), json!(raw.min(100)));
                }
            }
            ATTR_SYSTEM_MODE => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("system_mode".into(), json!(system_mode_name(raw)));
                }
            }
            ATTR_RUNNING_STATE => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("running_state".into(), json!(running_state_name(raw)));
                }
            }
            _ => {}
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![
            ReportConfig { attr: ATTR_LOCAL_TEMPERATURE, min_s: 30, max_s: 300, change: 50 },
            ReportConfig { attr: ATTR_OCCUPIED_HEATING_SETPOINT, min_s: 30, max_s: 300, change: 50 },
            ReportConfig { attr: ATTR_PI_HEATING_DEMAND, min_s: 30, max_s: 300, change: 1 },
            ReportConfig { attr: ATTR_SYSTEM_MODE, min_s: 30, max_s: 300, change: 1 },
        ]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![
            PollAttribute { attr: ATTR_LOCAL_TEMPERATURE, name: "local_temperature".into() },
            PollAttribute { attr: ATTR_OCCUPIED_HEATING_SETPOINT, name: "occupied_heating_setpoint".into() },
            PollAttribute { attr: ATTR_PI_HEATING_DEMAND, name: "pi_heating_demand".into() },
            PollAttribute { attr: ATTR_SYSTEM_MODE, name: "system_mode".into() },
        ]
    }

    fn encode_command(&self, verb: &str, value: Option<&Value>) -> Option<ZclRequest> {
        match verb {
            "temperature" => {
                let degrees = value.and_then(value_to_f64)?;
                let raw = (degrees * 100.0).round() as i16;
                Some(ZclRequest::WriteAttribute {
                    attr: ATTR_OCCUPIED_HEATING_SETPOINT,
                    data_type: ZCL_TYPE_I16,
                    value: raw.to_le_bytes().to_vec(),
                })
            }
            "system_mode" => {
                let name = value?.as_str()?;
                let mode = system_mode_value(name)?;
                Some(ZclRequest::WriteAttribute {
                    attr: ATTR_SYSTEM_MODE,
                    data_type: ZCL_TYPE_ENUM8,
                    value: vec![mode],
                })
            }
            _ => None,
        }
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor {
                command: "temperature".into(),
                value_kind: Some("celsius"),
                description: "Set heating setpoint".into(),
            },
            CommandDescriptor {
                command: "system_mode".into(),
                value_kind: Some("mode"),
                description: "Set system mode (off/auto/heat/cool)".into(),
            },
        ]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![DiscoveryEntity {
            component: "climate",
            object_id: "climate".into(),
            config: json!({
                "name": "Thermostat",
                "modes": ["off", "auto", "heat"],
                "current_temperature_template": "{{ value_json.local_temperature }}",
                "temperature_state_template": "{{ value_json.occupied_heating_setpoint }}",
                "mode_state_template": "{{ value_json.system_mode }}",
                "min_temp": 5,
                "max_temp": 30,
                "temp_step": 0.5,
            }),
        }]
    }
}

// ── Fan Control (0x0202) ────────────────────────────────

const ATTR_FAN_MODE: u16 = 0x0000;

fn fan_mode_name(v: u64) -> &'static str {
    match v {
        0 => "off",
        1 => "low",
        2 => "medium",
        3 => "high",
        4 => "on",
        5 => "auto",
        6 => "smart",
        _ => "unknown",
    }
}

pub struct FanControlHandler {
    ctx: HandlerContext,
}

impl FanControlHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for FanControlHandler {
    fn name(&self) -> &'static str {
        "fan_control"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == ATTR_FAN_MODE {
            if let Some(raw) = value_to_u64(value) {
                delta.insert("fan_mode".into(), json!(fan_mode_name(raw)));
            }
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: ATTR_FAN_MODE, min_s: 30, max_s: 300, change: 1 }]
    }

    fn encode_command(&self, verb: &str, value: Option<&Value>) -> Option<ZclRequest> {
        if verb != "fan_mode" {
            return None;
        }
        let mode = match value?.as_str()? {
            "off" => 0u8,
            "low" => 1,
            "medium" => 2,
            "high" => 3,
            "on" => 4,
            "auto" => 5,
            _ => return None,
        };
        Some(ZclRequest::WriteAttribute { attr: ATTR_FAN_MODE, data_type: ZCL_TYPE_ENUM8, value: vec![mode] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::cluster_id as cid;
    use crate::handlers::test_context;

    #[test]
    fn local_temperature_scales() {
        let handler = ThermostatHandler::create(test_context(cid::THERMOSTAT));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_LOCAL_TEMPERATURE, &json!(2050), &mut delta);
        assert_eq!(delta["local_temperature"], json!(20.5));
    }

    #[test]
    fn setpoint_write_uses_centi_degrees() {
        let handler = ThermostatHandler::create(test_context(cid::THERMOSTAT));
        let request = handler.encode_command("temperature", Some(&json!(21.5))).unwrap();
        match request {
            ZclRequest::WriteAttribute { attr, data_type, value } => {
                assert_eq!(attr, ATTR_OCCUPIED_HEATING_SETPOINT);
                assert_eq!(data_type, ZCL_TYPE_I16);
                assert_eq!(i16::from_le_bytes([value[0], value[1]]), 2150);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reporting_uses_half_degree_change() {
        let handler = ThermostatHandler::create(test_context(cid::THERMOSTAT));
        let config = handler.report_config();
        assert!(config.iter().all(|c| c.min_s == 30 && c.max_s == 300));
        assert_eq!(config[0].change, 50);
    }

    #[test]
    fn running_state_decodes_bits() {
        let handler = ThermostatHandler::create(test_context(cid::THERMOSTAT));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_RUNNING_STATE, &json!(1), &mut delta);
        assert_eq!(delta["running_state"], json!("heat"));
        handler.attribute_updated(ATTR_RUNNING_STATE, &json!(0), &mut delta);
        assert_eq!(delta["running_state"], json!("idle"));
    }

    #[test]
    fn fan_mode_round_trip() {
        let handler = FanControlHandler::create(test_context(cid::FAN_CONTROL));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_FAN_MODE, &json!(5), &mut delta);
        assert_eq!(delta["fan_mode"], json!("auto"));
        assert!(handler.encode_command("fan_mode", Some(&json!("high"))).is_some());
    }
}
