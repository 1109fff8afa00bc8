//! Lighting clusters: Color Control and Ballast.

use serde_json::{json, Value};

use super::{
    round2, value_to_f64, value_to_u64, ClusterHandler, CommandDescriptor, HandlerContext,
    PollAttribute, ReportConfig, StateDelta, ZclRequest,
};

// ── Color Control (0x0300) ──────────────────────────────

const ATTR_CURRENT_HUE: u16 = 0x0000;
const ATTR_CURRENT_SATURATION: u16 = 0x0001;
const ATTR_CURRENT_X: u16 = 0x0003;
const ATTR_CURRENT_Y: u16 = 0x0004;
const ATTR_COLOR_TEMPERATURE: u16 = 0x0007;
const ATTR_COLOR_MODE: u16 = 0x0008;

const CMD_MOVE_TO_HUE_AND_SATURATION: u8 = 0x06;
const CMD_MOVE_TO_COLOR: u8 = 0x07;
const CMD_MOVE_TO_COLOR_TEMP: u8 = 0x0A;

/// Colour temperature conversion: `mireds = 1_000_000 / K`, rounded.
pub fn kelvin_to_mireds(kelvin: u32) -> u16 {
    (1_000_000.0 / kelvin as f64).round() as u16
}

pub fn mireds_to_kelvin(mireds: u16) -> u32 {
    if mireds == 0 {
        return 0;
    }
    (1_000_000.0 / mireds as f64).round() as u32
}

pub struct ColorControlHandler {
    ctx: HandlerContext,
}

impl ColorControlHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for ColorControlHandler {
    fn name(&self) -> &'static str {
        "color_control"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            ATTR_COLOR_TEMPERATURE => {
                if let Some(mireds) = value_to_u64(value) {
                    let mireds = mireds.min(u16::MAX as u64) as u16;
                    delta.insert("color_temp".into(), json!(mireds));
                    delta.insert("color_temp_kelvin".into(), json!(mireds_to_kelvin(mireds)));
                }
            }
            ATTR_CURRENT_X => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("color_x".into(), json!(round2(raw as f64 / 65535.0)));
                }
            }
            ATTR_CURRENT_Y => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("color_y".into(), json!(round2(raw as f64 / 65535.0)));
                }
            }
            ATTR_CURRENT_HUE => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("hue".into(), json!(raw));
                }
            }
            ATTR_CURRENT_SATURATION => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("saturation".into(), json!(raw));
                }
            }
            ATTR_COLOR_MODE => {
                if let Some(raw) = value_to_u64(value) {
                    let mode = match raw {
                        0 => "hs",
                        1 => "xy",
                        2 => "color_temp",
                        _ => "unknown",
                    };
                    delta.insert("color_mode".into(), json!(mode));
                }
            }
            _ => {}
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![
            ReportConfig { attr: ATTR_COLOR_TEMPERATURE, min_s: 1, max_s: 300, change: 1 },
            ReportConfig { attr: ATTR_CURRENT_X, min_s: 1, max_s: 300, change: 10 },
            ReportConfig { attr: ATTR_CURRENT_Y, min_s: 1, max_s: 300, change: 10 },
        ]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: ATTR_COLOR_TEMPERATURE, name: "color_temp".into() }]
    }

    fn encode_command(&self, verb: &str, value: Option<&Value>) -> Option<ZclRequest> {
        let transition: u16 = 1;
        match verb {
            // Value is Kelvin; the wire wants mireds.
            "color_temp" => {
                let kelvin = value.and_then(value_to_u64)? as u32;
                if kelvin == 0 {
                    return None;
                }
                let mireds = kelvin_to_mireds(kelvin);
                let mut args = mireds.to_le_bytes().to_vec();
                args.extend_from_slice(&transition.to_le_bytes());
                Some(ZclRequest::Command { command_id: CMD_MOVE_TO_COLOR_TEMP, args })
            }
            "xy_color" => {
                let obj = value?.as_object()?;
                let x = value_to_f64(obj.get("x")?)?;
                let y = value_to_f64(obj.get("y")?)?;
                let xi = (x.clamp(0.0, 1.0) * 65535.0).round() as u16;
                let yi = (y.clamp(0.0, 1.0) * 65535.0).round() as u16;
                let mut args = xi.to_le_bytes().to_vec();
                args.extend_from_slice(&yi.to_le_bytes());
                args.extend_from_slice(&transition.to_le_bytes());
                Some(ZclRequest::Command { command_id: CMD_MOVE_TO_COLOR, args })
            }
            "hue_sat" => {
                let obj = value?.as_object()?;
                let hue = value_to_u64(obj.get("hue")?)?.min(254) as u8;
                let sat = value_to_u64(obj.get("saturation")?)?.min(254) as u8;
                let mut args = vec![hue, sat];
                args.extend_from_slice(&transition.to_le_bytes());
                Some(ZclRequest::Command { command_id: CMD_MOVE_TO_HUE_AND_SATURATION, args })
            }
            _ => None,
        }
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor {
                command: "color_temp".into(),
                value_kind: Some("kelvin"),
                description: "Set colour temperature in Kelvin".into(),
            },
            CommandDescriptor {
                command: "xy_color".into(),
                value_kind: Some("xy"),
                description: "Set CIE xy colour".into(),
            },
        ]
    }
}

// ── Ballast (0x0301) ────────────────────────────────────

const ATTR_MIN_LEVEL: u16 = 0x0010;
const ATTR_MAX_LEVEL: u16 = 0x0011;

pub struct BallastHandler {
    ctx: HandlerContext,
}

impl BallastHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for BallastHandler {
    fn name(&self) -> &'static str {
        "ballast"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn configurable(&self) -> bool {
        false
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            ATTR_MIN_LEVEL => {
                if let Some(v) = value_to_u64(value) {
                    delta.insert("ballast_min_level_raw".into(), json!(v));
                }
            }
            ATTR_MAX_LEVEL => {
                if let Some(v) = value_to_u64(value) {
                    delta.insert("ballast_max_level_raw".into(), json!(v));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::cluster_id as cid;
    use crate::handlers::test_context;

    #[test]
    fn mireds_kelvin_round() {
        assert_eq!(kelvin_to_mireds(4000), 250);
        assert_eq!(mireds_to_kelvin(250), 4000);
        assert_eq!(kelvin_to_mireds(2700), 370);
        assert_eq!(kelvin_to_mireds(6500), 154);
    }

    #[test]
    fn color_temp_report_carries_both_units() {
        let handler = ColorControlHandler::create(test_context(cid::COLOR_CONTROL));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_COLOR_TEMPERATURE, &json!(250), &mut delta);
        assert_eq!(delta["color_temp"], json!(250));
        assert_eq!(delta["color_temp_kelvin"], json!(4000));
    }

    #[test]
    fn color_temp_command_converts_kelvin_to_mireds() {
        let handler = ColorControlHandler::create(test_context(cid::COLOR_CONTROL));
        let request = handler.encode_command("color_temp", Some(&json!(4000))).unwrap();
        match request {
            ZclRequest::Command { command_id, args } => {
                assert_eq!(command_id, CMD_MOVE_TO_COLOR_TEMP);
                assert_eq!(u16::from_le_bytes([args[0], args[1]]), 250);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn xy_report_normalises_to_unit_range() {
        let handler = ColorControlHandler::create(test_context(cid::COLOR_CONTROL));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_CURRENT_X, &json!(32768), &mut delta);
        let x = delta["color_x"].as_f64().unwrap();
        assert!((x - 0.5).abs() < 0.01);
    }
}
