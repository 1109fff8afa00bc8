//! Tuya manufacturer cluster (0xEF00): the data-point tunnel.
//!
//! Everything a TS0601-class device says arrives as DP frames inside
//! cluster commands. The DP tables are configuration data keyed by
//! model/manufacturer; firmware revisions that move DPs around are a
//! table edit, not code.

use serde_json::{json, Value};

use super::{
    round2, value_to_f64, ClusterHandler, CommandDescriptor, DiscoveryEntity, HandlerContext,
    PollAttribute, ReportConfig, StateDelta, ZclRequest,
};
use crate::capabilities::Capability;

pub const TUYA_SET_DATA: u8 = 0x00;
pub const TUYA_GET_DATA: u8 = 0x01;
pub const TUYA_SET_DATA_RESPONSE: u8 = 0x02;
pub const TUYA_ACTIVE_STATUS_REPORT: u8 = 0x06;

// DP payload data types.
pub const DP_TYPE_RAW: u8 = 0x00;
pub const DP_TYPE_BOOL: u8 = 0x01;
pub const DP_TYPE_VALUE: u8 = 0x02;
pub const DP_TYPE_STRING: u8 = 0x03;
pub const DP_TYPE_ENUM: u8 = 0x04;
pub const DP_TYPE_BITMAP: u8 = 0x05;

// ── DP tables ───────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum DpConvert {
    /// Boolean mapped to two labels (true label first).
    Labels(&'static str, &'static str),
    /// Numeric with a scale divisor of one over the factor.
    Scaled(f64),
    /// Raw numeric.
    Plain,
    /// Radar state enum {none, presence, move, static, move_and_static}.
    RadarState,
    /// Enum value mapped through a table; unknown values print as digits.
    EnumMap(&'static [(u8, &'static str)]),
}

#[derive(Debug, Clone, Copy)]
pub struct TuyaDp {
    pub dp_id: u8,
    pub name: &'static str,
    pub convert: DpConvert,
    /// Wire type used when writing this DP.
    pub dp_type: u8,
}

const COVER_CONTROL: &[(u8, &'static str)] = &[(0, "open"), (1, "stop"), (2, "close")];
const COVER_WORK_STATE: &[(u8, &'static str)] = &[(0, "idle"), (1, "closing"), (2, "opening")];

pub const TUYA_COVER_DPS: &[TuyaDp] = &[
    TuyaDp { dp_id: 1, name: "control", convert: DpConvert::EnumMap(COVER_CONTROL), dp_type: DP_TYPE_ENUM },
    TuyaDp { dp_id: 2, name: "position", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 3, name: "position_report", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 5, name: "direction", convert: DpConvert::Labels("reverse", "forward"), dp_type: DP_TYPE_BOOL },
    TuyaDp { dp_id: 7, name: "work_state", convert: DpConvert::EnumMap(COVER_WORK_STATE), dp_type: DP_TYPE_ENUM },
    TuyaDp { dp_id: 101, name: "motor_mode", convert: DpConvert::Plain, dp_type: DP_TYPE_ENUM },
    TuyaDp { dp_id: 103, name: "invert_direction", convert: DpConvert::Labels("ON", "OFF"), dp_type: DP_TYPE_BOOL },
];

pub const TUYA_RADAR_DPS: &[TuyaDp] = &[
    TuyaDp { dp_id: 1, name: "radar_state", convert: DpConvert::RadarState, dp_type: DP_TYPE_ENUM },
    TuyaDp { dp_id: 2, name: "radar_sensitivity", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 102, name: "presence_sensitivity", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 105, name: "keep_time", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 3, name: "detection_distance_min", convert: DpConvert::Scaled(100.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 4, name: "detection_distance_max", convert: DpConvert::Scaled(100.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 9, name: "distance", convert: DpConvert::Scaled(100.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 104, name: "illuminance", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 10, name: "fading_time", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
];

/// ZY-M100-24GV2 (_TZE204_7gclukjs) moves presence, illuminance and
/// distance to different DPs than the generic radar firmware.
pub const TUYA_RADAR_ZY_M100_DPS: &[TuyaDp] = &[
    TuyaDp { dp_id: 104, name: "presence", convert: DpConvert::Labels("presence", "clear"), dp_type: DP_TYPE_BOOL },
    TuyaDp { dp_id: 1, name: "radar_state", convert: DpConvert::RadarState, dp_type: DP_TYPE_ENUM },
    TuyaDp { dp_id: 103, name: "illuminance", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 9, name: "distance", convert: DpConvert::Scaled(10.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 2, name: "radar_sensitivity", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 102, name: "presence_sensitivity", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 3, name: "detection_distance_min", convert: DpConvert::Scaled(100.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 4, name: "detection_distance_max", convert: DpConvert::Scaled(100.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 105, name: "keep_time", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 10, name: "fading_time", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
];

pub const TUYA_AIR_QUALITY_DPS: &[TuyaDp] = &[
    TuyaDp { dp_id: 1, name: "temperature", convert: DpConvert::Scaled(10.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 2, name: "humidity", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 18, name: "co2", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 19, name: "voc", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 20, name: "formaldehyde", convert: DpConvert::Scaled(100.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 21, name: "pm25", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 3, name: "pm25", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 4, name: "co2", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 5, name: "formaldehyde", convert: DpConvert::Scaled(100.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 22, name: "pm10", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
];

pub const TUYA_SWITCH_DPS: &[TuyaDp] = &[
    TuyaDp { dp_id: 1, name: "state_1", convert: DpConvert::Labels("ON", "OFF"), dp_type: DP_TYPE_BOOL },
    TuyaDp { dp_id: 2, name: "state_2", convert: DpConvert::Labels("ON", "OFF"), dp_type: DP_TYPE_BOOL },
    TuyaDp { dp_id: 3, name: "state_3", convert: DpConvert::Labels("ON", "OFF"), dp_type: DP_TYPE_BOOL },
    TuyaDp { dp_id: 4, name: "state_4", convert: DpConvert::Labels("ON", "OFF"), dp_type: DP_TYPE_BOOL },
    TuyaDp { dp_id: 9, name: "countdown_1", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 10, name: "countdown_2", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
];

pub const TUYA_VALVE_DPS: &[TuyaDp] = &[
    TuyaDp { dp_id: 1, name: "state", convert: DpConvert::Labels("ON", "OFF"), dp_type: DP_TYPE_BOOL },
    TuyaDp { dp_id: 2, name: "countdown", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 5, name: "flow", convert: DpConvert::Scaled(1000.0), dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 6, name: "battery", convert: DpConvert::Plain, dp_type: DP_TYPE_VALUE },
    TuyaDp { dp_id: 7, name: "temperature", convert: DpConvert::Scaled(10.0), dp_type: DP_TYPE_VALUE },
];

// ── Frame parsing ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DpReport {
    pub dp_id: u8,
    pub dp_type: u8,
    pub value: Value,
}

/// Parse the DP records out of a Tuya command payload: sequence number
/// (2 bytes), then repeated [dp_id, type, len_hi, len_lo, data...].
pub fn parse_dp_frames(payload: &[u8]) -> Vec<DpReport> {
    let mut reports = Vec::new();
    if payload.len() < 2 {
        return reports;
    }
    let mut offset = 2;
    while offset + 4 <= payload.len() {
        let dp_id = payload[offset];
        let dp_type = payload[offset + 1];
        let len = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]) as usize;
        offset += 4;
        if offset + len > payload.len() {
            break;
        }
        let data = &payload[offset..offset + len];
        offset += len;

        let value = match dp_type {
            DP_TYPE_BOOL => json!(data.first().copied().unwrap_or(0) != 0),
            DP_TYPE_VALUE => {
                let mut raw: i64 = 0;
                for b in data {
                    raw = (raw << 8) | *b as i64;
                }
                json!(raw)
            }
            DP_TYPE_ENUM | DP_TYPE_BITMAP => json!(data.first().copied().unwrap_or(0)),
            DP_TYPE_STRING => json!(String::from_utf8_lossy(data).to_string()),
            _ => json!(data.to_vec()),
        };
        reports.push(DpReport { dp_id, dp_type, value });
    }
    reports
}

/// Encode one DP write as a SET_DATA payload.
pub fn encode_dp_write(seq: u16, dp: &TuyaDp, value: &Value) -> Vec<u8> {
    let mut payload = seq.to_be_bytes().to_vec();
    payload.push(dp.dp_id);
    payload.push(dp.dp_type);
    match dp.dp_type {
        DP_TYPE_BOOL => {
            payload.extend_from_slice(&1u16.to_be_bytes());
            payload.push(value.as_bool().unwrap_or(false) as u8);
        }
        DP_TYPE_ENUM => {
            payload.extend_from_slice(&1u16.to_be_bytes());
            payload.push(value_to_f64(value).unwrap_or(0.0) as u8);
        }
        _ => {
            let raw = value_to_f64(value).unwrap_or(0.0) as i32;
            payload.extend_from_slice(&4u16.to_be_bytes());
            payload.extend_from_slice(&raw.to_be_bytes());
        }
    }
    payload
}

pub fn radar_state_name(value: &Value) -> String {
    if let Some(b) = value.as_bool() {
        return if b { "presence" } else { "clear" }.to_string();
    }
    match value.as_i64() {
        Some(0) => "none".to_string(),
        Some(1) => "presence".to_string(),
        Some(2) => "move".to_string(),
        Some(3) => "static".to_string(),
        Some(4) => "move_and_static".to_string(),
        Some(other) => other.to_string(),
        None => value.to_string(),
    }
}

// ── Handler ─────────────────────────────────────────────

pub struct TuyaHandler {
    ctx: HandlerContext,
    table: &'static [TuyaDp],
}

impl TuyaHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        let table = select_dp_table(&ctx);
        Box::new(Self { ctx, table })
    }

    fn dp(&self, dp_id: u8) -> Option<&'static TuyaDp> {
        self.table.iter().find(|d| d.dp_id == dp_id)
    }

    fn dp_by_name(&self, name: &str) -> Option<&'static TuyaDp> {
        self.table.iter().find(|d| d.name == name)
    }

    fn apply_report(&self, report: &DpReport, delta: &mut StateDelta) {
        match self.dp(report.dp_id) {
            Some(dp) => {
                let value = match dp.convert {
                    DpConvert::Labels(on, off) => {
                        let truthy = report.value.as_bool().unwrap_or_else(|| {
                            report.value.as_i64().map(|v| v != 0).unwrap_or(false)
                        });
                        json!(if truthy { on } else { off })
                    }
                    DpConvert::Scaled(divisor) => match value_to_f64(&report.value) {
                        Some(raw) => json!(round2(raw / divisor)),
                        None => report.value.clone(),
                    },
                    DpConvert::Plain => report.value.clone(),
                    DpConvert::RadarState => json!(radar_state_name(&report.value)),
                    DpConvert::EnumMap(map) => {
                        let raw = report.value.as_u64().unwrap_or(0) as u8;
                        match map.iter().find(|(k, _)| *k == raw) {
                            Some((_, name)) => json!(name),
                            None => json!(raw.to_string()),
                        }
                    }
                };
                delta.insert(dp.name.to_string(), value);

                // Radar presence doubles as occupancy so automations and
                // zones see a standard field.
                if dp.name == "radar_state" {
                    let occupied = !matches!(
                        delta.get("radar_state").and_then(|v| v.as_str()),
                        Some("none") | Some("clear") | None
                    );
                    delta.insert("presence".into(), json!(occupied));
                    delta.insert("occupancy".into(), json!(occupied));
                } else if dp.name == "presence" {
                    let occupied = delta.get("presence").and_then(|v| v.as_str()) == Some("presence");
                    delta.insert("occupancy".into(), json!(occupied));
                }
            }
            None => {
                // Unknown DP: keep it visible internally.
                delta.insert(format!("dp_{}", report.dp_id), report.value.clone());
            }
        }
    }
}

fn select_dp_table(ctx: &HandlerContext) -> &'static [TuyaDp] {
    let manufacturer = ctx.manufacturer.as_deref().unwrap_or_default().to_lowercase();
    let model = ctx.model.as_deref().unwrap_or_default().to_lowercase();

    if manufacturer.contains("_tze204_7gclukjs") {
        return TUYA_RADAR_ZY_M100_DPS;
    }
    if ctx.capabilities.has(Capability::Cover) {
        return TUYA_COVER_DPS;
    }
    if ctx.capabilities.has(Capability::RadarSensor) {
        return TUYA_RADAR_DPS;
    }
    if model.contains("air") || manufacturer.contains("_tze200_dwcarsat") {
        return TUYA_AIR_QUALITY_DPS;
    }
    if ctx.capabilities.has(Capability::MultiSwitch) || ctx.capabilities.has(Capability::Switch) {
        return TUYA_SWITCH_DPS;
    }
    TUYA_RADAR_DPS
}

impl ClusterHandler for TuyaHandler {
    fn name(&self) -> &'static str {
        "tuya"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn configurable(&self) -> bool {
        // DP devices push unsolicited; binding/reporting is meaningless.
        false
    }

    fn attribute_updated(&self, _attr_id: u16, _value: &Value, _delta: &mut StateDelta) {}

    fn cluster_command(&self, _tsn: u8, command_id: u8, payload: &[u8], delta: &mut StateDelta) {
        if !matches!(command_id, TUYA_GET_DATA | TUYA_SET_DATA_RESPONSE | TUYA_ACTIVE_STATUS_REPORT) {
            return;
        }
        for report in parse_dp_frames(payload) {
            self.apply_report(&report, delta);
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        Vec::new()
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        Vec::new()
    }

    fn encode_command(&self, verb: &str, value: Option<&Value>) -> Option<ZclRequest> {
        // Cover verbs tunnel through DP 1/2.
        let (dp, dp_value) = match verb {
            "open" => (self.dp_by_name("control")?, json!(0)),
            "stop" => (self.dp_by_name("control")?, json!(1)),
            "close" => (self.dp_by_name("control")?, json!(2)),
            "position" => (self.dp_by_name("position")?, value?.clone()),
            "on" | "off" => {
                let dp = self.dp_by_name("state").or_else(|| self.dp_by_name("state_1"))?;
                (dp, json!(verb == "on"))
            }
            _ => {
                let dp = self.dp_by_name(verb)?;
                (dp, value?.clone())
            }
        };
        let args = encode_dp_write(0, dp, &dp_value);
        Some(ZclRequest::Command { command_id: TUYA_SET_DATA, args })
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        if self.ctx.capabilities.has(Capability::Cover) {
            vec![
                CommandDescriptor { command: "open".into(), value_kind: None, description: "Open".into() },
                CommandDescriptor { command: "close".into(), value_kind: None, description: "Close".into() },
                CommandDescriptor { command: "stop".into(), value_kind: None, description: "Stop".into() },
                CommandDescriptor {
                    command: "position".into(),
                    value_kind: Some("percent"),
                    description: "Move to position".into(),
                },
            ]
        } else {
            Vec::new()
        }
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        if self.ctx.capabilities.has(Capability::RadarSensor)
            || self.ctx.capabilities.has(Capability::PresenceSensor)
        {
            vec![DiscoveryEntity {
                component: "binary_sensor",
                object_id: "presence".into(),
                config: json!({
                    "name": "Presence",
                    "device_class": "occupancy",
                    "value_template": "{{ value_json.occupancy }}",
                    "payload_on": true,
                    "payload_off": false,
                }),
            }]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{cluster_id as cid, Capabilities};
    use crate::handlers::test_context;
    use crate::radio::EndpointDescriptor;

    fn radar_context(manufacturer: &str) -> HandlerContext {
        let mut ctx = test_context(cid::TUYA_MANUFACTURER);
        ctx.manufacturer = Some(manufacturer.into());
        ctx.model = Some("TS0601".into());
        ctx.capabilities = Capabilities::infer(
            &[EndpointDescriptor {
                id: 1,
                profile: 0x0104,
                input_clusters: vec![cid::TUYA_MANUFACTURER],
                output_clusters: vec![],
            }],
            Some(manufacturer),
            Some("TS0601"),
        );
        ctx
    }

    fn dp_payload(dp_id: u8, dp_type: u8, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x00, 0x01, dp_id, dp_type];
        payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
        payload.extend_from_slice(data);
        payload
    }

    #[test]
    fn parses_value_and_bool_dps() {
        let mut payload = dp_payload(9, DP_TYPE_VALUE, &[0, 0, 0, 150]);
        payload.extend_from_slice(&dp_payload(104, DP_TYPE_BOOL, &[1])[2..]);
        let reports = parse_dp_frames(&payload);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], DpReport { dp_id: 9, dp_type: DP_TYPE_VALUE, value: json!(150) });
        assert_eq!(reports[1], DpReport { dp_id: 104, dp_type: DP_TYPE_BOOL, value: json!(true) });
    }

    #[test]
    fn truncated_frame_is_dropped() {
        let mut payload = dp_payload(9, DP_TYPE_VALUE, &[0, 0, 0, 150]);
        payload.extend_from_slice(&[1, DP_TYPE_VALUE, 0x00, 0x04, 0x00]); // short data
        assert_eq!(parse_dp_frames(&payload).len(), 1);
    }

    #[test]
    fn generic_radar_reports_presence_and_occupancy() {
        let handler = TuyaHandler::create(radar_context("_TZE200_ztc6ggyl"));
        let mut delta = StateDelta::new();
        handler.cluster_command(0, TUYA_ACTIVE_STATUS_REPORT, &dp_payload(1, DP_TYPE_ENUM, &[1]), &mut delta);
        assert_eq!(delta["radar_state"], json!("presence"));
        assert_eq!(delta["occupancy"], json!(true));

        handler.cluster_command(0, TUYA_ACTIVE_STATUS_REPORT, &dp_payload(1, DP_TYPE_ENUM, &[0]), &mut delta);
        assert_eq!(delta["radar_state"], json!("none"));
        assert_eq!(delta["occupancy"], json!(false));
    }

    #[test]
    fn zy_m100_distance_uses_decimeter_scale() {
        let handler = TuyaHandler::create(radar_context("_TZE204_7gclukjs"));
        let mut delta = StateDelta::new();
        handler.cluster_command(0, TUYA_GET_DATA, &dp_payload(9, DP_TYPE_VALUE, &[0, 0, 0, 25]), &mut delta);
        assert_eq!(delta["distance"], json!(2.5));
    }

    #[test]
    fn unknown_dp_keeps_raw_key() {
        let handler = TuyaHandler::create(radar_context("_TZE200_ztc6ggyl"));
        let mut delta = StateDelta::new();
        handler.cluster_command(0, TUYA_ACTIVE_STATUS_REPORT, &dp_payload(99, DP_TYPE_VALUE, &[0, 0, 0, 7]), &mut delta);
        assert_eq!(delta["dp_99"], json!(7));
    }

    #[test]
    fn radar_state_names() {
        assert_eq!(radar_state_name(&json!(true)), "presence");
        assert_eq!(radar_state_name(&json!(4)), "move_and_static");
        assert_eq!(radar_state_name(&json!(9)), "9");
    }

    #[test]
    fn dp_write_round_trips() {
        let dp = TUYA_COVER_DPS.iter().find(|d| d.name == "position").unwrap();
        let payload = encode_dp_write(1, dp, &json!(60));
        let reports = parse_dp_frames(&payload);
        assert_eq!(reports[0].dp_id, 2);
        assert_eq!(reports[0].value, json!(60));
    }
}
