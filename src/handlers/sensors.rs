//! Measurement and sensing clusters, tuned for battery life: illuminance
//! reports 5-300 s with a 100-unit change, temperature 30 s-1 h with a
//! 0.5 degree change.

use serde_json::{json, Value};

use super::{
    round2, value_to_f64, value_to_u64, ClusterHandler, DiscoveryEntity, HandlerContext,
    PollAttribute, ReportConfig, StateDelta,
};

const MEASURED_VALUE: u16 = 0x0000;

// Reporting defaults.
const ILLUM_MIN: u16 = 5;
const ILLUM_MAX: u16 = 300;
const ILLUM_CHANGE: u32 = 100;
const TEMP_MIN: u16 = 30;
const TEMP_MAX: u16 = 3600;
const TEMP_CHANGE: u32 = 50; // 0.5 degrees in raw centi-units

fn sensor_entity(object_id: &str, device_class: &str, unit: &str, field: &str) -> DiscoveryEntity {
    DiscoveryEntity {
        component: "sensor",
        object_id: object_id.to_string(),
        config: json!({
            "name": object_id.replace('_', " "),
            "device_class": device_class,
            "unit_of_measurement": unit,
            "state_class": "measurement",
            "value_template": format!("{{{{ value_json.{field} }}}}"),
        }),
    }
}

// ── Temperature Measurement (0x0402) ────────────────────

pub struct TemperatureHandler {
    ctx: HandlerContext,
}

impl TemperatureHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for TemperatureHandler {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == MEASURED_VALUE {
            if let Some(raw) = value_to_f64(value) {
                // Centi-degrees on the wire.
                delta.insert("temperature".into(), json!(round2(raw / 100.0)));
            }
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: MEASURED_VALUE, min_s: TEMP_MIN, max_s: TEMP_MAX, change: TEMP_CHANGE }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: MEASURED_VALUE, name: "temperature".into() }]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![sensor_entity("temperature", "temperature", "°C", "temperature")]
    }
}

// ── Relative Humidity (0x0405) ──────────────────────────

pub struct HumidityHandler {
    ctx: HandlerContext,
}

impl HumidityHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for HumidityHandler {
    fn name(&self) -> &'static str {
        "humidity"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == MEASURED_VALUE {
            if let Some(raw) = value_to_f64(value) {
                delta.insert("humidity".into(), json!(round2(raw / 100.0)));
            }
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: MEASURED_VALUE, min_s: TEMP_MIN, max_s: TEMP_MAX, change: 100 }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: MEASURED_VALUE, name: "humidity".into() }]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![sensor_entity("humidity", "humidity", "%", "humidity")]
    }
}

// ── Pressure Measurement (0x0403) ───────────────────────

pub struct PressureHandler {
    ctx: HandlerContext,
}

impl PressureHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for PressureHandler {
    fn name(&self) -> &'static str {
        "pressure"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == MEASURED_VALUE {
            if let Some(raw) = value_to_f64(value) {
                // Already hPa on the wire.
                delta.insert("pressure".into(), json!(round2(raw)));
            }
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: MEASURED_VALUE, min_s: TEMP_MIN, max_s: TEMP_MAX, change: 1 }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: MEASURED_VALUE, name: "pressure".into() }]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![sensor_entity("pressure", "pressure", "hPa", "pressure")]
    }
}

// ── Illuminance Measurement (0x0400) ────────────────────

pub struct IlluminanceHandler {
    ctx: HandlerContext,
}

impl IlluminanceHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for IlluminanceHandler {
    fn name(&self) -> &'static str {
        "illuminance"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == MEASURED_VALUE {
            if let Some(raw) = value_to_u64(value) {
                delta.insert("illuminance".into(), json!(raw));
                // MeasuredValue = 10000 * log10(lux) + 1
                let lux = if raw == 0 {
                    0.0
                } else {
                    10f64.powf((raw as f64 - 1.0) / 10000.0)
                };
                delta.insert("illuminance_lux".into(), json!(lux.round()));
            }
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: MEASURED_VALUE, min_s: ILLUM_MIN, max_s: ILLUM_MAX, change: ILLUM_CHANGE }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: MEASURED_VALUE, name: "illuminance".into() }]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![sensor_entity("illuminance", "illuminance", "lx", "illuminance_lux")]
    }
}

// ── Occupancy Sensing (0x0406) ──────────────────────────

pub struct OccupancyHandler {
    ctx: HandlerContext,
}

impl OccupancyHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for OccupancyHandler {
    fn name(&self) -> &'static str {
        "occupancy"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == MEASURED_VALUE {
            if let Some(raw) = value_to_u64(value) {
                delta.insert("occupancy".into(), json!(raw & 0x01 != 0));
            }
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: MEASURED_VALUE, min_s: 1, max_s: 600, change: 1 }]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![DiscoveryEntity {
            component: "binary_sensor",
            object_id: "occupancy".into(),
            config: json!({
                "name": "Occupancy",
                "device_class": "occupancy",
                "value_template": "{{ value_json.occupancy }}",
                "payload_on": true,
                "payload_off": false,
            }),
        }]
    }
}

// ── Power Configuration (0x0001) ────────────────────────

const ATTR_BATTERY_VOLTAGE: u16 = 0x0020;
const ATTR_BATTERY_PERCENTAGE: u16 = 0x0021;

pub struct PowerConfigurationHandler {
    ctx: HandlerContext,
}

impl PowerConfigurationHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for PowerConfigurationHandler {
    fn name(&self) -> &'static str {
        "power_configuration"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            ATTR_BATTERY_VOLTAGE => {
                if let Some(raw) = value_to_f64(value) {
                    delta.insert("battery_voltage".into(), json!(round2(raw / 10.0)));
                }
            }
            ATTR_BATTERY_PERCENTAGE => {
                if let Some(raw) = value_to_f64(value) {
                    // Half-percent units on the wire.
                    delta.insert("battery".into(), json!(round2((raw / 2.0).min(100.0))));
                }
            }
            _ => {}
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: ATTR_BATTERY_PERCENTAGE, min_s: 3600, max_s: 21600, change: 1 }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![
            PollAttribute { attr: ATTR_BATTERY_PERCENTAGE, name: "battery".into() },
            PollAttribute { attr: ATTR_BATTERY_VOLTAGE, name: "battery_voltage".into() },
        ]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![sensor_entity("battery", "battery", "%", "battery")]
    }
}

// ── Device Temperature (0x0002) ─────────────────────────

pub struct DeviceTemperatureHandler {
    ctx: HandlerContext,
}

impl DeviceTemperatureHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for DeviceTemperatureHandler {
    fn name(&self) -> &'static str {
        "device_temperature"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == MEASURED_VALUE {
            if let Some(raw) = value_to_f64(value) {
                // Whole degrees on the wire.
                delta.insert("device_temperature".into(), json!(raw));
            }
        }
    }
}

// ── CO2 (0x040D) and PM2.5 (0x042A) ─────────────────────

pub struct Co2Handler {
    ctx: HandlerContext,
}

impl Co2Handler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for Co2Handler {
    fn name(&self) -> &'static str {
        "co2"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == MEASURED_VALUE {
            if let Some(raw) = value_to_f64(value) {
                // Fraction of air on the wire; publish ppm.
                let ppm = if raw < 1.0 { raw * 1_000_000.0 } else { raw };
                delta.insert("co2".into(), json!(ppm.round()));
            }
        }
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![sensor_entity("co2", "carbon_dioxide", "ppm", "co2")]
    }
}

pub struct Pm25Handler {
    ctx: HandlerContext,
}

impl Pm25Handler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for Pm25Handler {
    fn name(&self) -> &'static str {
        "pm25"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == MEASURED_VALUE {
            if let Some(raw) = value_to_f64(value) {
                delta.insert("pm25".into(), json!(round2(raw)));
            }
        }
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![sensor_entity("pm25", "pm25", "µg/m³", "pm25")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::cluster_id as cid;
    use crate::handlers::test_context;

    #[test]
    fn temperature_scales_centi_degrees() {
        let handler = TemperatureHandler::create(test_context(cid::TEMPERATURE_MEASUREMENT));
        let mut delta = StateDelta::new();
        handler.attribute_updated(MEASURED_VALUE, &json!(2150), &mut delta);
        assert_eq!(delta["temperature"], json!(21.5));
    }

    #[test]
    fn temperature_reporting_is_battery_friendly() {
        let handler = TemperatureHandler::create(test_context(cid::TEMPERATURE_MEASUREMENT));
        let config = handler.report_config();
        assert_eq!(config[0], ReportConfig { attr: MEASURED_VALUE, min_s: 30, max_s: 3600, change: 50 });
    }

    #[test]
    fn illuminance_reports_raw_and_lux() {
        let handler = IlluminanceHandler::create(test_context(cid::ILLUMINANCE_MEASUREMENT));
        let mut delta = StateDelta::new();
        // 10000*log10(100)+1 = 20001 -> 100 lux
        handler.attribute_updated(MEASURED_VALUE, &json!(20001), &mut delta);
        assert_eq!(delta["illuminance"], json!(20001));
        assert_eq!(delta["illuminance_lux"], json!(100.0));
        let config = handler.report_config();
        assert_eq!(config[0].min_s, 5);
        assert_eq!(config[0].max_s, 300);
        assert_eq!(config[0].change, 100);
    }

    #[test]
    fn occupancy_is_bit_zero() {
        let handler = OccupancyHandler::create(test_context(cid::OCCUPANCY_SENSING));
        let mut delta = StateDelta::new();
        handler.attribute_updated(MEASURED_VALUE, &json!(1), &mut delta);
        assert_eq!(delta["occupancy"], json!(true));
        handler.attribute_updated(MEASURED_VALUE, &json!(0), &mut delta);
        assert_eq!(delta["occupancy"], json!(false));
    }

    #[test]
    fn battery_percentage_uses_half_percent_units() {
        let handler = PowerConfigurationHandler::create(test_context(cid::POWER_CONFIGURATION));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_BATTERY_PERCENTAGE, &json!(200), &mut delta);
        assert_eq!(delta["battery"], json!(100.0));
        handler.attribute_updated(ATTR_BATTERY_VOLTAGE, &json!(30), &mut delta);
        assert_eq!(delta["battery_voltage"], json!(3.0));
    }
}
