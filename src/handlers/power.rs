//! Power monitoring clusters: Electrical Measurement and Metering.

use serde_json::{json, Value};

use super::{
    round2, value_to_f64, ClusterHandler, DiscoveryEntity, HandlerContext, PollAttribute,
    ReportConfig, StateDelta,
};

// ── Electrical Measurement (0x0B04) ─────────────────────

const ATTR_RMS_VOLTAGE: u16 = 0x0505;
const ATTR_RMS_CURRENT: u16 = 0x0508;
const ATTR_ACTIVE_POWER: u16 = 0x050B;

pub struct ElectricalMeasurementHandler {
    ctx: HandlerContext,
}

impl ElectricalMeasurementHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for ElectricalMeasurementHandler {
    fn name(&self) -> &'static str {
        "electrical_measurement"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            ATTR_ACTIVE_POWER => {
                if let Some(raw) = value_to_f64(value) {
                    // Decawatt divisor on the plugs this gateway targets.
                    delta.insert("power".into(), json!(round2(raw / 10.0)));
                    delta.insert("active_power".into(), json!(round2(raw / 10.0)));
                }
            }
            ATTR_RMS_VOLTAGE => {
                if let Some(raw) = value_to_f64(value) {
                    delta.insert("voltage".into(), json!(round2(raw / 10.0)));
                }
            }
            ATTR_RMS_CURRENT => {
                if let Some(raw) = value_to_f64(value) {
                    delta.insert("current".into(), json!(round2(raw / 1000.0)));
                }
            }
            _ => {}
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![
            ReportConfig { attr: ATTR_ACTIVE_POWER, min_s: 5, max_s: 300, change: 10 },
            ReportConfig { attr: ATTR_RMS_VOLTAGE, min_s: 30, max_s: 600, change: 10 },
        ]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![
            PollAttribute { attr: ATTR_ACTIVE_POWER, name: "power".into() },
            PollAttribute { attr: ATTR_RMS_VOLTAGE, name: "voltage".into() },
        ]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![
            DiscoveryEntity {
                component: "sensor",
                object_id: "power".into(),
                config: json!({
                    "name": "Power",
                    "device_class": "power",
                    "unit_of_measurement": "W",
                    "state_class": "measurement",
                    "value_template": "{{ value_json.power }}",
                }),
            },
            DiscoveryEntity {
                component: "sensor",
                object_id: "voltage".into(),
                config: json!({
                    "name": "Voltage",
                    "device_class": "voltage",
                    "unit_of_measurement": "V",
                    "state_class": "measurement",
                    "value_template": "{{ value_json.voltage }}",
                }),
            },
        ]
    }
}

// ── Metering (0x0702) ───────────────────────────────────

const ATTR_CURRENT_SUMMATION: u16 = 0x0000;
const ATTR_INSTANTANEOUS_DEMAND: u16 = 0x0400;

pub struct MeteringHandler {
    ctx: HandlerContext,
}

impl MeteringHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for MeteringHandler {
    fn name(&self) -> &'static str {
        "metering"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            ATTR_CURRENT_SUMMATION => {
                if let Some(raw) = value_to_f64(value) {
                    delta.insert("energy".into(), json!(round2(raw / 1000.0)));
                }
            }
            ATTR_INSTANTANEOUS_DEMAND => {
                if let Some(raw) = value_to_f64(value) {
                    delta.insert("power".into(), json!(round2(raw)));
                }
            }
            _ => {}
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: ATTR_CURRENT_SUMMATION, min_s: 60, max_s: 3600, change: 1 }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: ATTR_CURRENT_SUMMATION, name: "energy".into() }]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![DiscoveryEntity {
            component: "sensor",
            object_id: "energy".into(),
            config: json!({
                "name": "Energy",
                "device_class": "energy",
                "unit_of_measurement": "kWh",
                "state_class": "total_increasing",
                "value_template": "{{ value_json.energy }}",
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::cluster_id as cid;
    use crate::handlers::test_context;

    #[test]
    fn active_power_scales_decawatts() {
        let handler = ElectricalMeasurementHandler::create(test_context(cid::ELECTRICAL_MEASUREMENT));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_ACTIVE_POWER, &json!(1234), &mut delta);
        assert_eq!(delta["power"], json!(123.4));
    }

    #[test]
    fn metering_summation_in_kwh() {
        let handler = MeteringHandler::create(test_context(cid::METERING));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_CURRENT_SUMMATION, &json!(4520), &mut delta);
        assert_eq!(delta["energy"], json!(4.52));
    }
}
