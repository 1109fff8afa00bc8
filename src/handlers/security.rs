//! IAS Zone (0x0500): motion, door/window, leak, smoke and vibration
//! sensors. Zone status arrives both as attribute reports and as status
//! change notifications (cluster command 0x00).

use serde_json::{json, Value};

use super::{
    value_to_u64, ClusterHandler, DiscoveryEntity, HandlerContext, ReportConfig, StateDelta,
};
use crate::capabilities::Capability;

const ATTR_ZONE_STATUS: u16 = 0x0002;

const CMD_STATUS_CHANGE_NOTIFICATION: u8 = 0x00;

// Zone status bits.
const BIT_ALARM_1: u16 = 1 << 0;
const BIT_ALARM_2: u16 = 1 << 1;
const BIT_TAMPER: u16 = 1 << 2;
const BIT_BATTERY_LOW: u16 = 1 << 3;

pub struct IasZoneHandler {
    ctx: HandlerContext,
}

impl IasZoneHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }

    fn apply_status(&self, status: u16, delta: &mut StateDelta) {
        let alarm_1 = status & BIT_ALARM_1 != 0;
        delta.insert("zone_status".into(), json!(status));
        delta.insert("alarm_1".into(), json!(alarm_1));
        delta.insert("alarm_2".into(), json!(status & BIT_ALARM_2 != 0));
        delta.insert("tamper".into(), json!(status & BIT_TAMPER != 0));
        delta.insert("battery_low".into(), json!(status & BIT_BATTERY_LOW != 0));

        if self.ctx.capabilities.has(Capability::ContactSensor) {
            // Emitted in zigbee-native sense; the publication pipeline
            // inverts to HA door sense (true = open).
            delta.insert("contact".into(), json!(alarm_1));
        } else {
            delta.insert("occupancy".into(), json!(alarm_1));
        }
    }
}

impl ClusterHandler for IasZoneHandler {
    fn name(&self) -> &'static str {
        "ias_zone"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == ATTR_ZONE_STATUS {
            if let Some(status) = value_to_u64(value) {
                self.apply_status(status as u16, delta);
            }
        }
    }

    fn cluster_command(&self, _tsn: u8, command_id: u8, payload: &[u8], delta: &mut StateDelta) {
        // Status change notification: zone status u16 LE, extended status,
        // zone id, delay.
        if command_id == CMD_STATUS_CHANGE_NOTIFICATION && payload.len() >= 2 {
            let status = u16::from_le_bytes([payload[0], payload[1]]);
            self.apply_status(status, delta);
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: ATTR_ZONE_STATUS, min_s: 0, max_s: 3600, change: 1 }]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        if self.ctx.capabilities.has(Capability::ContactSensor) {
            vec![DiscoveryEntity {
                component: "binary_sensor",
                object_id: "contact".into(),
                config: json!({
                    "name": "Contact",
                    "device_class": "door",
                    "value_template": "{{ value_json.contact }}",
                    "payload_on": true,
                    "payload_off": false,
                }),
            }]
        } else {
            vec![DiscoveryEntity {
                component: "binary_sensor",
                object_id: "occupancy".into(),
                config: json!({
                    "name": "Motion",
                    "device_class": "motion",
                    "value_template": "{{ value_json.occupancy }}",
                    "payload_on": true,
                    "payload_off": false,
                }),
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{cluster_id as cid, Capabilities};
    use crate::handlers::test_context;
    use crate::radio::EndpointDescriptor;

    fn contact_context() -> HandlerContext {
        let mut ctx = test_context(cid::IAS_ZONE);
        ctx.model = Some("lumi.sensor_magnet.aq2".into());
        ctx.capabilities = Capabilities::infer(
            &[EndpointDescriptor {
                id: 1,
                profile: 0x0104,
                input_clusters: vec![cid::IAS_ZONE],
                output_clusters: vec![],
            }],
            Some("LUMI"),
            Some("lumi.sensor_magnet.aq2"),
        );
        ctx
    }

    #[test]
    fn status_bitmap_decodes_named_booleans() {
        let handler = IasZoneHandler::create(test_context(cid::IAS_ZONE));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_ZONE_STATUS, &json!(0b1101), &mut delta);
        assert_eq!(delta["alarm_1"], json!(true));
        assert_eq!(delta["alarm_2"], json!(false));
        assert_eq!(delta["tamper"], json!(true));
        assert_eq!(delta["battery_low"], json!(true));
        // Motion variant mirrors alarm_1 into occupancy.
        assert_eq!(delta["occupancy"], json!(true));
    }

    #[test]
    fn contact_variant_sets_contact_not_occupancy() {
        let handler = IasZoneHandler::create(contact_context());
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_ZONE_STATUS, &json!(1), &mut delta);
        assert_eq!(delta["contact"], json!(true));
        assert!(!delta.contains_key("occupancy"));
    }

    #[test]
    fn notification_command_parses_status() {
        let handler = IasZoneHandler::create(test_context(cid::IAS_ZONE));
        let mut delta = StateDelta::new();
        handler.cluster_command(7, CMD_STATUS_CHANGE_NOTIFICATION, &[0x01, 0x00, 0x00, 0x01, 0x00, 0x00], &mut delta);
        assert_eq!(delta["alarm_1"], json!(true));
        assert_eq!(delta["zone_status"], json!(1));
    }
}
