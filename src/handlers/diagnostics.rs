//! Diagnostics cluster (0x0B05): last-message LQI/RSSI reports.
//!
//! The values don't enter device state; the gateway taps reports on this
//! cluster and feeds them to the zones subsystem as link samples. The
//! handler's job is the aggressive reporting configuration that keeps a
//! steady heartbeat of samples flowing.

use serde_json::Value;

use super::{ClusterHandler, HandlerContext, ReportConfig, StateDelta};

pub const ATTR_LAST_MESSAGE_LQI: u16 = 0x011C;
pub const ATTR_LAST_MESSAGE_RSSI: u16 = 0x011D;

pub struct DiagnosticsHandler {
    ctx: HandlerContext,
}

impl DiagnosticsHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for DiagnosticsHandler {
    fn name(&self) -> &'static str {
        "diagnostics"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, _attr_id: u16, _value: &Value, _delta: &mut StateDelta) {
        // Consumed by the zone tap upstream.
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: ATTR_LAST_MESSAGE_LQI, min_s: 2, max_s: 5, change: 1 }]
    }
}
