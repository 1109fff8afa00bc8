//! Window Covering (0x0102): blinds, curtains and shades.

use serde_json::{json, Value};

use super::{
    value_to_f64, value_to_u64, ClusterHandler, CommandDescriptor, DiscoveryEntity,
    HandlerContext, PollAttribute, ReportConfig, StateDelta, ZclRequest,
};

const ATTR_CURRENT_LIFT_PERCENTAGE: u16 = 0x0008;

const CMD_UP_OPEN: u8 = 0x00;
const CMD_DOWN_CLOSE: u8 = 0x01;
const CMD_STOP: u8 = 0x02;
const CMD_GO_TO_LIFT_PERCENTAGE: u8 = 0x05;

pub struct WindowCoveringHandler {
    ctx: HandlerContext,
}

impl WindowCoveringHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for WindowCoveringHandler {
    fn name(&self) -> &'static str {
        "window_covering"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == ATTR_CURRENT_LIFT_PERCENTAGE {
            if let Some(lift) = value_to_u64(value) {
                let lift = lift.min(100);
                // ZCL lift percentage: 100 = fully closed. Published
                // position follows the cover convention: 100 = open.
                let position = 100 - lift;
                delta.insert("lift_percentage".into(), json!(lift));
                delta.insert("position".into(), json!(position));
                let state = if position == 0 { "closed" } else { "open" };
                delta.insert("state".into(), json!(state));
            }
        }
    }

    fn report_config(&self) -> Vec<ReportConfig> {
        vec![ReportConfig { attr: ATTR_CURRENT_LIFT_PERCENTAGE, min_s: 1, max_s: 300, change: 1 }]
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: ATTR_CURRENT_LIFT_PERCENTAGE, name: "position".into() }]
    }

    fn encode_command(&self, verb: &str, value: Option<&Value>) -> Option<ZclRequest> {
        match verb {
            "open" => Some(ZclRequest::Command { command_id: CMD_UP_OPEN, args: Vec::new() }),
            "close" => Some(ZclRequest::Command { command_id: CMD_DOWN_CLOSE, args: Vec::new() }),
            "stop" => Some(ZclRequest::Command { command_id: CMD_STOP, args: Vec::new() }),
            "position" => {
                let position = value.and_then(value_to_f64)?.clamp(0.0, 100.0) as u64;
                let lift = (100 - position) as u8;
                Some(ZclRequest::Command { command_id: CMD_GO_TO_LIFT_PERCENTAGE, args: vec![lift] })
            }
            _ => None,
        }
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor { command: "open".into(), value_kind: None, description: "Open fully".into() },
            CommandDescriptor { command: "close".into(), value_kind: None, description: "Close fully".into() },
            CommandDescriptor { command: "stop".into(), value_kind: None, description: "Stop movement".into() },
            CommandDescriptor {
                command: "position".into(),
                value_kind: Some("percent"),
                description: "Move to position (100 = open)".into(),
            },
        ]
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![DiscoveryEntity {
            component: "cover",
            object_id: "cover".into(),
            config: json!({
                "name": "Cover",
                "position_template": "{{ value_json.position }}",
                "state_open": "open",
                "state_closed": "closed",
                "value_template": "{{ value_json.state }}",
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
    fn lift_percentage_inverts_to_position() {
        let handler = WindowCoveringHandler::create(test_context(cid::WINDOW_COVERING));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_CURRENT_LIFT_PERCENTAGE, &json!(100), &mut delta);
        assert_eq!(delta["position"], json!(0));
        assert_eq!(delta["state"], json!("closed"));

        handler.attribute_updated(ATTR_CURRENT_LIFT_PERCENTAGE, &json!(0), &mut delta);
        assert_eq!(delta["position"], json!(100));
        assert_eq!(delta["state"], json!("open"));
    }

    #[test]
    fn position_command_inverts_back() {
        let handler = WindowCoveringHandler::create(test_context(cid::WINDOW_COVERING));
        let request = handler.encode_command("position", Some(&json!(75))).unwrap();
        assert_eq!(request, ZclRequest::Command { command_id: CMD_GO_TO_LIFT_PERCENTAGE, args: vec![25] });
    }
}
