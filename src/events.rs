use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::ieee::Ieee;

/// Event fired for every state delta a device produces. Automation and
/// zones subscribe to these; ordering per device follows `update_state`
/// call order.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceUpdate {
    pub ieee: Ieee,
    pub changed: Map<String, Value>,
    pub endpoint_id: Option<u8>,
}

/// Everything the gateway announces to its observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    DeviceUpdated(DeviceUpdate),
    DeviceJoined { ieee: Ieee },
    DeviceInitialised { ieee: Ieee },
    DeviceLeft { ieee: Ieee },
    DeviceRemoved { ieee: Ieee },
    BannedJoinBlocked { ieee: Ieee },
    CoordinatorState { state: String, previous: String, reason: Option<String> },
    WatchdogWarning { age_secs: f64, timeout_secs: f64 },
    PartialPollFailure { ieee: Ieee },
    DuplicateAttributeWarning { ieee: Ieee, details: Value },
    AutomationTriggered(Value),
    ZoneCalibration(Value),
    ZoneUpdate(Value),
    ZoneState { zone: String, state: String },
}

/// Broadcast bus shared by the gateway, automation engine and zones.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send, ignoring "no subscribers" which is normal during startup.
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
