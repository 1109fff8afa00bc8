//! MQTT service: broker lifecycle, the LWT/birth contract, discovery
//! publication with safe value templates, and inbound command routing.
//!
//! Topics all hang off one configurable base topic:
//!   {base}/bridge/state            retained online/offline (LWT)
//!   {base}/{safe_name}             retained device state JSON
//!   {base}/{safe_name}/set         inbound device commands
//!   {base}/group/{safe_name}/set   inbound group commands
//!   homeassistant/.../config       retained discovery payloads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::config::MqttConfig;
use crate::ieee::Ieee;
use crate::mqtt_queue::{PublishQueue, PublishSink};

const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(300);

/// Commands arriving from the broker, decoded to the gateway's shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    Device {
        identifier: String,
        data: Value,
        component: Option<String>,
        object_id: Option<String>,
    },
    Group {
        name: String,
        data: Value,
    },
    /// Home Assistant announced itself; re-announce everything.
    HaBirth,
}

/// Identity block shared by every discovery entity of a device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub ieee: Ieee,
    pub friendly_name: String,
    pub safe_name: String,
    pub model: String,
    pub manufacturer: String,
}

struct MqttState {
    config: MqttConfig,
    client: std::sync::RwLock<Option<AsyncClient>>,
    connected: AtomicBool,
    shutdown: AtomicBool,
}

#[derive(Clone)]
pub struct MqttService {
    state: Arc<MqttState>,
    pub queue: PublishQueue,
}

/// Replace `+`, `#` and `/` so a friendly name is topic-safe.
pub fn safe_name(name: &str) -> String {
    name.chars().map(|c| if matches!(c, '+' | '#' | '/') { '-' } else { c }).collect()
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

impl MqttService {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            state: Arc::new(MqttState {
                config,
                client: std::sync::RwLock::new(None),
                connected: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
            queue: PublishQueue::with_defaults(),
        }
    }

    pub fn base_topic(&self) -> &str {
        &self.state.config.base_topic
    }

    pub fn bridge_state_topic(&self) -> String {
        format!("{}/bridge/state", self.base_topic())
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn default_qos(&self) -> u8 {
        self.state.config.qos
    }

    /// Connect, install the LWT, start the publish queue, and pump the
    /// event loop until shutdown. Decoded commands land on the returned
    /// channel.
    pub fn start(&self) -> mpsc::UnboundedReceiver<InboundCommand> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.queue.start(Arc::new(self.clone()) as Arc<dyn PublishSink>);

        let service = self.clone();
        tokio::spawn(async move {
            service.run(tx).await;
        });
        rx
    }

    async fn run(&self, tx: mpsc::UnboundedSender<InboundCommand>) {
        let mut backoff = RECONNECT_BASE;
        loop {
            if self.state.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let config = &self.state.config;
            let mut options = MqttOptions::new(
                format!("waggle-{}", std::process::id()),
                config.host.clone(),
                config.port,
            );
            options.set_keep_alive(Duration::from_secs(30));
            options.set_last_will(LastWill::new(
                self.bridge_state_topic(),
                "offline",
                QoS::AtLeastOnce,
                true,
            ));
            if let (Some(user), Some(pass)) = (&config.username, &config.password) {
                options.set_credentials(user.clone(), pass.clone());
            }

            let (client, mut event_loop) = AsyncClient::new(options, 64);
            *self.state.client.write().expect("mqtt lock") = Some(client);

            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Connected to MQTT broker {}:{}", config.host, config.port);
                        self.state.connected.store(true, Ordering::SeqCst);
                        backoff = RECONNECT_BASE;
                        self.on_connect().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        if let Some(command) =
                            route_command(self.base_topic(), &publish.topic, &payload)
                        {
                            let _ = tx.send(command);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.state.connected.store(false, Ordering::SeqCst);
                        if self.state.shutdown.load(Ordering::SeqCst) {
                            return;
                        }
                        tracing::warn!(
                            "MQTT connection error: {} — reconnecting in {:?}",
                            e,
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                        break;
                    }
                }
            }
        }
    }

    /// Birth message and subscriptions, every (re)connect.
    async fn on_connect(&self) {
        let Some(client) = self.client() else { return };

        if let Err(e) = client
            .publish(self.bridge_state_topic(), QoS::AtLeastOnce, true, "online")
            .await
        {
            tracing::warn!("Failed to publish birth message: {}", e);
        }

        let base = self.base_topic();
        for topic in [
            format!("{base}/+/set"),
            format!("{base}/group/+/set"),
            "homeassistant/+/+/+/set".to_string(),
            "homeassistant/status".to_string(),
        ] {
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                tracing::warn!("Failed to subscribe {}: {}", topic, e);
            }
        }
        tracing::info!("Subscribed to command and HA status topics");
    }

    fn client(&self) -> Option<AsyncClient> {
        self.state.client.read().expect("mqtt lock").clone()
    }

    pub async fn stop(&self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.queue.stop(Arc::new(self.clone()) as Arc<dyn PublishSink>).await;
        if let Some(client) = self.client() {
            let _ = client
                .publish(self.bridge_state_topic(), QoS::AtLeastOnce, true, "offline")
                .await;
            let _ = client.disconnect().await;
        }
        self.state.connected.store(false, Ordering::SeqCst);
        tracing::info!("MQTT service stopped");
    }

    // ── State publication ───────────────────────────────

    /// Retained state publish through the non-blocking queue.
    pub fn publish_state(&self, safe_name: &str, payload: &Map<String, Value>, qos: Option<u8>) {
        let topic = format!("{}/{}", self.base_topic(), safe_name);
        let body = serde_json::to_vec(&Value::Object(payload.clone())).unwrap_or_default();
        self.queue.publish_nowait(&topic, body, qos.unwrap_or(self.state.config.qos), true);
    }

    // ── Discovery ───────────────────────────────────────

    /// Publish one retained config message per entity.
    pub fn publish_discovery(
        &self,
        info: &DeviceInfo,
        entities: &[crate::handlers::DiscoveryEntity],
    ) {
        let node_id = info.ieee.node_id();
        for entity in entities {
            let topic = format!(
                "homeassistant/{}/{}/{}/config",
                entity.component, node_id, entity.object_id
            );
            let payload = build_discovery_payload(
                self.base_topic(),
                &self.bridge_state_topic(),
                info,
                entity,
            );
            let body = serde_json::to_vec(&payload).unwrap_or_default();
            self.queue.publish_nowait(&topic, body, 1, true);
        }
    }

    /// Retained empty payloads clear previous discovery configs.
    pub fn remove_discovery(&self, ieee: &Ieee, entities: &[crate::handlers::DiscoveryEntity]) {
        let node_id = ieee.node_id();
        for entity in entities {
            let topic = format!(
                "homeassistant/{}/{}/{}/config",
                entity.component, node_id, entity.object_id
            );
            self.queue.publish_nowait(&topic, Vec::new(), 1, true);
        }
    }
}

#[async_trait]
impl PublishSink for MqttService {
    fn connected(&self) -> bool {
        self.is_connected()
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> anyhow::Result<()> {
        let client = self
            .client()
            .ok_or_else(|| anyhow::anyhow!("mqtt client not started"))?;
        client.publish(topic, qos_level(qos), retain, payload.to_vec()).await?;
        Ok(())
    }
}

// ── Inbound routing ─────────────────────────────────────

/// Parse a payload as JSON, or wrap a bare state string.
fn parse_payload(payload: &str) -> Value {
    if payload.trim_start().starts_with('{') {
        serde_json::from_str(payload).unwrap_or_else(|_| json!({ "state": payload }))
    } else {
        json!({ "state": payload })
    }
}

/// Decode a topic + payload into a gateway command. Returns None for
/// topics we publish ourselves.
pub fn route_command(base_topic: &str, topic: &str, payload: &str) -> Option<InboundCommand> {
    if topic == "homeassistant/status" {
        if payload.trim().eq_ignore_ascii_case("online") {
            tracing::info!("Home Assistant birth detected, republish scheduled");
            return Some(InboundCommand::HaBirth);
        }
        return None;
    }

    let parts: Vec<&str> = topic.split('/').collect();

    // {base}/group/{name}/set
    if parts.len() == 4 && parts[0] == base_topic && parts[1] == "group" && parts[3] == "set" {
        return Some(InboundCommand::Group {
            name: parts[2].to_string(),
            data: parse_payload(payload),
        });
    }

    // {base}/{name}/set
    if parts.len() == 3 && parts[0] == base_topic && parts[2] == "set" {
        return Some(InboundCommand::Device {
            identifier: parts[1].to_string(),
            data: parse_payload(payload),
            component: None,
            object_id: None,
        });
    }

    // homeassistant/{component}/{node_id}/{object_id}/set
    if parts.len() == 5 && parts[0] == "homeassistant" && parts[4] == "set" {
        return Some(InboundCommand::Device {
            identifier: parts[2].to_string(),
            data: parse_payload(payload),
            component: Some(parts[1].to_string()),
            object_id: Some(parts[3].to_string()),
        });
    }

    None
}

// ── Discovery payload assembly ──────────────────────────

fn template_default(attr: &str) -> &'static str {
    if attr.contains("color_temp") {
        "250"
    } else if ["is_open", "is_closed", "contact", "motion", "occupancy", "presence"]
        .iter()
        .any(|x| attr.contains(x))
    {
        "false"
    } else if attr.contains("state") || attr.contains("system_mode") {
        "'OFF'"
    } else if [
        "brightness", "level", "voltage", "power", "current", "energy", "temperature",
        "humidity", "pressure",
    ]
    .iter()
    .any(|x| attr.contains(x))
    {
        "0"
    } else {
        "none"
    }
}

/// Rewrite every `value_json.X` into `value_json.get('X', default)` so a
/// brief payload missing a field never breaks the HA template engine.
pub fn make_safe_template(template: &str) -> String {
    const NEEDLE: &str = "value_json.";
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(NEEDLE) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + NEEDLE.len()..];
        let ident_len = after
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
            .count();
        if ident_len == 0 {
            out.push_str(NEEDLE);
            rest = after;
            continue;
        }
        let attr = &after[..ident_len];
        out.push_str(&format!("value_json.get('{}', {})", attr, template_default(attr)));
        rest = &after[ident_len..];
    }
    out.push_str(rest);
    out
}

fn build_discovery_payload(
    base_topic: &str,
    bridge_state_topic: &str,
    info: &DeviceInfo,
    entity: &crate::handlers::DiscoveryEntity,
) -> Value {
    let node_id = info.ieee.node_id();
    let state_topic = format!("{}/{}", base_topic, info.safe_name);
    let command_topic = format!("{state_topic}/set");

    let mut payload = entity.config.clone();
    let object = payload.as_object_mut().expect("discovery config is an object");

    object.insert("device".into(), json!({
        "identifiers": [node_id],
        "name": info.friendly_name,
        "model": info.model,
        "manufacturer": info.manufacturer,
        "via_device": base_topic,
    }));
    object.insert("unique_id".into(), json!(format!("{}_{}", node_id, entity.object_id)));
    object.insert("state_topic".into(), json!(state_topic));

    for key in ["brightness_state_topic", "color_temp_state_topic"] {
        if object.get(key).and_then(|v| v.as_str()) == Some("STATE_TOPIC_PLACEHOLDER") {
            object.insert(key.into(), json!(state_topic));
        }
    }

    // Dual availability: the bridge LWT and the device's own flag.
    object.insert("availability".into(), json!([
        {
            "topic": bridge_state_topic,
            "payload_available": "online",
            "payload_not_available": "offline",
        },
        {
            "topic": state_topic,
            "value_template":
                "{{ 'online' if value_json.get('available', false) else 'offline' }}",
            "payload_available": "online",
            "payload_not_available": "offline",
        },
    ]));
    object.insert("availability_mode".into(), json!("all"));

    for key in [
        "value_template",
        "state_value_template",
        "position_template",
        "current_temperature_template",
        "temperature_state_template",
        "mode_state_template",
        "brightness_value_template",
        "color_temp_value_template",
    ] {
        if let Some(template) = object.get(key).and_then(|v| v.as_str()) {
            let safe = make_safe_template(template);
            object.insert(key.into(), json!(safe));
        }
    }

    match entity.component {
        "switch" | "light" => {
            object.insert("command_topic".into(), json!(command_topic));
            object
                .entry("payload_on".to_string())
                .or_insert_with(|| json!(r#"{"command": "on", "state": "ON"}"#));
            object
                .entry("payload_off".to_string())
                .or_insert_with(|| json!(r#"{"command": "off", "state": "OFF"}"#));
            if entity.component == "light" {
                if object.contains_key("brightness") {
                    object.insert("brightness_command_topic".into(), json!(command_topic));
                    object.insert(
                        "brightness_command_template".into(),
                        json!(r#"{"command": "brightness", "value": {{ value }}}"#),
                    );
                }
                if object.contains_key("color_mode") {
                    object.insert("color_temp_command_topic".into(), json!(command_topic));
                    object.insert(
                        "color_temp_command_template".into(),
                        json!(r#"{"command": "color_temp", "value": {{ value }}}"#),
                    );
                }
            }
        }
        "cover" => {
            object.insert("command_topic".into(), json!(command_topic));
            object.insert("payload_open".into(), json!(r#"{"command": "open"}"#));
            object.insert("payload_close".into(), json!(r#"{"command": "close"}"#));
            object.insert("payload_stop".into(), json!(r#"{"command": "stop"}"#));
        }
        "climate" => {
            object.insert("temperature_command_topic".into(), json!(command_topic));
            object.insert("mode_command_topic".into(), json!(command_topic));
        }
        "number" => {
            object.insert("command_topic".into(), json!(command_topic));
        }
        _ => {}
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::DiscoveryEntity;

    #[test]
    fn safe_name_replaces_reserved_characters() {
        assert_eq!(safe_name("kitchen/lamp#1+2"), "kitchen-lamp-1-2");
        assert_eq!(safe_name("plain name"), "plain name");
    }

    #[test]
    fn safe_template_rewrites_with_typed_defaults() {
        assert_eq!(
            make_safe_template("{{ value_json.brightness_1 }}"),
            "{{ value_json.get('brightness_1', 0) }}"
        );
        assert_eq!(
            make_safe_template("{{ value_json.state }}"),
            "{{ value_json.get('state', 'OFF') }}"
        );
        assert_eq!(
            make_safe_template("{{ value_json.color_temp }}"),
            "{{ value_json.get('color_temp', 250) }}"
        );
        assert_eq!(
            make_safe_template("{{ value_json.occupancy }}"),
            "{{ value_json.get('occupancy', false) }}"
        );
        assert_eq!(
            make_safe_template("{{ value_json.whatever }}"),
            "{{ value_json.get('whatever', none) }}"
        );
    }

    #[test]
    fn route_device_and_group_commands() {
        assert_eq!(
            route_command("zigbee", "zigbee/lamp/set", r#"{"state":"ON"}"#),
            Some(InboundCommand::Device {
                identifier: "lamp".into(),
                data: json!({"state": "ON"}),
                component: None,
                object_id: None,
            })
        );
        assert_eq!(
            route_command("zigbee", "zigbee/group/livingroom/set", "ON"),
            Some(InboundCommand::Group {
                name: "livingroom".into(),
                data: json!({"state": "ON"}),
            })
        );
        assert_eq!(
            route_command("zigbee", "homeassistant/light/aabbccddeeff0011/light_1/set", "ON"),
            Some(InboundCommand::Device {
                identifier: "aabbccddeeff0011".into(),
                data: json!({"state": "ON"}),
                component: Some("light".into()),
                object_id: Some("light_1".into()),
            })
        );
    }

    #[test]
    fn ha_birth_triggers_republish_command() {
        assert_eq!(
            route_command("zigbee", "homeassistant/status", "online"),
            Some(InboundCommand::HaBirth)
        );
        assert_eq!(route_command("zigbee", "homeassistant/status", "offline"), None);
    }

    #[test]
    fn unrelated_topics_are_ignored() {
        assert!(route_command("zigbee", "zigbee/lamp", r#"{"state":"ON"}"#).is_none());
        assert!(route_command("zigbee", "other/lamp/set", "ON").is_none());
    }

    #[test]
    fn bare_payload_wraps_as_state() {
        match route_command("zigbee", "zigbee/lamp/set", "OFF").unwrap() {
            InboundCommand::Device { data, .. } => assert_eq!(data, json!({"state": "OFF"})),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            ieee: Ieee::parse("00:11:22:33:44:55:66:77").unwrap(),
            friendly_name: "Kitchen Lamp".into(),
            safe_name: "Kitchen Lamp".into(),
            model: "LED1545G12".into(),
            manufacturer: "IKEA".into(),
        }
    }

    #[test]
    fn discovery_payload_carries_contract_fields() {
        let entity = DiscoveryEntity {
            component: "light",
            object_id: "light".into(),
            config: json!({
                "name": "Light",
                "value_template": "{{ value_json.state }}",
                "brightness": true,
                "brightness_state_topic": "STATE_TOPIC_PLACEHOLDER",
                "brightness_value_template": "{{ value_json.brightness }}",
            }),
        };
        let payload = build_discovery_payload("zigbee", "zigbee/bridge/state", &info(), &entity);

        assert_eq!(payload["unique_id"], json!("0011223344556677_light"));
        assert_eq!(payload["state_topic"], json!("zigbee/Kitchen Lamp"));
        assert_eq!(payload["command_topic"], json!("zigbee/Kitchen Lamp/set"));
        assert_eq!(payload["availability_mode"], json!("all"));
        assert_eq!(payload["availability"].as_array().unwrap().len(), 2);
        assert_eq!(payload["device"]["identifiers"][0], json!("0011223344556677"));
        assert_eq!(payload["device"]["via_device"], json!("zigbee"));
        assert_eq!(payload["value_template"], json!("{{ value_json.get('state', 'OFF') }}"));
        assert_eq!(
            payload["brightness_value_template"],
            json!("{{ value_json.get('brightness', 0) }}")
        );
        assert_eq!(payload["brightness_state_topic"], json!("zigbee/Kitchen Lamp"));
        assert!(payload["brightness_command_topic"].is_string());
    }

    #[test]
    fn climate_gets_temperature_command_topic() {
        let entity = DiscoveryEntity {
            component: "climate",
            object_id: "climate".into(),
            config: json!({"name": "Thermostat"}),
        };
        let payload = build_discovery_payload("zigbee", "zigbee/bridge/state", &info(), &entity);
        assert_eq!(payload["temperature_command_topic"], json!("zigbee/Kitchen Lamp/set"));
        assert_eq!(payload["mode_command_topic"], json!("zigbee/Kitchen Lamp/set"));
    }
}
