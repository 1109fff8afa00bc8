//! Gateway configuration: a YAML file (default `./config.yaml`) with env
//! overrides for the knobs operators touch most.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Serial device path of the radio.
    pub port: String,
    /// `auto`, `ezsp` or `znp`.
    pub radio_type: String,
    pub channel: u8,
    /// 16-byte network key as hex; generated elsewhere during commissioning.
    pub network_key: Option<String>,
    pub mqtt: MqttConfig,
    pub data_dir: String,
    pub ezsp: EzspSettings,
    pub znp: ZnpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub base_topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Default QoS for state publishes.
    pub qos: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EzspSettings {
    pub baudrate: u32,
    pub flow_control: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZnpSettings {
    pub baudrate: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            radio_type: "auto".to_string(),
            channel: 25,
            network_key: None,
            mqtt: MqttConfig::default(),
            data_dir: "./data".to_string(),
            ezsp: EzspSettings::default(),
            znp: ZnpSettings::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            base_topic: "zigbee".to_string(),
            username: None,
            password: None,
            qos: 1,
        }
    }
}

impl Default for EzspSettings {
    fn default() -> Self {
        Self { baudrate: 460_800, flow_control: "hardware".to_string() }
    }
}

impl Default for ZnpSettings {
    fn default() -> Self {
        Self { baudrate: 115_200 }
    }
}

impl GatewayConfig {
    /// Load from a YAML file, then apply env overrides. A missing file is
    /// not an error; defaults apply.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&contents)?
        } else {
            tracing::info!("No config file at {:?}, using defaults", path);
            GatewayConfig::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("WAGGLE_SERIAL_PORT") {
            self.port = port;
        }
        if let Ok(host) = std::env::var("WAGGLE_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("WAGGLE_MQTT_PORT") {
            if let Ok(p) = port.parse() {
                self.mqtt.port = p;
            }
        }
        if let Ok(base) = std::env::var("WAGGLE_BASE_TOPIC") {
            self.mqtt.base_topic = base;
        }
        if let Ok(dir) = std::env::var("WAGGLE_DATA_DIR") {
            self.data_dir = dir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.channel, 25);
        assert_eq!(config.mqtt.base_topic, "zigbee");
        assert_eq!(config.ezsp.baudrate, 460_800);
        assert_eq!(config.znp.baudrate, 115_200);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: /dev/ttyACM1\nmqtt:\n  base_topic: zb\n").unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.port, "/dev/ttyACM1");
        assert_eq!(config.mqtt.base_topic, "zb");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.channel, 25);
    }
}
