//! Capability inference and the state-field allow-list.
//!
//! From a device's cluster inventory plus manufacturer/model quirks we
//! derive a capability set and per-endpoint roles. The capability set is
//! the single gate every state field passes before it may enter the
//! device's canonical state map.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::radio::EndpointDescriptor;

/// Cluster identifiers used across the gateway.
pub mod cluster_id {
    pub const BASIC: u16 = 0x0000;
    pub const POWER_CONFIGURATION: u16 = 0x0001;
    pub const DEVICE_TEMPERATURE: u16 = 0x0002;
    pub const IDENTIFY: u16 = 0x0003;
    pub const GROUPS: u16 = 0x0004;
    pub const SCENES: u16 = 0x0005;
    pub const ON_OFF: u16 = 0x0006;
    pub const LEVEL_CONTROL: u16 = 0x0008;
    pub const ANALOG_INPUT: u16 = 0x000C;
    pub const BINARY_INPUT: u16 = 0x000F;
    pub const MULTISTATE_INPUT: u16 = 0x0012;
    pub const WINDOW_COVERING: u16 = 0x0102;
    pub const THERMOSTAT: u16 = 0x0201;
    pub const FAN_CONTROL: u16 = 0x0202;
    pub const COLOR_CONTROL: u16 = 0x0300;
    pub const BALLAST: u16 = 0x0301;
    pub const ILLUMINANCE_MEASUREMENT: u16 = 0x0400;
    pub const TEMPERATURE_MEASUREMENT: u16 = 0x0402;
    pub const PRESSURE_MEASUREMENT: u16 = 0x0403;
    pub const RELATIVE_HUMIDITY: u16 = 0x0405;
    pub const OCCUPANCY_SENSING: u16 = 0x0406;
    pub const CO2_MEASUREMENT: u16 = 0x040D;
    pub const PM25_MEASUREMENT: u16 = 0x042A;
    pub const IAS_ZONE: u16 = 0x0500;
    pub const METERING: u16 = 0x0702;
    pub const ELECTRICAL_MEASUREMENT: u16 = 0x0B04;
    pub const DIAGNOSTICS: u16 = 0x0B05;
    pub const TOUCHLINK: u16 = 0x1000;
    pub const TUYA_MANUFACTURER: u16 = 0xEF00;
    pub const AQARA_MANUFACTURER: u16 = 0xFCC0;
    pub const PHILIPS_MANUFACTURER: u16 = 0xFC00;
    pub const SONOFF_MANUFACTURER: u16 = 0xFC11;
}

use cluster_id as cid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    OnOff,
    Light,
    Switch,
    Cover,
    WindowCovering,
    LevelControl,
    ColorControl,
    Thermostat,
    Hvac,
    FanControl,
    OccupancySensing,
    MotionSensor,
    IasZone,
    ContactSensor,
    TemperatureSensor,
    HumiditySensor,
    PressureSensor,
    IlluminanceSensor,
    EnvironmentalSensor,
    Battery,
    Metering,
    PowerMonitoring,
    MultiEndpoint,
    MultiSwitch,
    RadarSensor,
    PresenceSensor,
    Tuya,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Actuator,
    Sensor,
    Controller,
    Mixed,
    Passive,
}

#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub role: EndpointRole,
    pub input_clusters: HashSet<u16>,
    pub output_clusters: HashSet<u16>,
    pub configurable_clusters: HashSet<u16>,
}

// ── Field categories ────────────────────────────────────

const MOTION_FIELDS: &[&str] = &[
    "motion", "occupancy", "presence", "motion_on_time", "motion_timeout", "sensitivity",
    "pir_o_to_u_delay", "pir_u_to_o_delay", "pir_u_to_o_threshold",
];

const CONTACT_FIELDS: &[&str] = &["contact", "is_open", "is_closed", "alarm_1", "alarm_2"];

const IAS_ZONE_FIELDS: &[&str] = &[
    "zone_status", "tamper", "battery_low", "trouble", "water_leak", "smoke", "co_detected",
    "vibration", "alarm",
];

const LIGHTING_FIELDS: &[&str] = &[
    "state", "on", "brightness", "level", "color_temp", "color_temp_kelvin",
    "color_temp_startup", "color_x", "color_y", "hue", "saturation", "color_mode",
    "enhanced_hue", "color_loop_active", "transition_time",
];

const HVAC_FIELDS: &[&str] = &[
    "local_temperature", "occupied_heating_setpoint", "occupied_cooling_setpoint",
    "unoccupied_heating_setpoint", "unoccupied_cooling_setpoint", "min_heat_setpoint_limit",
    "max_heat_setpoint_limit", "system_mode", "running_mode", "running_state",
    "pi_heating_demand", "pi_cooling_demand", "valve_position", "window_detection",
    "child_lock", "away_mode", "preset", "swing_mode", "fan_mode",
];

const POWER_FIELDS: &[&str] = &[
    "power", "voltage", "current", "energy", "power_factor", "reactive_power",
    "apparent_power", "rms_voltage", "rms_current", "active_power", "ac_frequency",
    "daily_energy", "monthly_energy",
];

const ENVIRONMENTAL_FIELDS: &[&str] = &[
    "temperature", "humidity", "pressure", "illuminance", "illuminance_lux", "co2", "pm25",
    "voc", "formaldehyde", "air_quality", "soil_moisture",
];

const BATTERY_FIELDS: &[&str] = &[
    "battery", "battery_voltage", "battery_percentage_remaining", "battery_size",
    "battery_quantity", "battery_alarm_mask",
];

const COVER_FIELDS: &[&str] = &[
    "position", "tilt", "lift_percentage", "tilt_percentage",
    "current_position_lift_percentage", "current_position_tilt_percentage", "cover_position",
    "moving",
];

const TUYA_RADAR_FIELDS: &[&str] = &[
    "radar_state", "radar_sensitivity", "presence_sensitivity", "keep_time", "distance",
    "detection_distance_min", "detection_distance_max", "fading_time", "self_test",
    "target_distance", "illuminance", "presence",
];

/// Always admissible regardless of capabilities.
const UNIVERSAL_FIELDS: &[&str] = &[
    "last_seen", "power_source", "manufacturer", "model", "available", "lqi", "rssi",
    "sw_version", "date_code", "application_version", "stack_version", "hw_version",
    "manufacturer_id", "power_source_raw", "device_type", "linkquality", "update_available",
    "update_state", "action", "ieee", "nwk", "friendly_name", "multistate_value",
    "on_with_timed_off", "device_temperature",
];

// Clusters that never support reporting configuration.
const NEVER_CONFIGURABLE: &[u16] = &[
    cid::BASIC, cid::IDENTIFY, cid::GROUPS, cid::SCENES, 0x0007, 0x0009, 0x000A, 0x0013,
    0x0019, 0x0020, 0x0021, 0x0100, 0x0101, 0x0204, cid::BALLAST, 0x0401, 0x0501, 0x0502,
    cid::DIAGNOSTICS, cid::TOUCHLINK, cid::PHILIPS_MANUFACTURER, cid::SONOFF_MANUFACTURER,
];

const CONFIGURABLE_INPUT: &[u16] = &[
    cid::POWER_CONFIGURATION, cid::METERING, cid::ELECTRICAL_MEASUREMENT,
    cid::DEVICE_TEMPERATURE, cid::ILLUMINANCE_MEASUREMENT, cid::TEMPERATURE_MEASUREMENT,
    cid::PRESSURE_MEASUREMENT, 0x0404, cid::RELATIVE_HUMIDITY, cid::OCCUPANCY_SENSING,
    0x0407, 0x0408, cid::CO2_MEASUREMENT, cid::PM25_MEASUREMENT, cid::ON_OFF,
    cid::LEVEL_CONTROL, cid::WINDOW_COVERING, cid::THERMOSTAT, cid::FAN_CONTROL, 0x0203,
    cid::COLOR_CONTROL, cid::IAS_ZONE, cid::ANALOG_INPUT, cid::BINARY_INPUT,
    cid::MULTISTATE_INPUT, cid::TUYA_MANUFACTURER, cid::AQARA_MANUFACTURER,
];

/// Output-side clusters used for binding (controllers), not state.
const BINDING_OUTPUT_CLUSTERS: &[u16] =
    &[cid::ON_OFF, cid::LEVEL_CONTROL, cid::COLOR_CONTROL, cid::GROUPS, cid::SCENES];

const ACTUATOR_INPUTS: &[u16] = &[
    cid::ON_OFF, cid::LEVEL_CONTROL, cid::WINDOW_COVERING, cid::THERMOSTAT, cid::COLOR_CONTROL,
];

const SENSOR_INPUTS: &[u16] = &[
    cid::ILLUMINANCE_MEASUREMENT, cid::TEMPERATURE_MEASUREMENT, cid::RELATIVE_HUMIDITY,
    cid::OCCUPANCY_SENSING, cid::IAS_ZONE,
];

// ── Inference ───────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    set: HashSet<Capability>,
    cluster_ids: HashSet<u16>,
    endpoints: HashMap<u8, EndpointInfo>,
}

impl Capabilities {
    /// Inference order matters: cluster presence first, then endpoint
    /// roles, then manufacturer quirks which may override both.
    pub fn infer(
        endpoints: &[EndpointDescriptor],
        manufacturer: Option<&str>,
        model: Option<&str>,
    ) -> Self {
        let manufacturer = manufacturer.unwrap_or_default().to_lowercase();
        let model = model.unwrap_or_default().to_lowercase();

        let mut caps = Capabilities::default();

        // Phase 1: endpoint analysis. Endpoint 0 is ZDO and never carries
        // handlers or capabilities.
        for ep in endpoints.iter().filter(|e| e.id != 0) {
            let input: HashSet<u16> = ep.input_clusters.iter().copied().collect();
            let output: HashSet<u16> = ep.output_clusters.iter().copied().collect();
            caps.cluster_ids.extend(&input);
            caps.cluster_ids.extend(&output);

            let configurable: HashSet<u16> = input
                .iter()
                .copied()
                .filter(|c| !NEVER_CONFIGURABLE.contains(c) && CONFIGURABLE_INPUT.contains(c))
                .collect();

            let has_actuator = input.iter().any(|c| ACTUATOR_INPUTS.contains(c));
            let has_sensor = input.iter().any(|c| SENSOR_INPUTS.contains(c));
            let has_control_out = output.iter().any(|c| BINDING_OUTPUT_CLUSTERS.contains(c));

            let role = if has_actuator && !has_control_out {
                EndpointRole::Actuator
            } else if has_sensor && !has_actuator {
                EndpointRole::Sensor
            } else if has_control_out && !has_actuator {
                EndpointRole::Controller
            } else if has_actuator && has_sensor {
                EndpointRole::Mixed
            } else {
                EndpointRole::Passive
            };

            caps.endpoints.insert(ep.id, EndpointInfo {
                role,
                input_clusters: input,
                output_clusters: output,
                configurable_clusters: configurable,
            });
        }

        // Phase 2: cluster presence assigns baseline capabilities.
        let cluster_ids_snapshot = caps.cluster_ids.clone();
        let has = |c: u16| cluster_ids_snapshot.contains(&c);

        if has(cid::WINDOW_COVERING) {
            caps.add(Capability::WindowCovering);
            caps.add(Capability::Cover);
        }
        if has(cid::THERMOSTAT) {
            caps.add(Capability::Thermostat);
            caps.add(Capability::Hvac);
        }
        if has(cid::FAN_CONTROL) {
            caps.add(Capability::FanControl);
            caps.add(Capability::Hvac);
        }
        if has(cid::COLOR_CONTROL) {
            caps.add(Capability::ColorControl);
            caps.add(Capability::Light);
        }
        if has(cid::LEVEL_CONTROL) {
            caps.add(Capability::LevelControl);
            if !caps.has(Capability::Cover) {
                caps.add(Capability::Light);
            }
        }
        if has(cid::ON_OFF) {
            caps.add(Capability::OnOff);
            if !caps.has(Capability::Light) && !caps.has(Capability::Cover) {
                caps.add(Capability::Switch);
            }
        }
        if has(cid::OCCUPANCY_SENSING) {
            caps.add(Capability::OccupancySensing);
            caps.add(Capability::MotionSensor);
        }
        if has(cid::IAS_ZONE) {
            caps.add(Capability::IasZone);
            if model.contains("lumi.sensor_magnet") {
                caps.add(Capability::ContactSensor);
            } else {
                caps.add(Capability::MotionSensor);
            }
        }
        if has(cid::TEMPERATURE_MEASUREMENT) || has(cid::DEVICE_TEMPERATURE) {
            caps.add(Capability::TemperatureSensor);
        }
        if has(cid::TEMPERATURE_MEASUREMENT) {
            caps.add(Capability::EnvironmentalSensor);
        }
        if has(cid::RELATIVE_HUMIDITY) {
            caps.add(Capability::HumiditySensor);
            caps.add(Capability::EnvironmentalSensor);
        }
        if has(cid::PRESSURE_MEASUREMENT) {
            caps.add(Capability::PressureSensor);
            caps.add(Capability::EnvironmentalSensor);
        }
        if has(cid::ILLUMINANCE_MEASUREMENT) {
            caps.add(Capability::IlluminanceSensor);
            caps.add(Capability::EnvironmentalSensor);
        }
        if has(cid::POWER_CONFIGURATION) {
            caps.add(Capability::Battery);
        }
        if has(cid::METERING) || has(cid::ELECTRICAL_MEASUREMENT) {
            caps.add(Capability::Metering);
            caps.add(Capability::PowerMonitoring);
        }

        // Phase 3: manufacturer/model quirks, context-aware.

        // Lumi magnet sensors report through IAS but are pure contact.
        if model.contains("lumi.sensor_magnet") {
            caps.add(Capability::ContactSensor);
            caps.add(Capability::Battery);
            caps.remove(Capability::Switch);
            caps.remove(Capability::Light);
            caps.remove(Capability::MotionSensor);
            caps.remove(Capability::OccupancySensing);
        }

        // Philips SML motion sensors: occupancy lives on EP2, EP1 is a
        // controller endpoint that must not be configured.
        if (manufacturer.contains("philips") || manufacturer.contains("signify"))
            && model.contains("sml")
            && has(cid::ON_OFF)
        {
            caps.add(Capability::MotionSensor);
            caps.remove(Capability::Switch);
            if let Some(ep1) = caps.endpoints.get_mut(&1) {
                ep1.configurable_clusters.clear();
                ep1.role = EndpointRole::Controller;
            }
        }

        // Tuya: radar/presence only when the device is not already a
        // functional cover/thermostat/light/switch.
        if has(cid::TUYA_MANUFACTURER) {
            caps.add(Capability::Tuya);
            let is_functional = caps.has(Capability::WindowCovering)
                || caps.has(Capability::Thermostat)
                || caps.has(Capability::Light)
                || caps.has(Capability::Switch);
            if (manufacturer.contains("_tze") || model.contains("ts0601")) && !is_functional {
                caps.add(Capability::PresenceSensor);
                caps.add(Capability::RadarSensor);
                caps.add(Capability::OccupancySensing);
            }
        }

        // Phase 4: multi-endpoint detection.
        if caps.endpoints.len() > 1 {
            caps.add(Capability::MultiEndpoint);
            let actuator_count = caps
                .endpoints
                .values()
                .filter(|info| matches!(info.role, EndpointRole::Actuator | EndpointRole::Mixed))
                .count();
            if actuator_count > 1 {
                caps.add(Capability::MultiSwitch);
            }
        }

        caps
    }

    fn add(&mut self, cap: Capability) {
        self.set.insert(cap);
    }

    fn remove(&mut self, cap: Capability) {
        self.set.remove(&cap);
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.set.contains(&cap)
    }

    pub fn all(&self) -> Vec<Capability> {
        self.set.iter().copied().collect()
    }

    pub fn has_cluster(&self, cluster: u16) -> bool {
        self.cluster_ids.contains(&cluster)
    }

    pub fn endpoint_role(&self, endpoint: u8) -> Option<EndpointRole> {
        self.endpoints.get(&endpoint).map(|e| e.role)
    }

    pub fn is_cluster_configurable(&self, cluster: u16, endpoint: u8) -> bool {
        self.endpoints
            .get(&endpoint)
            .map(|e| e.configurable_clusters.contains(&cluster))
            .unwrap_or(false)
    }

    // ── Field allow-list ────────────────────────────────

    pub fn allows_field(&self, field: &str) -> bool {
        if UNIVERSAL_FIELDS.contains(&field) {
            return true;
        }
        // Raw and DP fields are internal; admitted here, stripped at publish.
        if field.ends_with("_raw") || field.starts_with("dp_") || field.starts_with("startup_behavior")
        {
            return true;
        }

        // `name_N` inherits the classification of `name`.
        if let Some((base, suffix)) = field.rsplit_once('_') {
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                return self.allows_field(base);
            }
        }

        if MOTION_FIELDS.contains(&field) {
            return self.has(Capability::MotionSensor)
                || self.has(Capability::OccupancySensing)
                || self.has(Capability::PresenceSensor)
                || self.has(Capability::RadarSensor);
        }
        if CONTACT_FIELDS.contains(&field) {
            return self.has(Capability::ContactSensor)
                || self.has(Capability::IasZone)
                || ((field == "is_open" || field == "is_closed") && self.has(Capability::Cover));
        }
        if IAS_ZONE_FIELDS.contains(&field) {
            return self.has(Capability::IasZone);
        }
        if LIGHTING_FIELDS.contains(&field) {
            return self.has(Capability::OnOff)
                || self.has(Capability::LevelControl)
                || self.has(Capability::ColorControl)
                || self.has(Capability::Light)
                || self.has(Capability::Switch);
        }
        if HVAC_FIELDS.contains(&field) {
            return self.has(Capability::Thermostat)
                || self.has(Capability::Hvac)
                || self.has(Capability::FanControl);
        }
        if POWER_FIELDS.contains(&field) {
            return self.has(Capability::PowerMonitoring) || self.has(Capability::Metering);
        }
        if ENVIRONMENTAL_FIELDS.contains(&field) {
            return self.has(Capability::EnvironmentalSensor)
                || self.has(Capability::TemperatureSensor)
                || self.has(Capability::HumiditySensor)
                || self.has(Capability::PressureSensor)
                || self.has(Capability::IlluminanceSensor);
        }
        if BATTERY_FIELDS.contains(&field) {
            return self.has(Capability::Battery);
        }
        if COVER_FIELDS.contains(&field) {
            return self.has(Capability::Cover) || self.has(Capability::WindowCovering);
        }
        if TUYA_RADAR_FIELDS.contains(&field) {
            return self.has(Capability::RadarSensor)
                || self.has(Capability::PresenceSensor)
                || self.has(Capability::OccupancySensing);
        }

        // Unknown fields pass; the handler that produced them knows best.
        true
    }

    pub fn filter_state_update(
        &self,
        state: &serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Map<String, serde_json::Value> {
        state
            .iter()
            .filter(|(k, _)| self.allows_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ep(id: u8, input: &[u16], output: &[u16]) -> EndpointDescriptor {
        EndpointDescriptor {
            id,
            profile: 0x0104,
            input_clusters: input.to_vec(),
            output_clusters: output.to_vec(),
        }
    }

    #[test]
    fn bulb_is_light_not_switch() {
        let caps = Capabilities::infer(
            &[ep(1, &[cid::ON_OFF, cid::LEVEL_CONTROL, cid::COLOR_CONTROL], &[])],
            Some("IKEA"),
            Some("LED1545G12"),
        );
        assert!(caps.has(Capability::Light));
        assert!(caps.has(Capability::ColorControl));
        assert!(!caps.has(Capability::Switch));
        assert_eq!(caps.endpoint_role(1), Some(EndpointRole::Actuator));
    }

    #[test]
    fn plain_relay_is_switch() {
        let caps = Capabilities::infer(&[ep(1, &[cid::ON_OFF], &[])], None, None);
        assert!(caps.has(Capability::Switch));
        assert!(!caps.has(Capability::Light));
    }

    #[test]
    fn occupancy_cluster_makes_motion_sensor() {
        let caps = Capabilities::infer(
            &[ep(1, &[cid::OCCUPANCY_SENSING, cid::POWER_CONFIGURATION], &[])],
            None,
            None,
        );
        assert!(caps.has(Capability::MotionSensor));
        assert!(caps.has(Capability::Battery));
        assert_eq!(caps.endpoint_role(1), Some(EndpointRole::Sensor));
    }

    #[test]
    fn lumi_magnet_is_contact_only() {
        let caps = Capabilities::infer(
            &[ep(1, &[cid::IAS_ZONE, cid::ON_OFF], &[])],
            Some("LUMI"),
            Some("lumi.sensor_magnet.aq2"),
        );
        assert!(caps.has(Capability::ContactSensor));
        assert!(!caps.has(Capability::MotionSensor));
        assert!(!caps.has(Capability::Switch));
    }

    #[test]
    fn philips_sml_pins_ep1_as_controller() {
        let caps = Capabilities::infer(
            &[
                ep(1, &[cid::ON_OFF], &[cid::ON_OFF]),
                ep(2, &[cid::OCCUPANCY_SENSING, cid::ILLUMINANCE_MEASUREMENT], &[]),
            ],
            Some("Philips"),
            Some("SML001"),
        );
        assert!(caps.has(Capability::MotionSensor));
        assert!(!caps.has(Capability::Switch));
        assert_eq!(caps.endpoint_role(1), Some(EndpointRole::Controller));
        assert!(!caps.is_cluster_configurable(cid::ON_OFF, 1));
    }

    #[test]
    fn tuya_radar_only_without_functional_role() {
        let radar = Capabilities::infer(
            &[ep(1, &[cid::TUYA_MANUFACTURER], &[])],
            Some("_TZE204_7gclukjs"),
            Some("TS0601"),
        );
        assert!(radar.has(Capability::RadarSensor));

        let cover = Capabilities::infer(
            &[ep(1, &[cid::TUYA_MANUFACTURER, cid::WINDOW_COVERING], &[])],
            Some("_TZE200_zah67ekd"),
            Some("TS0601"),
        );
        assert!(cover.has(Capability::Cover));
        assert!(!cover.has(Capability::RadarSensor));
    }

    #[test]
    fn multi_switch_detection() {
        let caps = Capabilities::infer(
            &[ep(1, &[cid::ON_OFF], &[]), ep(2, &[cid::ON_OFF], &[])],
            None,
            None,
        );
        assert!(caps.has(Capability::MultiEndpoint));
        assert!(caps.has(Capability::MultiSwitch));
    }

    #[test]
    fn allow_list_gates_fields_by_capability() {
        let switch = Capabilities::infer(&[ep(1, &[cid::ON_OFF], &[])], None, None);
        assert!(switch.allows_field("state"));
        assert!(switch.allows_field("last_seen"));
        assert!(!switch.allows_field("occupancy"));
        assert!(!switch.allows_field("local_temperature"));

        let motion = Capabilities::infer(&[ep(1, &[cid::OCCUPANCY_SENSING], &[])], None, None);
        assert!(motion.allows_field("occupancy"));
        assert!(!motion.allows_field("brightness"));
    }

    #[test]
    fn endpoint_suffix_inherits_base_classification() {
        let caps = Capabilities::infer(
            &[ep(1, &[cid::ON_OFF], &[]), ep(2, &[cid::ON_OFF], &[])],
            None,
            None,
        );
        assert!(caps.allows_field("state_2"));
        assert!(!caps.allows_field("occupancy_2"));
    }

    #[test]
    fn filter_drops_disallowed_fields() {
        let switch = Capabilities::infer(&[ep(1, &[cid::ON_OFF], &[])], None, None);
        let mut state = serde_json::Map::new();
        state.insert("state".into(), json!("ON"));
        state.insert("occupancy".into(), json!(true));
        let filtered = switch.filter_state_update(&state);
        assert!(filtered.contains_key("state"));
        assert!(!filtered.contains_key("occupancy"));
    }
}
