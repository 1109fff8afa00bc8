//! RSSI-based presence zones.
//!
//! A zone is a set of co-located devices. Every intra-zone link keeps a
//! bounded FIFO of RSSI samples; after calibration each link holds a
//! trimmed baseline, and occupancy is declared when enough weighted
//! links deviate from baseline. Clearing waits for the configured delay
//! with no triggered links.
//!
//! Sample sources: the passive per-frame tap (coordinator to sender) and
//! a periodic neighbor-table scan that pulls router LQIs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capabilities::cluster_id as cid;
use crate::events::{EventBus, GatewayEvent};
use crate::ieee::Ieee;
use crate::radio::RadioDriver;

pub const MAX_SAMPLES: usize = 100;
pub const SMOOTHING_WINDOW: usize = 2;
pub const BASELINE_MIN_SAMPLES: usize = 30;
pub const EVALUATION_INTERVAL: Duration = Duration::from_secs(2);
pub const LIVE_UPDATE_INTERVAL: Duration = Duration::from_secs(5);
pub const NEIGHBOR_SCAN_INTERVAL: Duration = Duration::from_secs(30);
pub const NEIGHBOR_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

const ZONES_FILE: &str = "zones.yaml";

/// LQI (0-255) to approximate RSSI in dBm.
pub fn rssi_from_lqi(lqi: u8) -> i32 {
    (-100.0 + (lqi as f64 / 255.0) * 70.0) as i32
}

/// Inverse approximation, clamped to the LQI range.
pub fn lqi_from_rssi(rssi: i32) -> u8 {
    (((rssi + 100) as f64) * 255.0 / 70.0).clamp(0.0, 255.0) as u8
}

/// Clusters configured for aggressive reporting on zone member routers,
/// to guarantee a steady heartbeat of link samples.
pub const ZONE_REPORTING_TARGETS: &[(u16, u16)] = &[
    (cid::ON_OFF, 0x0000),
    (cid::LEVEL_CONTROL, 0x0000),
    (cid::ELECTRICAL_MEASUREMENT, 0x050B),
    (cid::DIAGNOSTICS, 0x011C),
];
pub const ZONE_REPORTING_MIN_S: u16 = 1;
pub const ZONE_REPORTING_MAX_S: u16 = 5;

// ── Configuration ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub device_ieees: Vec<Ieee>,
    #[serde(default = "default_deviation_threshold")]
    pub deviation_threshold: f64,
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,
    #[serde(default = "default_min_links")]
    pub min_links_triggered: f64,
    #[serde(default = "default_calibration_time")]
    pub calibration_time: f64,
    #[serde(default = "default_clear_delay")]
    pub clear_delay: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_volume_m3: Option<f64>,
}

fn default_deviation_threshold() -> f64 {
    2.5
}
fn default_variance_threshold() -> f64 {
    15.0
}
fn default_min_links() -> f64 {
    2.0
}
fn default_calibration_time() -> f64 {
    120.0
}
fn default_clear_delay() -> f64 {
    15.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneState {
    Calibrating,
    Vacant,
    Occupied,
}

// ── Link statistics ─────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RssiSample {
    rssi: i32,
}

#[derive(Debug)]
pub struct LinkStats {
    pub source: Ieee,
    pub target: Ieee,
    samples: VecDeque<RssiSample>,
    pub baseline_mean: Option<f64>,
    pub baseline_std: Option<f64>,
    pub last_rssi: Option<i32>,
    pub last_lqi: Option<u8>,
    smoothed_rssi: Option<f64>,
}

impl LinkStats {
    fn new(source: Ieee, target: Ieee) -> Self {
        Self {
            source,
            target,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            baseline_mean: None,
            baseline_std: None,
            last_rssi: None,
            last_lqi: None,
            smoothed_rssi: None,
        }
    }

    pub fn add_sample(&mut self, rssi: i32, lqi: u8) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(RssiSample { rssi });
        self.last_rssi = Some(rssi);
        self.last_lqi = Some(lqi);

        if self.samples.len() < SMOOTHING_WINDOW {
            self.smoothed_rssi = Some(rssi as f64);
        } else {
            let recent: f64 = self
                .samples
                .iter()
                .rev()
                .take(SMOOTHING_WINDOW)
                .map(|s| s.rssi as f64)
                .sum();
            self.smoothed_rssi = Some(recent / SMOOTHING_WINDOW as f64);
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn smoothed_rssi(&self) -> Option<f64> {
        self.smoothed_rssi
    }

    /// Baseline over the middle 80% of samples; needs at least
    /// [`BASELINE_MIN_SAMPLES`]. Std is clamped to at least 1.0.
    pub fn compute_baseline(&mut self) -> bool {
        if self.samples.len() < BASELINE_MIN_SAMPLES {
            return false;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|s| s.rssi as f64).collect();
        values.sort_by(|a, b| a.partial_cmp(b).expect("finite rssi"));
        let trim = values.len() / 10;
        let trimmed = &values[trim..values.len() - trim];

        let mean = trimmed.iter().sum::<f64>() / trimmed.len() as f64;
        let std = if trimmed.len() > 1 {
            let variance = trimmed.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (trimmed.len() - 1) as f64;
            variance.sqrt()
        } else {
            1.0
        };

        self.baseline_mean = Some(mean);
        self.baseline_std = Some(std.max(1.0));
        tracing::info!(
            "Baseline computed: mean={:.1}, std={:.1} from {} samples",
            mean,
            self.baseline_std.expect("just set"),
            self.samples.len()
        );
        true
    }

    /// Deviation of the smoothed RSSI from baseline, in sigma units.
    pub fn deviation(&self) -> Option<f64> {
        let mean = self.baseline_mean?;
        let std = self.baseline_std?;
        let smoothed = self.smoothed_rssi?;
        if std == 0.0 {
            return Some(0.0);
        }
        Some((smoothed - mean).abs() / std)
    }

    pub fn recent_variance(&self, window: usize) -> Option<f64> {
        if self.samples.len() < window {
            return None;
        }
        let recent: Vec<f64> =
            self.samples.iter().rev().take(window).map(|s| s.rssi as f64).collect();
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let variance =
            recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (recent.len() - 1) as f64;
        Some(variance.sqrt())
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.baseline_mean = None;
        self.baseline_std = None;
        self.smoothed_rssi = None;
    }

    fn snapshot(&self) -> serde_json::Value {
        json!({
            "last_rssi": self.last_rssi,
            "last_lqi": self.last_lqi,
            "smoothed_rssi": self.smoothed_rssi,
            "sample_count": self.samples.len(),
            "baseline_mean": self.baseline_mean,
            "baseline_std": self.baseline_std,
            "deviation": self.deviation(),
        })
    }
}

// ── Zone ────────────────────────────────────────────────

pub struct Zone {
    pub config: ZoneConfig,
    pub state: ZoneState,
    pub links: HashMap<String, LinkStats>,
    calibration_start: Option<Instant>,
    last_trigger: Option<Instant>,
    occupied_since: Option<Instant>,
    last_progress: u32,
}

fn link_key(a: &Ieee, b: &Ieee) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

impl Zone {
    pub fn new(config: ZoneConfig) -> Self {
        Self {
            config,
            state: ZoneState::Calibrating,
            links: HashMap::new(),
            calibration_start: None,
            last_trigger: None,
            occupied_since: None,
            last_progress: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn contains(&self, ieee: &Ieee) -> bool {
        self.config.device_ieees.contains(ieee)
    }

    /// Record a sample. Only intra-zone links count.
    pub fn record_rssi(&mut self, source: &Ieee, target: &Ieee, rssi: i32, lqi: u8) {
        if !(self.contains(source) && self.contains(target)) {
            return;
        }
        let key = link_key(source, target);
        let link = self
            .links
            .entry(key)
            .or_insert_with(|| LinkStats::new(source.clone(), target.clone()));
        link.add_sample(rssi, lqi);
    }

    /// Larger rooms need a higher threshold: a person perturbs less of
    /// the field. Reference room is 20 cubic metres.
    pub fn adaptive_threshold(&self) -> f64 {
        match self.config.room_volume_m3 {
            Some(volume) => self.config.deviation_threshold * (volume / 20.0),
            None => self.config.deviation_threshold,
        }
    }

    /// Drive calibration forward. Returns a progress payload when one
    /// should be emitted (every 5% or on completion).
    pub fn check_calibration(&mut self) -> Option<serde_json::Value> {
        if self.state != ZoneState::Calibrating {
            return None;
        }

        let active_links = self.links.values().filter(|l| l.sample_count() > 0).count();
        let Some(started) = self.calibration_start else {
            if active_links > 0 {
                self.calibration_start = Some(Instant::now());
                tracing::info!(
                    "Zone '{}' started calibration timer ({} active links)",
                    self.name(),
                    active_links
                );
                return Some(self.calibration_payload(0));
            }
            return None;
        };

        let elapsed = started.elapsed().as_secs_f64();
        let progress = ((elapsed / self.config.calibration_time) * 100.0).min(100.0) as u32;

        if elapsed < self.config.calibration_time {
            if progress >= self.last_progress + 5 {
                self.last_progress = progress;
                return Some(self.calibration_payload(progress));
            }
            return None;
        }

        // Time's up: compute baselines, go vacant if any link is ready.
        let mut ready = 0usize;
        for l in self.links.values_mut() {
            if l.compute_baseline() {
                ready += 1;
            }
        }
        if ready > 0 {
            self.state = ZoneState::Vacant;
            tracing::info!("Zone '{}' calibrated with {} links", self.name(), ready);
            Some(self.calibration_payload(100))
        } else {
            None
        }
    }

    fn calibration_payload(&self, progress: u32) -> serde_json::Value {
        let links: serde_json::Map<String, serde_json::Value> = self
            .links
            .iter()
            .filter(|(_, l)| l.sample_count() > 0)
            .map(|(k, l)| (k.clone(), l.snapshot()))
            .collect();
        json!({
            "zone_name": self.name(),
            "state": self.state,
            "progress": progress,
            "total": self.config.calibration_time,
            "link_count": links.len(),
            "ready_links": self.links.values().filter(|l| l.baseline_mean.is_some()).count(),
            "links": links,
        })
    }

    /// Evaluate occupancy. Returns the new state if it changed.
    pub fn evaluate(&mut self, is_router: &dyn Fn(&Ieee) -> bool) -> Option<ZoneState> {
        if self.state == ZoneState::Calibrating {
            return None;
        }

        let threshold = self.adaptive_threshold();
        let mut weighted_triggers = 0.0f64;

        for link in self.links.values() {
            let Some(deviation) = link.deviation() else { continue };
            if deviation > threshold {
                let src_router = is_router(&link.source);
                let dst_router = is_router(&link.target);
                let weight = if src_router && dst_router {
                    2.0
                } else if src_router || dst_router {
                    1.5
                } else {
                    1.0
                };
                weighted_triggers += weight;
                tracing::debug!(
                    "Zone '{}': link {}->{} triggered (dev={:.2}, weight={:.1})",
                    self.name(),
                    link.source,
                    link.target,
                    deviation,
                    weight
                );
            }
        }

        let now = Instant::now();
        if weighted_triggers >= self.config.min_links_triggered {
            self.last_trigger = Some(now);
            if self.state != ZoneState::Occupied {
                self.state = ZoneState::Occupied;
                self.occupied_since = Some(now);
                tracing::info!(
                    "Zone '{}' -> OCCUPIED (weighted triggers {:.1} >= {:.1})",
                    self.name(),
                    weighted_triggers,
                    self.config.min_links_triggered
                );
                return Some(ZoneState::Occupied);
            }
        } else if self.state == ZoneState::Occupied {
            if let Some(last) = self.last_trigger {
                if now.duration_since(last).as_secs_f64() >= self.config.clear_delay {
                    self.state = ZoneState::Vacant;
                    let held = self
                        .occupied_since
                        .map(|s| now.duration_since(s).as_secs_f64())
                        .unwrap_or(0.0);
                    self.occupied_since = None;
                    tracing::info!("Zone '{}' -> VACANT (was occupied {:.0}s)", self.name(), held);
                    return Some(ZoneState::Vacant);
                }
            }
        }
        None
    }

    pub fn recalibrate(&mut self) {
        self.state = ZoneState::Calibrating;
        self.calibration_start = None;
        self.last_progress = 0;
        for link in self.links.values_mut() {
            link.reset();
        }
        tracing::info!("Zone '{}' recalibration started", self.name());
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "name": self.name(),
            "state": self.state,
            "device_count": self.config.device_ieees.len(),
            "link_count": self.links.len(),
            "links": self
                .links
                .iter()
                .map(|(k, l)| (k.clone(), l.snapshot()))
                .collect::<serde_json::Map<_, _>>(),
        })
    }
}

// ── Manager ─────────────────────────────────────────────

/// Role lookups the evaluation loop needs from the device table.
pub trait ZoneDirectory: Send + Sync {
    fn is_router(&self, ieee: &Ieee) -> bool;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ZonesFile {
    #[serde(default)]
    zones: Vec<ZoneConfig>,
}

pub struct ZoneManager {
    data: crate::storage::DataDir,
    zones: Mutex<HashMap<String, Zone>>,
    device_index: Mutex<HashMap<Ieee, Vec<String>>>,
    events: EventBus,
}

impl ZoneManager {
    pub fn load(data: crate::storage::DataDir, events: EventBus) -> Arc<Self> {
        let manager = Arc::new(Self {
            data,
            zones: Mutex::new(HashMap::new()),
            device_index: Mutex::new(HashMap::new()),
            events,
        });

        let path = manager.data.path(ZONES_FILE);
        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_yaml::from_str::<ZonesFile>(&s).map_err(Into::into))
            {
                Ok(file) => {
                    for config in file.zones {
                        manager.create_zone(config);
                    }
                    tracing::info!("Loaded {} zones from config", manager.zone_count());
                }
                Err(e) => tracing::error!("Failed to load zones config: {}", e),
            }
        }
        manager
    }

    pub fn persist(&self) {
        let zones = self.zones.lock().expect("zones lock");
        let file = ZonesFile { zones: zones.values().map(|z| z.config.clone()).collect() };
        match serde_yaml::to_string(&file) {
            Ok(yaml) => {
                if let Err(e) = std::fs::write(self.data.path(ZONES_FILE), yaml) {
                    tracing::error!("Failed to save zones: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to serialise zones: {}", e),
        }
    }

    pub fn zone_count(&self) -> usize {
        self.zones.lock().expect("zones lock").len()
    }

    pub fn create_zone(&self, config: ZoneConfig) {
        let name = config.name.clone();
        {
            let mut index = self.device_index.lock().expect("zones lock");
            for ieee in &config.device_ieees {
                index.entry(ieee.clone()).or_default().push(name.clone());
            }
        }
        tracing::info!("Created zone '{}' with {} devices", name, config.device_ieees.len());
        self.zones.lock().expect("zones lock").insert(name, Zone::new(config));
    }

    pub fn remove_zone(&self, name: &str) -> bool {
        let removed = self.zones.lock().expect("zones lock").remove(name);
        let Some(zone) = removed else { return false };
        let mut index = self.device_index.lock().expect("zones lock");
        for ieee in &zone.config.device_ieees {
            if let Some(names) = index.get_mut(ieee) {
                names.retain(|n| n != name);
                if names.is_empty() {
                    index.remove(ieee);
                }
            }
        }
        tracing::info!("Removed zone '{}'", name);
        true
    }

    pub fn zone_names(&self) -> Vec<String> {
        self.zones.lock().expect("zones lock").keys().cloned().collect()
    }

    pub fn zone_state(&self, name: &str) -> Option<ZoneState> {
        self.zones.lock().expect("zones lock").get(name).map(|z| z.state)
    }

    pub fn zone_snapshot(&self, name: &str) -> Option<serde_json::Value> {
        self.zones.lock().expect("zones lock").get(name).map(|z| z.snapshot())
    }

    pub fn recalibrate(&self, name: &str) -> bool {
        match self.zones.lock().expect("zones lock").get_mut(name) {
            Some(zone) => {
                zone.recalibrate();
                true
            }
            None => false,
        }
    }

    /// Member routers across all zones, for the active neighbor scan and
    /// reporting configuration.
    pub fn member_devices(&self) -> Vec<Ieee> {
        let zones = self.zones.lock().expect("zones lock");
        let mut members: Vec<Ieee> = zones
            .values()
            .flat_map(|z| z.config.device_ieees.iter().cloned())
            .collect();
        members.sort();
        members.dedup();
        members
    }

    /// Feed one link measurement into every zone that contains both
    /// endpoints.
    pub fn record_link_quality(&self, source: &Ieee, target: &Ieee, rssi: i32, lqi: u8) {
        let zone_names: Vec<String> = {
            let index = self.device_index.lock().expect("zones lock");
            let mut names: Vec<String> = index
                .get(source)
                .into_iter()
                .chain(index.get(target))
                .flatten()
                .cloned()
                .collect();
            names.sort();
            names.dedup();
            names
        };
        if zone_names.is_empty() {
            return;
        }
        let mut zones = self.zones.lock().expect("zones lock");
        for name in zone_names {
            if let Some(zone) = zones.get_mut(&name) {
                zone.record_rssi(source, target, rssi, lqi);
            }
        }
    }

    /// One evaluation tick: drives calibration and occupancy, emitting
    /// zone events. Separated from the loop for tests.
    pub fn evaluate_all(&self, directory: &dyn ZoneDirectory, broadcast_live: bool) {
        let mut events = Vec::new();
        {
            let mut zones = self.zones.lock().expect("zones lock");
            for zone in zones.values_mut() {
                if let Some(payload) = zone.check_calibration() {
                    events.push(GatewayEvent::ZoneCalibration(payload));
                }
                let is_router = |ieee: &Ieee| directory.is_router(ieee);
                if let Some(new_state) = zone.evaluate(&is_router) {
                    events.push(GatewayEvent::ZoneState {
                        zone: zone.name().to_string(),
                        state: format!("{new_state:?}").to_lowercase(),
                    });
                }
                if broadcast_live && zone.state != ZoneState::Calibrating {
                    events.push(GatewayEvent::ZoneUpdate(zone.snapshot()));
                }
            }
        }
        for event in events {
            self.events.emit(event);
        }
    }

    /// Background loops: evaluation every 2 s (live stats every 5 s) and
    /// the 30 s neighbor scan.
    pub fn spawn_loops(
        manager: &Arc<Self>,
        directory: Arc<dyn ZoneDirectory>,
        radio: Arc<dyn RadioDriver>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let manager_for_eval = Arc::clone(manager);
        let eval_directory = Arc::clone(&directory);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVALUATION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_live = Instant::now();
            loop {
                ticker.tick().await;
                let live = last_live.elapsed() >= LIVE_UPDATE_INTERVAL;
                if live {
                    last_live = Instant::now();
                }
                manager_for_eval.evaluate_all(eval_directory.as_ref(), live);
            }
        }));

        let manager = Arc::clone(manager);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(NEIGHBOR_SCAN_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.neighbor_scan(&directory, &radio).await;
            }
        }));

        tracing::info!("Zone manager started");
        handles
    }

    /// Active scan: the coordinator's neighbor table plus a Mgmt_Lqi pull
    /// from every router-class zone member.
    async fn neighbor_scan(&self, directory: &Arc<dyn ZoneDirectory>, radio: &Arc<dyn RadioDriver>) {
        let coordinator = radio.coordinator_ieee();

        match tokio::time::timeout(NEIGHBOR_SCAN_TIMEOUT, radio.neighbors(&coordinator)).await {
            Ok(Ok(neighbors)) => {
                for neighbor in neighbors {
                    let rssi = rssi_from_lqi(neighbor.lqi);
                    self.record_link_quality(&coordinator, &neighbor.ieee, rssi, neighbor.lqi);
                }
            }
            Ok(Err(e)) => tracing::debug!("Coordinator neighbor scan failed: {}", e),
            Err(_) => tracing::debug!("Coordinator neighbor scan timed out"),
        }

        for member in self.member_devices() {
            if !directory.is_router(&member) {
                continue;
            }
            match tokio::time::timeout(NEIGHBOR_SCAN_TIMEOUT, radio.neighbors(&member)).await {
                Ok(Ok(neighbors)) => {
                    for neighbor in neighbors {
                        let rssi = rssi_from_lqi(neighbor.lqi);
                        self.record_link_quality(&member, &neighbor.ieee, rssi, neighbor.lqi);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!("Router {} LQI scan failed: {}", member, e);
                }
                Err(_) => tracing::debug!("Router {} LQI scan timed out", member),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DataDir;

    const A: &str = "00:00:00:00:00:00:00:0a";
    const B: &str = "00:00:00:00:00:00:00:0b";
    const C: &str = "00:00:00:00:00:00:00:0c";

    fn ieee(raw: &str) -> Ieee {
        Ieee::parse(raw).unwrap()
    }

    struct AllRouters;
    impl ZoneDirectory for AllRouters {
        fn is_router(&self, _ieee: &Ieee) -> bool {
            true
        }
    }

    fn config(calibration_time: f64, clear_delay: f64) -> ZoneConfig {
        ZoneConfig {
            name: "livingroom".into(),
            device_ieees: vec![ieee(A), ieee(B), ieee(C)],
            deviation_threshold: 2.0,
            variance_threshold: 15.0,
            min_links_triggered: 2.0,
            calibration_time,
            clear_delay,
            room_volume_m3: None,
        }
    }

    #[test]
    fn lqi_rssi_approximation_round_trips() {
        assert_eq!(rssi_from_lqi(255), -30);
        assert_eq!(rssi_from_lqi(0), -100);
        assert_eq!(lqi_from_rssi(-100), 0);
        assert_eq!(lqi_from_rssi(-30), 255);
        assert_eq!(lqi_from_rssi(-200), 0, "clamped");
    }

    #[test]
    fn baseline_needs_thirty_samples_and_clamps_std() {
        let mut link = LinkStats::new(ieee(A), ieee(B));
        for _ in 0..29 {
            link.add_sample(-70, 180);
        }
        assert!(!link.compute_baseline());

        link.add_sample(-70, 180);
        assert!(link.compute_baseline());
        assert_eq!(link.baseline_mean, Some(-70.0));
        // Identical samples would give std 0; the clamp holds it at 1.0.
        assert_eq!(link.baseline_std, Some(1.0));
    }

    #[test]
    fn samples_are_bounded() {
        let mut link = LinkStats::new(ieee(A), ieee(B));
        for i in 0..250 {
            link.add_sample(-70 - (i % 3), 180);
        }
        assert_eq!(link.sample_count(), MAX_SAMPLES);
    }

    #[test]
    fn only_intra_zone_links_are_tracked() {
        let mut zone = Zone::new(config(1.0, 1.0));
        let outsider = ieee("ff:ff:ff:ff:ff:ff:ff:ff");
        zone.record_rssi(&ieee(A), &outsider, -70, 180);
        assert!(zone.links.is_empty());
        zone.record_rssi(&ieee(A), &ieee(B), -70, 180);
        assert_eq!(zone.links.len(), 1);
    }

    #[test]
    fn link_key_is_direction_independent() {
        let mut zone = Zone::new(config(1.0, 1.0));
        zone.record_rssi(&ieee(A), &ieee(B), -70, 180);
        zone.record_rssi(&ieee(B), &ieee(A), -71, 180);
        assert_eq!(zone.links.len(), 1);
        assert_eq!(zone.links.values().next().unwrap().sample_count(), 2);
    }

    fn calibrate_zone(zone: &mut Zone) {
        // Fill all three links with a tight baseline around -70.
        let pairs = [(A, B), (A, C), (B, C)];
        for (s, t) in pairs {
            for i in 0..40 {
                zone.record_rssi(&ieee(s), &ieee(t), -70 - (i % 2), 180);
            }
        }
        zone.check_calibration(); // starts the timer
        std::thread::sleep(Duration::from_millis(30));
        zone.check_calibration();
        assert_eq!(zone.state, ZoneState::Vacant, "calibration should complete");
    }

    #[test]
    fn occupancy_declared_on_weighted_triggers_and_cleared_after_delay() {
        let mut zone = Zone::new(config(0.02, 0.05));
        calibrate_zone(&mut zone);

        let is_router = |_: &Ieee| true;

        // Quiet links: stays vacant.
        assert_eq!(zone.evaluate(&is_router), None);

        // Deviate two of three links hard (-76 vs baseline -70, std 1).
        for _ in 0..4 {
            zone.record_rssi(&ieee(A), &ieee(B), -76, 150);
            zone.record_rssi(&ieee(A), &ieee(C), -76, 150);
        }
        assert_eq!(zone.evaluate(&is_router), Some(ZoneState::Occupied));
        // Still triggered: no transition.
        assert_eq!(zone.evaluate(&is_router), None);

        // Samples return to baseline; clear after the delay.
        for _ in 0..6 {
            zone.record_rssi(&ieee(A), &ieee(B), -70, 180);
            zone.record_rssi(&ieee(A), &ieee(C), -70, 180);
        }
        assert_eq!(zone.evaluate(&is_router), None, "clear delay not elapsed");
        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(zone.evaluate(&is_router), Some(ZoneState::Vacant));
    }

    #[test]
    fn end_device_links_weigh_less() {
        let mut zone = Zone::new(config(0.02, 0.05));
        calibrate_zone(&mut zone);

        // Only end devices: two triggered links weigh 1.0 each, meeting
        // the 2.0 threshold exactly.
        let no_routers = |_: &Ieee| false;
        for _ in 0..4 {
            zone.record_rssi(&ieee(A), &ieee(B), -76, 150);
            zone.record_rssi(&ieee(A), &ieee(C), -76, 150);
        }
        assert_eq!(zone.evaluate(&no_routers), Some(ZoneState::Occupied));
    }

    #[test]
    fn adaptive_threshold_scales_with_room_volume() {
        let mut cfg = config(1.0, 1.0);
        cfg.room_volume_m3 = Some(40.0);
        let zone = Zone::new(cfg);
        assert_eq!(zone.adaptive_threshold(), 4.0);

        let zone = Zone::new(config(1.0, 1.0));
        assert_eq!(zone.adaptive_threshold(), 2.0);
    }

    #[test]
    fn create_then_delete_leaves_no_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ZoneManager::load(DataDir::new(dir.path()), EventBus::default());
        manager.create_zone(config(1.0, 1.0));
        assert_eq!(manager.zone_count(), 1);
        assert!(!manager.member_devices().is_empty());

        assert!(manager.remove_zone("livingroom"));
        assert_eq!(manager.zone_count(), 0);
        assert!(manager.member_devices().is_empty());
        assert!(manager.device_index.lock().unwrap().is_empty());
    }

    #[test]
    fn zones_persist_as_yaml() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = ZoneManager::load(DataDir::new(dir.path()), EventBus::default());
            manager.create_zone(config(60.0, 15.0));
            manager.persist();
        }
        let manager = ZoneManager::load(DataDir::new(dir.path()), EventBus::default());
        assert_eq!(manager.zone_count(), 1);
        assert_eq!(manager.zone_state("livingroom"), Some(ZoneState::Calibrating));
    }

    #[test]
    fn manager_routes_samples_by_membership() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ZoneManager::load(DataDir::new(dir.path()), EventBus::default());
        manager.create_zone(config(1.0, 1.0));

        manager.record_link_quality(&ieee(A), &ieee(B), -70, 180);
        let snapshot = manager.zone_snapshot("livingroom").unwrap();
        assert_eq!(snapshot["link_count"], json!(1));

        // A link with an outsider does not land anywhere.
        manager.record_link_quality(&ieee(A), &ieee("ff:ff:ff:ff:ff:ff:ff:ff"), -70, 180);
        let snapshot = manager.zone_snapshot("livingroom").unwrap();
        assert_eq!(snapshot["link_count"], json!(1));
    }

    #[tokio::test]
    async fn evaluate_all_emits_state_events() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let manager = ZoneManager::load(DataDir::new(dir.path()), events);
        manager.create_zone(config(0.02, 0.05));

        // Calibration.
        {
            let mut zones = manager.zones.lock().unwrap();
            calibrate_zone(zones.get_mut("livingroom").unwrap());
        }
        for _ in 0..4 {
            manager.record_link_quality(&ieee(A), &ieee(B), -76, 150);
            manager.record_link_quality(&ieee(A), &ieee(C), -76, 150);
        }
        manager.evaluate_all(&AllRouters, false);

        let mut saw_occupied = false;
        while let Ok(event) = rx.try_recv() {
            if let GatewayEvent::ZoneState { zone, state } = event {
                assert_eq!(zone, "livingroom");
                if state == "occupied" {
                    saw_occupied = true;
                }
            }
        }
        assert!(saw_occupied);
    }
}
