//! Gateway orchestrator.
//!
//! Owns the device table and every subsystem: probes and starts the
//! radio behind the resilience supervisor, pumps radio events into the
//! per-device handlers, pushes state deltas through the cache and the
//! MQTT publish queue, routes inbound MQTT commands back to devices with
//! optimistic echoes, and drives polling, automation, zones, groups and
//! the join lifecycle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::automation::{AutomationEngine, PendingAction, StateProvider};
use crate::ban::BanList;
use crate::cache::StateCache;
use crate::capabilities::{cluster_id as cid, Capability};
use crate::config::GatewayConfig;
use crate::device::{now_ms, Device, UpdateResult};
use crate::error::RadioError;
use crate::events::{DeviceUpdate, EventBus, GatewayEvent};
use crate::groups::{GroupDirectory, GroupManager};
use crate::handlers::HandlerRegistry;
use crate::ieee::Ieee;
use crate::mqtt::{safe_name, DeviceInfo, InboundCommand, MqttService};
use crate::overrides::OverrideManager;
use crate::radio::{
    self, DeviceDescriptor, DeviceRole, DriverFactory, RadioConfig, RadioDriver, RadioEvent,
};
use crate::resilience::{retry_operation, spawn_watchdog_monitor, RetryOptions, Supervisor};
use crate::stats::PacketStats;
use crate::storage::DataDir;
use crate::zones::{self, ZoneDirectory, ZoneManager};

const NAMES_FILE: &str = "names.json";
const SETTINGS_FILE: &str = "device_settings.json";
const POLLING_FILE: &str = "polling_config.json";

const STARTUP_ATTEMPTS: u32 = 12;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);
const COMMAND_GRACE_PERIOD: Duration = Duration::from_secs(20);
const ZONE_INIT_DELAY: Duration = Duration::from_secs(2);
const ANNOUNCE_PACING: Duration = Duration::from_millis(50);
const JOIN_HISTORY_CAPACITY: usize = 50;
const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub preferred_endpoints: HashMap<String, u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
}

/// Uniform outcome for user-facing operations.
#[derive(Debug, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }
    pub fn err(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()) }
    }
}

pub struct Gateway {
    weak: Weak<Gateway>,
    pub config: GatewayConfig,
    data: DataDir,
    registry: HandlerRegistry,
    devices: DashMap<Ieee, Device>,
    radio: RwLock<Option<Arc<dyn RadioDriver>>>,
    supervisor: RwLock<Option<Arc<Supervisor>>>,
    pub mqtt: MqttService,
    pub cache: StateCache,
    pub bans: BanList,
    pub overrides: Arc<OverrideManager>,
    pub stats: PacketStats,
    pub events: EventBus,
    pub zones: Arc<ZoneManager>,
    pub automation: Arc<AutomationEngine>,
    pub groups: Arc<GroupManager>,
    names: RwLock<HashMap<Ieee, String>>,
    /// safe name (and lowercased / node-id forms) to canonical IEEE.
    name_index: RwLock<HashMap<String, Ieee>>,
    settings: Mutex<HashMap<String, DeviceSettings>>,
    polling_intervals: Mutex<HashMap<Ieee, u64>>,
    polling_tasks: Mutex<HashMap<Ieee, JoinHandle<()>>>,
    join_history: Mutex<VecDeque<Value>>,
    accepting_commands: AtomicBool,
    permit_until: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let data = DataDir::new(&config.data_dir);
        let events = EventBus::default();
        let mqtt = MqttService::new(config.mqtt.clone());

        let names_raw: HashMap<String, String> = data.load_json(NAMES_FILE);
        let names: HashMap<Ieee, String> = names_raw
            .into_iter()
            .filter_map(|(raw, name)| Ieee::parse(&raw).map(|ieee| (ieee, name)))
            .collect();

        let gateway = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            registry: HandlerRegistry::standard(),
            devices: DashMap::new(),
            radio: RwLock::new(None),
            supervisor: RwLock::new(None),
            cache: StateCache::load(data.clone()),
            bans: BanList::load(data.clone()),
            overrides: Arc::new(OverrideManager::load(data.clone())),
            stats: PacketStats::new(),
            zones: ZoneManager::load(data.clone(), events.clone()),
            automation: Arc::new(AutomationEngine::load(data.clone())),
            groups: Arc::new(GroupManager::load(data.clone(), mqtt.clone())),
            names: RwLock::new(names),
            name_index: RwLock::new(HashMap::new()),
            settings: Mutex::new(data.load_json(SETTINGS_FILE)),
            polling_intervals: Mutex::new(HashMap::new()),
            polling_tasks: Mutex::new(HashMap::new()),
            join_history: Mutex::new(VecDeque::new()),
            accepting_commands: AtomicBool::new(false),
            permit_until: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            events,
            mqtt,
            data,
            config,
        });
        gateway.rebuild_name_index();
        gateway
    }

    fn arc(&self) -> Arc<Gateway> {
        self.weak.upgrade().expect("gateway alive")
    }

    // ── Startup / shutdown ──────────────────────────────

    /// Full startup: probe the family, build the family config, start
    /// the stack with retries, then bring the runtime up around it.
    pub async fn start(&self, factory: &dyn DriverFactory) -> anyhow::Result<()> {
        let family = radio::probe(&self.config).await?;
        tracing::info!("Detected radio type: {}", family);

        let radio_config = RadioConfig::build(&self.config, family, self.devices.len());

        let mut driver = None;
        for attempt in 1..=STARTUP_ATTEMPTS {
            match factory.start(family, &radio_config).await {
                Ok(d) => {
                    driver = Some(d);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Startup attempt {}/{} failed: {}", attempt, STARTUP_ATTEMPTS, e);
                    tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                }
            }
        }
        let driver = driver.ok_or_else(|| {
            anyhow::anyhow!("failed to start Zigbee radio after {STARTUP_ATTEMPTS} attempts")
        })?;

        self.attach_radio(driver).await;

        // Command grace period: let HA settle before acting on commands.
        let gateway = self.arc();
        self.spawn_task(tokio::spawn(async move {
            tokio::time::sleep(COMMAND_GRACE_PERIOD).await;
            gateway.set_accepting_commands(true);
            tracing::info!("Command grace period over, accepting commands");
        }));

        // Zones come up after a short stability delay.
        let gateway = self.arc();
        self.spawn_task(tokio::spawn(async move {
            tokio::time::sleep(ZONE_INIT_DELAY).await;
            gateway.init_zones().await;
        }));

        Ok(())
    }

    /// Wire a running stack into the runtime: supervisor, event pump,
    /// device restoration, polling, announcements.
    pub async fn attach_radio(&self, driver: Arc<dyn RadioDriver>) {
        let supervisor = Arc::new(Supervisor::new(Arc::clone(&driver), self.events.clone()));
        *self.radio.write().expect("gateway lock") = Some(Arc::clone(&driver));
        *self.supervisor.write().expect("gateway lock") = Some(Arc::clone(&supervisor));

        self.spawn_task(spawn_watchdog_monitor(Arc::clone(&supervisor), self.events.clone()));

        // Radio event pump; the per-frame tap rides the same stream.
        let gateway = self.arc();
        let mut events = driver.subscribe();
        self.spawn_task(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => gateway.handle_radio_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Radio event pump lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Restore devices from the stack's persistent database.
        for descriptor in driver.device_table() {
            self.restore_device(&descriptor);
        }
        self.rebuild_name_index();

        // Saved polling intervals.
        let persisted: HashMap<String, u64> = self.data.load_json(POLLING_FILE);
        for (raw, interval) in persisted {
            if let Some(ieee) = Ieee::parse(&raw) {
                if self.devices.contains_key(&ieee) {
                    self.set_polling_interval(&ieee, interval, false);
                }
            }
        }

        // Automation listener on the state-delta stream.
        let gateway = self.arc();
        let mut bus = self.events.subscribe();
        self.spawn_task(tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(GatewayEvent::DeviceUpdated(update)) => {
                        gateway.evaluate_automation(&update);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Automation listener lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Availability sweep: a device crossing the 25 h threshold gets
        // its retained topic refreshed.
        let gateway = self.arc();
        self.spawn_task(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let ieees: Vec<Ieee> = gateway.devices.iter().map(|e| e.key().clone()).collect();
                for ieee in ieees {
                    let flipped = gateway
                        .devices
                        .get_mut(&ieee)
                        .map(|mut d| d.check_availability_change())
                        .unwrap_or(false);
                    if flipped {
                        let Some(device) = gateway.devices.get(&ieee) else { continue };
                        let mut payload = Map::new();
                        payload.insert("available".into(), json!(device.is_available()));
                        payload.insert("linkquality".into(), json!(device.lqi));
                        payload.insert("last_seen".into(), json!(device.last_seen));
                        drop(device);
                        gateway.mqtt.publish_state(&gateway.device_safe_name(&ieee), &payload, None);
                    }
                }
            }
        }));

        // Zone state edges go out as retained binary sensors.
        let gateway = self.arc();
        let mut bus = self.events.subscribe();
        self.spawn_task(tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(GatewayEvent::ZoneState { zone, state }) => {
                        gateway.publish_zone_state(&zone, &state);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        tracing::info!(
            "Zigbee core started on {} ({}) with {} devices",
            self.config.port,
            driver.family(),
            self.devices.len()
        );

        // HA discovery + retained initial state, paced.
        let gateway = self.arc();
        self.spawn_task(tokio::spawn(async move {
            gateway.announce_all_devices().await;
        }));
    }

    async fn init_zones(&self) {
        let Some(driver) = self.radio_driver() else { return };
        let directory: Arc<dyn ZoneDirectory> = Arc::new(GatewayDirectory(self.arc()));
        let handles = ZoneManager::spawn_loops(&self.zones, directory, Arc::clone(&driver));
        for handle in handles {
            self.spawn_task(handle);
        }
        self.publish_zone_discovery();
        self.configure_zone_reporting().await;
    }

    /// Aggressive reporting on zone member routers keeps link samples
    /// flowing even on a quiet network.
    async fn configure_zone_reporting(&self) {
        let Some(driver) = self.radio_driver() else { return };
        for member in self.zones.member_devices() {
            let Some(device) = self.devices.get(&member) else { continue };
            if device.role != DeviceRole::Router {
                continue;
            }
            let targets: Vec<(u8, u16, u16)> = device
                .endpoints
                .iter()
                .flat_map(|ep| {
                    zones::ZONE_REPORTING_TARGETS
                        .iter()
                        .filter(|(cluster, _)| ep.input_clusters.contains(cluster))
                        .map(move |(cluster, attr)| (ep.id, *cluster, *attr))
                })
                .collect();
            drop(device);
            for (endpoint, cluster, attr) in targets {
                let result = tokio::time::timeout(
                    CONFIGURE_TIMEOUT,
                    driver.configure_reporting(
                        &member,
                        endpoint,
                        cluster,
                        attr,
                        zones::ZONE_REPORTING_MIN_S,
                        zones::ZONE_REPORTING_MAX_S,
                        1,
                    ),
                )
                .await;
                if let Ok(Err(e)) = result {
                    tracing::debug!("[{}] zone reporting config failed: {}", member, e);
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!("Gateway shutting down");
        self.set_accepting_commands(false);

        for (_, handle) in self.polling_tasks.lock().expect("gateway lock").drain() {
            handle.abort();
        }
        for handle in self.tasks.lock().expect("gateway lock").drain(..) {
            handle.abort();
        }

        self.zones.persist();
        self.cache.shutdown();

        if let Some(driver) = self.radio_driver() {
            if let Err(e) = driver.shutdown().await {
                tracing::warn!("Radio shutdown error: {}", e);
            }
        }
        self.mqtt.stop().await;
        tracing::info!("Gateway shutdown complete");
    }

    fn spawn_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().expect("gateway lock").push(handle);
    }

    pub fn radio_driver(&self) -> Option<Arc<dyn RadioDriver>> {
        self.radio.read().expect("gateway lock").clone()
    }

    pub fn supervisor(&self) -> Option<Arc<Supervisor>> {
        self.supervisor.read().expect("gateway lock").clone()
    }

    pub fn set_accepting_commands(&self, accepting: bool) {
        self.accepting_commands.store(accepting, Ordering::SeqCst);
    }

    // ── Names and resolution ────────────────────────────

    pub fn friendly_name(&self, ieee: &Ieee) -> String {
        self.names
            .read()
            .expect("gateway lock")
            .get(ieee)
            .cloned()
            .unwrap_or_else(|| ieee.to_string())
    }

    pub fn device_safe_name(&self, ieee: &Ieee) -> String {
        safe_name(&self.friendly_name(ieee))
    }

    pub fn rename_device(&self, ieee: &Ieee, name: &str) -> CommandOutcome {
        if !self.devices.contains_key(ieee) {
            return CommandOutcome::err(format!("Device not found: {ieee}"));
        }
        {
            let mut names = self.names.write().expect("gateway lock");
            names.insert(ieee.clone(), name.to_string());
            let raw: HashMap<String, String> =
                names.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
            self.data.save_json(NAMES_FILE, &raw);
        }
        self.rebuild_name_index();
        tracing::info!("[{}] renamed to '{}'", ieee, name);
        CommandOutcome::ok()
    }

    fn rebuild_name_index(&self) {
        let names = self.names.read().expect("gateway lock");
        let mut index = self.name_index.write().expect("gateway lock");
        index.clear();
        for entry in self.devices.iter() {
            let ieee = entry.key();
            let safe = safe_name(&names.get(ieee).cloned().unwrap_or_else(|| ieee.to_string()));
            index.insert(safe.clone(), ieee.clone());
            index.insert(safe.to_lowercase(), ieee.clone());
            index.insert(ieee.node_id(), ieee.clone());
        }
    }

    /// Resolve any user-facing identifier (friendly name, safe name,
    /// node id, raw IEEE, case-insensitive or substring) to the
    /// canonical IEEE.
    pub fn resolve_identifier(&self, identifier: &str) -> Option<Ieee> {
        if let Some(ieee) = Ieee::parse(identifier) {
            if self.devices.contains_key(&ieee) {
                return Some(ieee);
            }
        }
        let index = self.name_index.read().expect("gateway lock");
        if let Some(ieee) = index.get(identifier) {
            return Some(ieee.clone());
        }
        let lower = identifier.to_lowercase();
        if let Some(ieee) = index.get(&lower) {
            return Some(ieee.clone());
        }
        // Substring match on names as a last resort.
        index
            .iter()
            .find(|(name, _)| name.to_lowercase().contains(&lower))
            .map(|(_, ieee)| ieee.clone())
    }

    // ── Device lifecycle ────────────────────────────────

    fn restore_device(&self, descriptor: &DeviceDescriptor) {
        let mut device = Device::new(descriptor, &self.registry, Some(Arc::clone(&self.overrides)));
        self.apply_device_settings(&mut device);
        if let Some(cached) = self.cache.get(&descriptor.ieee) {
            device.restore_state(&cached);
            // Write the sanitised state back so stale transient fields
            // never come back on the next restart either.
            self.cache.update(&descriptor.ieee, device.state.clone());
        }
        tracing::info!(
            "[{}] restored ({} endpoints, {} handlers)",
            descriptor.ieee,
            descriptor.endpoints.len(),
            device.handler_count()
        );
        self.devices.insert(descriptor.ieee.clone(), device);
    }

    fn apply_device_settings(&self, device: &mut Device) {
        let settings = self.settings.lock().expect("gateway lock");
        if let Some(entry) = settings.get(device.ieee.as_str()) {
            device.load_preferred_endpoints(entry.preferred_endpoints.clone());
        }
    }

    pub fn set_preferred_endpoint(&self, ieee: &Ieee, attribute: &str, endpoint: u8) -> CommandOutcome {
        let Some(mut device) = self.devices.get_mut(ieee) else {
            return CommandOutcome::err(format!("Device not found: {ieee}"));
        };
        device.set_preferred_endpoint(attribute, endpoint);
        let preferred = device.preferred_endpoints().clone();
        drop(device);

        let mut settings = self.settings.lock().expect("gateway lock");
        settings.entry(ieee.to_string()).or_default().preferred_endpoints = preferred;
        self.data.save_json(SETTINGS_FILE, &*settings);
        CommandOutcome::ok()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn has_device(&self, ieee: &Ieee) -> bool {
        self.devices.contains_key(ieee)
    }

    pub fn device_state(&self, ieee: &Ieee) -> Option<Map<String, Value>> {
        self.devices.get(ieee).map(|d| d.state.clone())
    }

    pub fn join_history(&self) -> Vec<Value> {
        self.join_history.lock().expect("gateway lock").iter().cloned().collect()
    }

    // ── Radio event handling ────────────────────────────

    pub async fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::DeviceJoined { ieee, nwk } => self.on_device_joined(ieee, nwk),
            RadioEvent::RawDeviceInitialised { ieee } => {
                tracing::debug!("[{}] raw device initialised", ieee);
            }
            RadioEvent::DeviceInitialised { descriptor } => {
                self.on_device_initialised(descriptor);
            }
            RadioEvent::DeviceLeft { ieee } => self.on_device_left(&ieee),
            RadioEvent::DeviceRemoved { ieee } => self.on_device_removed(&ieee),
            RadioEvent::RelaysUpdated { ieee, relays } => {
                tracing::debug!("[{}] relays updated: {} entries", ieee, relays.len());
            }
            RadioEvent::Frame(frame) => self.on_frame(&frame),
            RadioEvent::AttributeReport { ieee, endpoint, cluster, attr_id, value } => {
                self.on_attribute_report(&ieee, endpoint, cluster, attr_id, &value);
            }
            RadioEvent::ClusterCommand { ieee, endpoint, cluster, tsn, command_id, payload } => {
                self.on_cluster_command(&ieee, endpoint, cluster, tsn, command_id, &payload);
            }
        }
    }

    fn on_device_joined(&self, ieee: Ieee, nwk: u16) {
        // Ban list first: banned devices are kicked before any table entry.
        if self.bans.is_banned(&ieee) {
            tracing::warn!("[{}] blocked: banned device attempted to join", ieee);
            self.events.emit(GatewayEvent::BannedJoinBlocked { ieee: ieee.clone() });
            if let Some(driver) = self.radio_driver() {
                let gateway = self.arc();
                tokio::spawn(async move {
                    if let Err(e) = driver.leave(&ieee).await {
                        tracing::warn!("[{}] leave request failed: {}", ieee, e);
                    }
                    if let Err(e) = driver.remove(&ieee).await {
                        tracing::debug!("[{}] remove failed: {}", ieee, e);
                    }
                    gateway.devices.remove(&ieee);
                });
            }
            return;
        }

        if self.devices.contains_key(&ieee) {
            tracing::warn!("[{}] duplicate join event, ignoring", ieee);
            return;
        }

        tracing::info!("Device joined: {} (nwk 0x{:04X})", ieee, nwk);
        {
            let mut history = self.join_history.lock().expect("gateway lock");
            history.push_front(json!({
                "join_timestamp": now_ms(),
                "ieee_address": ieee,
                "nwk": nwk,
            }));
            history.truncate(JOIN_HISTORY_CAPACITY);
        }
        self.events.emit(GatewayEvent::DeviceJoined { ieee });
    }

    fn on_device_initialised(&self, descriptor: DeviceDescriptor) {
        let ieee = descriptor.ieee.clone();
        if self.bans.is_banned(&ieee) {
            return;
        }
        tracing::info!("Device initialised: {}", ieee);
        self.restore_device(&descriptor);
        self.rebuild_name_index();
        self.events.emit(GatewayEvent::DeviceInitialised { ieee: ieee.clone() });

        let gateway = self.arc();
        tokio::spawn(async move {
            let _ = gateway.configure_device(&ieee).await;
            gateway.announce_device(&ieee);
        });
    }

    fn on_device_left(&self, ieee: &Ieee) {
        tracing::info!("Device left: {}", ieee);
        self.devices.remove(ieee);
        self.disable_polling(ieee);
        self.rebuild_name_index();
        self.events.emit(GatewayEvent::DeviceLeft { ieee: ieee.clone() });
    }

    fn on_device_removed(&self, ieee: &Ieee) {
        tracing::info!("Device removed: {}", ieee);
        self.devices.remove(ieee);
        self.cache.purge(ieee);
        self.stats.remove(ieee);
        self.disable_polling(ieee);
        self.rebuild_name_index();
        self.events.emit(GatewayEvent::DeviceRemoved { ieee: ieee.clone() });
    }

    /// Per-frame tap: packet stats, zone link samples, LQI bookkeeping.
    fn on_frame(&self, frame: &crate::radio::Frame) {
        self.stats.record_rx(&frame.sender);
        if let Some(supervisor) = self.supervisor() {
            supervisor.feed_watchdog();
        }

        if let Some(mut device) = self.devices.get_mut(&frame.sender) {
            if let Some(lqi) = frame.lqi {
                device.lqi = lqi;
            }
            device.touch();
        }

        if let Some(driver) = self.radio_driver() {
            let coordinator = driver.coordinator_ieee();
            // Real RSSI when the transport exposes it, approximation
            // otherwise.
            let (rssi, lqi) = match (frame.rssi, frame.lqi) {
                (Some(rssi), Some(lqi)) => (rssi as i32, lqi),
                (Some(rssi), None) => (rssi as i32, zones::lqi_from_rssi(rssi as i32)),
                (None, Some(lqi)) => (zones::rssi_from_lqi(lqi), lqi),
                (None, None) => return,
            };
            self.zones.record_link_quality(&coordinator, &frame.sender, rssi, lqi);
        }
    }

    fn on_attribute_report(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        cluster: u16,
        attr_id: u16,
        value: &Value,
    ) {
        // Diagnostics reports double as zone link samples.
        if cluster == cid::DIAGNOSTICS
            && attr_id == crate::handlers::diagnostics::ATTR_LAST_MESSAGE_LQI
        {
            if let Some(lqi) = value.as_u64() {
                let lqi = lqi.min(255) as u8;
                if let Some(driver) = self.radio_driver() {
                    self.zones.record_link_quality(
                        &driver.coordinator_ieee(),
                        ieee,
                        zones::rssi_from_lqi(lqi),
                        lqi,
                    );
                }
            }
        }

        let result = match self.devices.get_mut(ieee) {
            Some(mut device) => device.handle_attribute_report(endpoint, cluster, attr_id, value),
            None => return,
        };
        self.apply_update(ieee, result, Some(endpoint), None);
    }

    fn on_cluster_command(
        &self,
        ieee: &Ieee,
        endpoint: u8,
        cluster: u16,
        tsn: u8,
        command_id: u8,
        payload: &[u8],
    ) {
        let result = match self.devices.get_mut(ieee) {
            Some(mut device) => {
                device.handle_cluster_command(endpoint, cluster, tsn, command_id, payload)
            }
            None => return,
        };
        self.apply_update(ieee, result, Some(endpoint), None);
    }

    // ── The publish pipeline ────────────────────────────

    /// Feed one `update_state` outcome through the cache, the MQTT
    /// queue, and the event bus.
    pub fn apply_update(
        &self,
        ieee: &Ieee,
        result: UpdateResult,
        endpoint_id: Option<u8>,
        qos: Option<u8>,
    ) {
        if !result.duplicates.is_empty() {
            self.events.emit(GatewayEvent::DuplicateAttributeWarning {
                ieee: ieee.clone(),
                details: json!(result.duplicates),
            });
        }
        if result.changed.is_empty() {
            return;
        }

        let Some(device) = self.devices.get(ieee) else { return };
        let payload = build_state_payload(&device, &result.changed, endpoint_id);
        let full_state = device.state.clone();
        drop(device);

        self.cache.update(ieee, full_state);
        self.mqtt.publish_state(&self.device_safe_name(ieee), &payload, qos);
        self.events.emit(GatewayEvent::DeviceUpdated(DeviceUpdate {
            ieee: ieee.clone(),
            changed: result.changed,
            endpoint_id,
        }));
    }

    // ── Outbound command path ───────────────────────────

    /// Send a control verb to a device, with retries and supervisor
    /// routing for NCP faults.
    pub async fn send_command(
        &self,
        ieee: &Ieee,
        verb: &str,
        value: Option<&Value>,
        endpoint_id: Option<u8>,
        data: Option<&Value>,
    ) -> CommandOutcome {
        let Some(driver) = self.radio_driver() else {
            return CommandOutcome::err("radio not started");
        };

        // Off with a transition is delegated to Level Control's
        // move-to-level-with-on/off.
        let mut verb = verb.to_string();
        let mut value = value.cloned();
        if verb == "off" {
            if let Some(transition) = data.and_then(|d| d.get("transition")).and_then(|v| v.as_f64())
            {
                if transition > 0.0
                    && self
                        .devices
                        .get(ieee)
                        .map(|d| d.capabilities.has(Capability::LevelControl))
                        .unwrap_or(false)
                {
                    verb = "off_with_transition".to_string();
                    value = Some(json!(transition));
                }
            }
        }

        let encoded = match self.devices.get_mut(ieee) {
            Some(mut device) => device.encode_command(&verb, value.as_ref(), endpoint_id),
            None => return CommandOutcome::err(format!("Device not found: {ieee}")),
        };
        let Some((endpoint, cluster, frame)) = encoded else {
            return CommandOutcome::err(format!("Unsupported command: {verb}"));
        };

        let send = retry_operation(
            || driver.send_unicast(ieee, endpoint, cluster, &frame),
            RetryOptions::default(),
        )
        .await;

        match send {
            Ok(()) => {
                self.stats.record_tx(ieee);
                if let Some(supervisor) = self.supervisor() {
                    supervisor.feed_watchdog();
                }
                CommandOutcome::ok()
            }
            Err(e) => {
                self.stats.record_error(ieee);
                if e.is_ncp_failure() {
                    if let Some(supervisor) = self.supervisor() {
                        let error_text = e.to_string();
                        tokio::spawn(async move {
                            supervisor
                                .handle_ncp_failure(&RadioError::NcpFailure(error_text))
                                .await;
                        });
                    }
                }
                tracing::error!("[{}] {} failed: {}", ieee, verb, e);
                CommandOutcome::err(e.to_string())
            }
        }
    }

    // ── Inbound MQTT commands ───────────────────────────

    /// Consume the decoded command stream from the MQTT service.
    pub fn run_command_loop(
        &self,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<InboundCommand>,
    ) {
        let gateway = self.arc();
        self.spawn_task(tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    InboundCommand::Device { identifier, data, component: _, object_id } => {
                        gateway.handle_mqtt_command(&identifier, &data, object_id.as_deref()).await;
                    }
                    InboundCommand::Group { name, data } => {
                        gateway.handle_group_command(&name, &data).await;
                    }
                    InboundCommand::HaBirth => {
                        let gateway = Arc::clone(&gateway);
                        tokio::spawn(async move {
                            gateway.announce_all_devices().await;
                        });
                    }
                }
            }
        }));
    }

    pub async fn handle_group_command(&self, name: &str, data: &Value) {
        if !self.accepting_commands.load(Ordering::SeqCst) {
            tracing::warn!("Ignoring group command during startup: {}", name);
            return;
        }
        let Some(group) = self.groups.group_by_name(name) else {
            tracing::warn!("Group command for unknown group: {}", name);
            return;
        };
        let Some(driver) = self.radio_driver() else { return };
        let directory = GatewayDirectory(self.arc());
        let outcome = self.groups.control(group.id, data, &directory, &driver).await;
        if !outcome.success {
            tracing::warn!("Group {} command failed: {:?}", group.id, outcome.error);
        }
    }

    /// Inbound device command with optimistic state echo: if the stack
    /// accepted the command, the intended state lands immediately and
    /// the device's own report corrects it later.
    pub async fn handle_mqtt_command(
        &self,
        identifier: &str,
        data: &Value,
        object_id: Option<&str>,
    ) {
        if !self.accepting_commands.load(Ordering::SeqCst) {
            tracing::warn!("Ignoring command during startup: {} {}", identifier, data);
            return;
        }
        let Some(ieee) = self.resolve_identifier(identifier) else {
            tracing::warn!("MQTT command for unknown device: {}", identifier);
            return;
        };
        tracing::info!("[{}] MQTT command: {}", ieee, data);

        // Endpoint from the object id suffix ("switch_2" -> 2), falling
        // back to the first light-bearing endpoint.
        let mut endpoint = object_id
            .and_then(|oid| oid.rsplit_once('_'))
            .and_then(|(_, suffix)| suffix.parse::<u8>().ok());
        if endpoint.is_none() {
            if let Some(device) = self.devices.get(&ieee) {
                if device.capabilities.has(Capability::Light) {
                    endpoint = device
                        .endpoints
                        .iter()
                        .find(|ep| {
                            ep.id != 0
                                && (ep.input_clusters.contains(&cid::ON_OFF)
                                    || ep.input_clusters.contains(&cid::LEVEL_CONTROL))
                        })
                        .map(|ep| ep.id);
                }
            }
        }

        let mut optimistic = Map::new();
        let multi_switch = self
            .devices
            .get(&ieee)
            .map(|d| d.capabilities.has(Capability::MultiSwitch))
            .unwrap_or(false);

        // JSON schema shape: state / brightness / color_temp / color.
        if let Some(state) = data.get("state").and_then(|v| v.as_str()) {
            let verb = if state.eq_ignore_ascii_case("on") { "on" } else { "off" };
            let outcome = self.send_command(&ieee, verb, None, endpoint, Some(data)).await;
            if outcome.success {
                let on = verb == "on";
                optimistic.insert("state".into(), json!(state.to_uppercase()));
                optimistic.insert("on".into(), json!(on));
                if multi_switch {
                    if let Some(ep) = endpoint {
                        optimistic.insert(format!("state_{ep}"), json!(state.to_uppercase()));
                        optimistic.insert(format!("on_{ep}"), json!(on));
                    }
                }
            }
        }

        if let Some(brightness) = data.get("brightness").and_then(|v| v.as_f64()) {
            // HA sends raw 0-254; the verb wants percent.
            let pct = (brightness / 2.54).round().clamp(0.0, 100.0);
            let outcome = self
                .send_command(&ieee, "brightness", Some(&json!(pct)), endpoint, Some(data))
                .await;
            if outcome.success {
                optimistic.insert("brightness".into(), json!(brightness.min(254.0) as u64));
                optimistic.insert("level".into(), json!(pct as u64));
                if brightness > 0.0 {
                    optimistic.insert("state".into(), json!("ON"));
                    optimistic.insert("on".into(), json!(true));
                } else {
                    // Brightness zero is an off.
                    optimistic.insert("state".into(), json!("OFF"));
                    optimistic.insert("on".into(), json!(false));
                }
            }
        }

        if let Some(mireds) = data.get("color_temp").and_then(|v| v.as_u64()) {
            if mireds > 0 {
                let kelvin = crate::handlers::lighting::mireds_to_kelvin(mireds as u16);
                let outcome = self
                    .send_command(&ieee, "color_temp", Some(&json!(kelvin)), endpoint, Some(data))
                    .await;
                if outcome.success {
                    optimistic.insert("color_temp".into(), json!(mireds));
                }
            }
        }

        if let Some(color) = data.get("color") {
            if color.get("x").is_some() && color.get("y").is_some() {
                let outcome =
                    self.send_command(&ieee, "xy_color", Some(color), endpoint, Some(data)).await;
                if outcome.success {
                    optimistic.insert("color".into(), color.clone());
                }
            }
        }

        // Legacy shape: {command, value, endpoint}.
        if optimistic.is_empty() {
            if let Some(command) = data.get("command").and_then(|v| v.as_str()) {
                let value = data.get("value");
                let ep = data
                    .get("endpoint")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u8)
                    .or(endpoint);
                let outcome = self
                    .send_command(&ieee, &command.to_lowercase(), value, ep, Some(data))
                    .await;
                if outcome.success {
                    match command.to_lowercase().as_str() {
                        "on" => {
                            optimistic.insert("state".into(), json!("ON"));
                            optimistic.insert("on".into(), json!(true));
                        }
                        "off" => {
                            optimistic.insert("state".into(), json!("OFF"));
                            optimistic.insert("on".into(), json!(false));
                        }
                        "brightness" => {
                            if let Some(pct) = value.and_then(|v| v.as_f64()) {
                                let raw =
                                    if pct <= 100.0 { (pct * 2.54) as u64 } else { pct as u64 };
                                optimistic.insert("brightness".into(), json!(raw));
                                optimistic.insert("level".into(), json!(pct as u64));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if !optimistic.is_empty() {
            tracing::info!("[{}] optimistic update: {:?}", ieee, optimistic);
            let result = match self.devices.get_mut(&ieee) {
                Some(mut device) => device.update_state(optimistic, endpoint),
                None => return,
            };
            self.apply_update(&ieee, result, endpoint, Some(0));
        }
    }

    // ── Automation execution ────────────────────────────

    fn evaluate_automation(&self, update: &DeviceUpdate) {
        let provider = GatewayDirectory(self.arc());
        let actions = self.automation.evaluate(&update.ieee, &update.changed, &provider);
        for action in actions {
            let gateway = self.arc();
            tokio::spawn(async move {
                gateway.execute_automation(action).await;
            });
        }
    }

    async fn execute_automation(&self, action: PendingAction) {
        if action.delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(action.delay)).await;
        }
        let outcome = self
            .send_command(
                &action.target_ieee,
                &action.command,
                action.value.as_ref(),
                action.endpoint_id,
                None,
            )
            .await;
        self.automation
            .record_result(&action.rule_id, outcome.success, outcome.error.as_deref());
        self.events.emit(GatewayEvent::AutomationTriggered(json!({
            "rule_id": action.rule_id,
            "rule_name": action.rule_name,
            "source_ieee": action.source_ieee,
            "target_ieee": action.target_ieee,
            "command": action.command,
            "value": action.value,
            "success": outcome.success,
            "error": outcome.error,
        })));

        // Optimistic echo for the automation path too.
        if outcome.success {
            let mut optimistic = Map::new();
            match action.command.as_str() {
                "on" => {
                    optimistic.insert("state".into(), json!("ON"));
                    optimistic.insert("on".into(), json!(true));
                }
                "off" => {
                    optimistic.insert("state".into(), json!("OFF"));
                    optimistic.insert("on".into(), json!(false));
                }
                _ => {}
            }
            if !optimistic.is_empty() {
                let result = match self.devices.get_mut(&action.target_ieee) {
                    Some(mut device) => device.update_state(optimistic, action.endpoint_id),
                    None => return,
                };
                self.apply_update(&action.target_ieee, result, action.endpoint_id, Some(0));
            }
        }
    }

    // ── Configure / poll ────────────────────────────────

    /// Bind and install reporting for every configurable handler; one
    /// failing attribute never blocks the rest.
    pub async fn configure_device(&self, ieee: &Ieee) -> CommandOutcome {
        let Some(driver) = self.radio_driver() else {
            return CommandOutcome::err("radio not started");
        };
        let plan = match self.devices.get(ieee) {
            Some(device) => device.configure_plan(),
            None => return CommandOutcome::err(format!("Device not found: {ieee}")),
        };

        for entry in plan {
            let bind = tokio::time::timeout(
                CONFIGURE_TIMEOUT,
                driver.bind(ieee, entry.endpoint, entry.cluster, &driver.coordinator_ieee()),
            )
            .await;
            match bind {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        "[{}] bind 0x{:04X} failed: {} — continuing",
                        ieee,
                        entry.cluster,
                        e
                    );
                    continue;
                }
                Err(_) => {
                    tracing::warn!("[{}] bind 0x{:04X} timed out", ieee, entry.cluster);
                    continue;
                }
            }

            for report in entry.reports {
                let result = tokio::time::timeout(
                    CONFIGURE_TIMEOUT,
                    driver.configure_reporting(
                        ieee,
                        entry.endpoint,
                        entry.cluster,
                        report.attr,
                        report.min_s,
                        report.max_s,
                        report.change,
                    ),
                )
                .await;
                match result {
                    Ok(Ok(())) => tracing::debug!(
                        "[{}] reporting configured 0x{:04X}/0x{:04X}",
                        ieee,
                        entry.cluster,
                        report.attr
                    ),
                    Ok(Err(e)) => tracing::warn!(
                        "[{}] reporting config failed 0x{:04X}/0x{:04X}: {}",
                        ieee,
                        entry.cluster,
                        report.attr,
                        e
                    ),
                    Err(_) => tracing::warn!(
                        "[{}] reporting config timed out 0x{:04X}/0x{:04X}",
                        ieee,
                        entry.cluster,
                        report.attr
                    ),
                }
            }
        }
        CommandOutcome::ok()
    }

    /// Read every pollable attribute; partial failure is an event, not
    /// an error.
    pub async fn poll_device(&self, ieee: &Ieee) -> CommandOutcome {
        let Some(driver) = self.radio_driver() else {
            return CommandOutcome::err("radio not started");
        };
        let plan = match self.devices.get(ieee) {
            Some(device) => device.poll_plan(),
            None => return CommandOutcome::err(format!("Device not found: {ieee}")),
        };

        let mut delta = Map::new();
        let mut partial_failure = false;

        for entry in plan {
            for attr in &entry.pollable {
                let attr_ids = [attr.attr];
                let read = retry_operation(
                    || driver.read_attributes(ieee, entry.endpoint, entry.cluster, &attr_ids),
                    RetryOptions { max_retries: 2, ..Default::default() },
                )
                .await;
                match read {
                    Ok(values) => {
                        let Some(raw) = values.get(&attr.attr) else { continue };
                        if raw.is_null() {
                            continue;
                        }
                        let parsed = match self.devices.get(ieee) {
                            Some(device) => {
                                device.parse_polled(entry.endpoint, entry.cluster, attr.attr, raw)
                            }
                            None => return CommandOutcome::err("device vanished during poll"),
                        };
                        for (key, value) in parsed {
                            delta.insert(key, value);
                        }
                        delta.insert(format!("{}_raw", attr.name), raw.clone());
                    }
                    Err(e) => {
                        tracing::debug!("[{}] poll of {} failed: {}", ieee, attr.name, e);
                        partial_failure = true;
                    }
                }
            }
        }

        if !delta.is_empty() {
            let result = match self.devices.get_mut(ieee) {
                Some(mut device) => device.update_state(delta, None),
                None => return CommandOutcome::err("device vanished during poll"),
            };
            self.apply_update(ieee, result, None, None);
        }
        if partial_failure {
            self.events.emit(GatewayEvent::PartialPollFailure { ieee: ieee.clone() });
        }
        CommandOutcome::ok()
    }

    // ── Polling scheduler ───────────────────────────────

    pub fn set_polling_interval(&self, ieee: &Ieee, interval_s: u64, persist: bool) {
        {
            let mut intervals = self.polling_intervals.lock().expect("gateway lock");
            if interval_s == 0 {
                intervals.remove(ieee);
            } else {
                intervals.insert(ieee.clone(), interval_s);
            }
            if persist {
                let raw: HashMap<String, u64> =
                    intervals.iter().map(|(k, v)| (k.to_string(), *v)).collect();
                self.data.save_json(POLLING_FILE, &raw);
            }
        }

        self.disable_polling(ieee);
        if interval_s == 0 {
            return;
        }

        let gateway = self.arc();
        let target = ieee.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if gateway.should_skip_poll(&target) {
                    continue;
                }
                let outcome = gateway.poll_device(&target).await;
                if !outcome.success {
                    tracing::warn!("[{}] poll failed: {:?}", target, outcome.error);
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        });
        self.polling_tasks.lock().expect("gateway lock").insert(ieee.clone(), handle);
        tracing::info!("[{}] polling every {}s", ieee, interval_s);
    }

    pub fn polling_interval(&self, ieee: &Ieee) -> u64 {
        self.polling_intervals
            .lock()
            .expect("gateway lock")
            .get(ieee)
            .copied()
            .unwrap_or(0)
    }

    fn disable_polling(&self, ieee: &Ieee) {
        if let Some(handle) = self.polling_tasks.lock().expect("gateway lock").remove(ieee) {
            handle.abort();
        }
    }

    /// Skip conditions checked at every tick, in the order they rule
    /// devices out.
    fn should_skip_poll(&self, ieee: &Ieee) -> bool {
        let Some(device) = self.devices.get(ieee) else { return true };
        // Battery-powered passive sensors report on their own schedule.
        if device.is_passive() {
            return true;
        }
        // A moving cover lies about its position mid-travel.
        if device.capabilities.has(Capability::Cover) {
            if let Some(state) = device.state.get("state").and_then(|v| v.as_str()) {
                if state == "opening" || state == "closing" {
                    return true;
                }
            }
        }
        // A heating TRV with active demand should not be disturbed.
        if device.capabilities.has(Capability::Thermostat) && device.is_battery_powered() {
            if let Some(demand) = device.state.get("pi_heating_demand").and_then(|v| v.as_f64()) {
                if demand > 0.0 {
                    return true;
                }
            }
        }
        if !device.is_available() {
            return true;
        }
        false
    }

    // ── Announcements ───────────────────────────────────

    fn device_info(&self, ieee: &Ieee) -> Option<DeviceInfo> {
        let device = self.devices.get(ieee)?;
        Some(DeviceInfo {
            ieee: ieee.clone(),
            friendly_name: self.friendly_name(ieee),
            safe_name: self.device_safe_name(ieee),
            model: device.model.clone().unwrap_or_else(|| "Unknown".into()),
            manufacturer: device.manufacturer.clone().unwrap_or_else(|| "Unknown".into()),
        })
    }

    /// Discovery plus a retained initial state that stays `available:
    /// false` until the device actually reports.
    pub fn announce_device(&self, ieee: &Ieee) {
        let Some(info) = self.device_info(ieee) else { return };
        let Some(device) = self.devices.get(ieee) else { return };
        let entities = device.discovery_entities();
        let mut initial = device.state.clone();
        drop(device);

        self.mqtt.publish_discovery(&info, &entities);

        initial.insert("available".into(), json!(false));
        initial.retain(|key, _| !is_internal_field(key));
        self.mqtt.publish_state(&info.safe_name, &initial, None);
    }

    /// Announce every device and group, paced to avoid flooding the
    /// broker.
    pub async fn announce_all_devices(&self) {
        let ieees: Vec<Ieee> = self.devices.iter().map(|e| e.key().clone()).collect();
        tracing::info!("Announcing {} devices to Home Assistant", ieees.len());
        for ieee in ieees {
            self.announce_device(&ieee);
            tokio::time::sleep(ANNOUNCE_PACING).await;
        }
        for group in self.groups.groups() {
            self.groups.publish_discovery(&group);
            tokio::time::sleep(ANNOUNCE_PACING).await;
        }
        self.publish_zone_discovery();
    }

    // ── Zones surface ───────────────────────────────────

    fn publish_zone_discovery(&self) {
        for name in self.zones.zone_names() {
            let object_id = safe_name(&name).to_lowercase().replace(' ', "_");
            let topic =
                format!("homeassistant/binary_sensor/waggle_zone_{object_id}/occupancy/config");
            let state_topic = format!("{}/zone/{}", self.mqtt.base_topic(), object_id);
            let config = json!({
                "name": format!("{name} occupancy"),
                "unique_id": format!("waggle_zone_{object_id}_occupancy"),
                "device_class": "occupancy",
                "state_topic": state_topic,
                "payload_on": "occupied",
                "payload_off": "vacant",
                "availability": [{
                    "topic": self.mqtt.bridge_state_topic(),
                    "payload_available": "online",
                    "payload_not_available": "offline",
                }],
            });
            let body = serde_json::to_vec(&config).unwrap_or_default();
            self.mqtt.queue.publish_nowait(&topic, body, 1, true);
        }
    }

    fn publish_zone_state(&self, zone: &str, state: &str) {
        let object_id = safe_name(zone).to_lowercase().replace(' ', "_");
        let topic = format!("{}/zone/{}", self.mqtt.base_topic(), object_id);
        self.mqtt.queue.publish_nowait(&topic, state.as_bytes().to_vec(), 0, true);
    }

    // ── Admin operations ────────────────────────────────

    pub async fn permit_join(&self, duration_s: u8, target: Option<&Ieee>) -> CommandOutcome {
        let Some(driver) = self.radio_driver() else {
            return CommandOutcome::err("radio not started");
        };
        match driver.permit_join(duration_s, target).await {
            Ok(()) => {
                *self.permit_until.lock().expect("gateway lock") = if duration_s > 0 {
                    Some(Instant::now() + Duration::from_secs(duration_s as u64))
                } else {
                    None
                };
                tracing::info!("Permit join for {}s", duration_s);
                CommandOutcome::ok()
            }
            Err(e) => CommandOutcome::err(e.to_string()),
        }
    }

    pub fn pairing_active(&self) -> bool {
        self.permit_until
            .lock()
            .expect("gateway lock")
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub async fn remove_device(&self, ieee: &Ieee, force: bool) -> CommandOutcome {
        let Some(driver) = self.radio_driver() else {
            return CommandOutcome::err("radio not started");
        };
        if !self.devices.contains_key(ieee) {
            return CommandOutcome::err(format!("Device not found: {ieee}"));
        }
        if !force {
            if let Err(e) = driver.leave(ieee).await {
                tracing::warn!("[{}] leave failed: {} — removing anyway", ieee, e);
            }
        }
        if let Err(e) = driver.remove(ieee).await {
            return CommandOutcome::err(e.to_string());
        }
        self.on_device_removed(ieee);
        CommandOutcome::ok()
    }

    pub async fn ban_device(&self, ieee: &Ieee, reason: Option<&str>) -> CommandOutcome {
        let newly_banned = self.bans.ban(ieee, reason);
        // A currently joined device gets kicked immediately.
        if newly_banned && self.devices.contains_key(ieee) {
            let _ = self.remove_device(ieee, false).await;
        }
        CommandOutcome { success: newly_banned, error: None }
    }

    pub fn unban_device(&self, ieee: &Ieee) -> CommandOutcome {
        CommandOutcome { success: self.bans.unban(ieee), error: None }
    }

    pub async fn bind_devices(&self, source: &Ieee, target: &Ieee, cluster: u16) -> CommandOutcome {
        let Some(driver) = self.radio_driver() else {
            return CommandOutcome::err("radio not started");
        };
        let endpoint = self
            .devices
            .get(source)
            .and_then(|d| {
                d.endpoints
                    .iter()
                    .find(|ep| {
                        ep.input_clusters.contains(&cluster)
                            || ep.output_clusters.contains(&cluster)
                    })
                    .map(|ep| ep.id)
            })
            .unwrap_or(1);
        match driver.bind(source, endpoint, cluster, target).await {
            Ok(()) => CommandOutcome::ok(),
            Err(e) => CommandOutcome::err(e.to_string()),
        }
    }
}

/// Internal fields never published to MQTT: raw values, opaque attribute
/// keys, and generic cluster keys.
fn is_internal_field(key: &str) -> bool {
    key.ends_with("_raw")
        || key.starts_with("attr_")
        || (key.starts_with("cluster_") && (key.contains("_attr_") || key.contains("_cmd_")))
}

/// Assemble the outgoing MQTT payload from a changed delta: mandatory
/// metadata, multi-endpoint fix-ups, contact inversion, internal-field
/// stripping.
fn build_state_payload(
    device: &Device,
    changed: &Map<String, Value>,
    endpoint_id: Option<u8>,
) -> Map<String, Value> {
    let mut payload = changed.clone();
    payload.insert("available".into(), json!(device.is_available()));
    payload.insert("linkquality".into(), json!(device.lqi));
    payload.insert("lqi".into(), json!(device.lqi));
    payload.insert("last_seen".into(), json!(device.last_seen));

    // Multi-endpoint devices publish every endpoint state they hold.
    for (key, value) in &device.state {
        if (key.starts_with("state_") || key.starts_with("on_")) && !payload.contains_key(key) {
            payload.insert(key.clone(), value.clone());
        }
    }

    // Promote the sending endpoint's state to the plain field.
    if let Some(ep) = endpoint_id {
        let state_key = format!("state_{ep}");
        if let Some(state) = payload.get(&state_key).cloned() {
            payload.insert("state".into(), state);
            if let Some(on) = payload.get(&format!("on_{ep}")).cloned() {
                payload.insert("on".into(), on);
            }
        }
    }

    // Contact sensors publish HA door sense: the native value flips.
    if device.capabilities.has(Capability::ContactSensor) {
        let contact_keys: Vec<String> = payload
            .keys()
            .filter(|k| *k == "contact" || k.starts_with("contact_"))
            .cloned()
            .collect();
        for key in contact_keys {
            if let Some(raw) = payload.get(&key).and_then(|v| v.as_bool()) {
                let open = !raw;
                payload.insert(key.clone(), json!(open));
                let suffix = key.strip_prefix("contact_");
                let (open_key, closed_key) = match suffix {
                    Some(ep) => (format!("is_open_{ep}"), format!("is_closed_{ep}")),
                    None => ("is_open".to_string(), "is_closed".to_string()),
                };
                payload.insert(open_key, json!(open));
                payload.insert(closed_key, json!(!open));
            }
        }
    }

    // Motion fields never leak from devices that cannot produce them.
    if !device.capabilities.has(Capability::MotionSensor) {
        for key in ["occupancy", "motion", "presence"] {
            payload.remove(key);
        }
    }

    payload.retain(|key, _| !is_internal_field(key));
    crate::storage::sanitise_state(&payload)
}

// ── Directory adapters ──────────────────────────────────

/// One adapter serves automation, zones and groups their read-only view
/// of the device table.
pub struct GatewayDirectory(pub Arc<Gateway>);

impl StateProvider for GatewayDirectory {
    fn device_exists(&self, ieee: &Ieee) -> bool {
        self.0.devices.contains_key(ieee)
    }
    fn device_state(&self, ieee: &Ieee) -> Option<Map<String, Value>> {
        self.0.device_state(ieee)
    }
}

impl ZoneDirectory for GatewayDirectory {
    fn is_router(&self, ieee: &Ieee) -> bool {
        self.0
            .devices
            .get(ieee)
            .map(|d| matches!(d.role, DeviceRole::Router | DeviceRole::Coordinator))
            .unwrap_or(false)
    }
}

impl GroupDirectory for GatewayDirectory {
    fn device_exists(&self, ieee: &Ieee) -> bool {
        self.0.devices.contains_key(ieee)
    }
    fn capabilities(&self, ieee: &Ieee) -> Vec<Capability> {
        self.0.devices.get(ieee).map(|d| d.capabilities.all()).unwrap_or_default()
    }
    fn endpoint_for_cluster(&self, ieee: &Ieee, cluster: u16) -> Option<u8> {
        self.0.devices.get(ieee).and_then(|d| {
            d.endpoints
                .iter()
                .find(|ep| ep.id != 0 && ep.input_clusters.contains(&cluster))
                .map(|ep| ep.id)
        })
    }
    fn device_state(&self, ieee: &Ieee) -> Option<Map<String, Value>> {
        self.0.device_state(ieee)
    }
    fn is_available(&self, ieee: &Ieee) -> bool {
        self.0.devices.get(ieee).map(|d| d.is_available()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_queue::testing::RecordingSink;
    use crate::radio::{EndpointDescriptor, SimulatedRadio};

    const SENSOR: &str = "00:11:22:33:44:55:66:77";
    const BULB: &str = "aa:aa:aa:aa:aa:aa:aa:01";
    const BANNED: &str = "aa:bb:cc:dd:ee:ff:00:11";

    fn ieee(raw: &str) -> Ieee {
        Ieee::parse(raw).unwrap()
    }

    fn descriptor(raw: &str, clusters: &[u16]) -> DeviceDescriptor {
        DeviceDescriptor {
            ieee: ieee(raw),
            nwk: 0x1000,
            manufacturer: Some("Acme".into()),
            model: Some("Widget".into()),
            role: DeviceRole::Router,
            power_source: Some("Mains".into()),
            endpoints: vec![EndpointDescriptor {
                id: 1,
                profile: 0x0104,
                input_clusters: clusters.to_vec(),
                output_clusters: vec![],
            }],
        }
    }

    /// A gateway wired to a simulated radio with a recording MQTT sink,
    /// command grace already lifted.
    async fn harness(
    ) -> (tempfile::TempDir, Arc<Gateway>, Arc<SimulatedRadio>, Arc<RecordingSink>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.data_dir = dir.path().to_string_lossy().to_string();

        let gateway = Gateway::new(config);
        let sink = Arc::new(RecordingSink::default());
        gateway.mqtt.queue.start(sink.clone());

        let radio = Arc::new(SimulatedRadio::new());
        gateway.attach_radio(radio.clone() as Arc<dyn RadioDriver>).await;
        gateway.set_accepting_commands(true);
        (dir, gateway, radio, sink)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn banned_device_is_kicked_not_added() {
        let (_dir, gateway, radio, _sink) = harness().await;
        let banned = ieee(BANNED);
        gateway.bans.ban(&banned, Some("test"));

        let mut bus = gateway.events.subscribe();
        radio.inject_join(descriptor(BANNED, &[cid::ON_OFF]));
        settle().await;

        assert!(!gateway.has_device(&banned), "banned device must not enter the table");
        assert!(radio.left.lock().unwrap().contains(&banned), "leave must be sent");

        let mut saw_security_event = false;
        while let Ok(event) = bus.try_recv() {
            if matches!(event, GatewayEvent::BannedJoinBlocked { ref ieee } if *ieee == banned) {
                saw_security_event = true;
            }
        }
        assert!(saw_security_event);
    }

    #[tokio::test]
    async fn join_initialise_and_report_flows_to_mqtt() {
        let (_dir, gateway, radio, sink) = harness().await;
        radio.inject_join(descriptor(SENSOR, &[cid::TEMPERATURE_MEASUREMENT]));
        settle().await;
        assert!(gateway.has_device(&ieee(SENSOR)));

        radio.inject_report(&ieee(SENSOR), 1, cid::TEMPERATURE_MEASUREMENT, 0x0000, json!(2150));
        settle().await;

        let topic = format!("zigbee/{}", SENSOR);
        let payload = sink.payload_for(&topic).expect("state published");
        let parsed: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["temperature"], json!(21.5));
        assert_eq!(parsed["available"], json!(true));
        assert!(parsed.get("linkquality").is_some());
        assert!(parsed.get("last_seen").is_some());
    }

    #[tokio::test]
    async fn motion_triggers_automation_with_optimistic_echo() {
        let (_dir, gateway, radio, sink) = harness().await;
        radio.inject_join(descriptor(SENSOR, &[cid::OCCUPANCY_SENSING]));
        radio.inject_join(descriptor(BULB, &[cid::ON_OFF]));
        settle().await;

        let rule = crate::automation::Rule {
            id: String::new(),
            name: "motion light".into(),
            enabled: true,
            source_ieee: ieee(SENSOR),
            conditions: vec![crate::automation::Condition {
                attribute: "occupancy".into(),
                operator: crate::automation::Operator::Eq,
                value: json!(true),
                sustain: None,
            }],
            prerequisites: vec![],
            target_ieee: ieee(BULB),
            action: crate::automation::RuleAction {
                command: "on".into(),
                value: None,
                endpoint_id: None,
                delay: 0.0,
            },
            cooldown: 5.0,
            created: 0.0,
        };
        let provider = GatewayDirectory(Arc::clone(&gateway));
        assert!(gateway.automation.add_rule(rule, &provider).success);

        radio.sent.lock().unwrap().clear();
        radio.inject_report(&ieee(SENSOR), 1, cid::OCCUPANCY_SENSING, 0x0000, json!(1));
        settle().await;

        // (a) sensor state reached MQTT.
        let sensor_payload =
            sink.payload_for(&format!("zigbee/{SENSOR}")).expect("sensor published");
        let parsed: Value = serde_json::from_slice(&sensor_payload).unwrap();
        assert_eq!(parsed["occupancy"], json!(true));

        // (b) an OnOff `on` unicast reached the bulb.
        let sent = radio.sent.lock().unwrap().clone();
        assert!(sent
            .iter()
            .any(|c| c.ieee == ieee(BULB) && c.cluster == cid::ON_OFF && c.payload[2] == 0x01));

        // (c) the bulb's optimistic state reached MQTT.
        let bulb_payload = sink.payload_for(&format!("zigbee/{BULB}")).expect("bulb published");
        let parsed: Value = serde_json::from_slice(&bulb_payload).unwrap();
        assert_eq!(parsed["state"], json!("ON"));

        // (d) a repeat report inside the cooldown fires nothing new.
        radio.sent.lock().unwrap().clear();
        radio.inject_report(&ieee(SENSOR), 1, cid::OCCUPANCY_SENSING, 0x0000, json!(1));
        settle().await;
        assert!(radio.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn multi_endpoint_command_targets_one_endpoint() {
        let (_dir, gateway, radio, sink) = harness().await;
        let mut multi = descriptor(BULB, &[cid::ON_OFF]);
        multi.endpoints = vec![
            EndpointDescriptor {
                id: 1,
                profile: 0x0104,
                input_clusters: vec![cid::ON_OFF],
                output_clusters: vec![],
            },
            EndpointDescriptor {
                id: 2,
                profile: 0x0104,
                input_clusters: vec![cid::ON_OFF],
                output_clusters: vec![],
            },
        ];
        radio.inject_join(multi);
        settle().await;

        gateway.handle_mqtt_command(BULB, &json!({"state": "ON"}), Some("switch_1")).await;
        settle().await;

        // Unicast went to endpoint 1 only.
        let sent = radio.sent.lock().unwrap().clone();
        let onoff: Vec<_> = sent.iter().filter(|c| c.cluster == cid::ON_OFF).collect();
        assert_eq!(onoff.len(), 1);
        assert_eq!(onoff[0].endpoint, 1);

        // Optimistic delta carries both plain and suffixed fields.
        let payload = sink.payload_for(&format!("zigbee/{BULB}")).expect("state published");
        let parsed: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["state"], json!("ON"));
        assert_eq!(parsed["state_1"], json!("ON"));
        assert_eq!(parsed["on"], json!(true));
        assert_eq!(parsed["on_1"], json!(true));
    }

    #[tokio::test]
    async fn commands_are_ignored_during_grace_period() {
        let (_dir, gateway, radio, _sink) = harness().await;
        radio.inject_join(descriptor(BULB, &[cid::ON_OFF]));
        settle().await;

        gateway.set_accepting_commands(false);
        radio.sent.lock().unwrap().clear();
        gateway.handle_mqtt_command(BULB, &json!({"state": "ON"}), None).await;
        assert!(radio.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ha_birth_republishes_discovery_for_all_devices() {
        let (_dir, gateway, radio, sink) = harness().await;
        radio.inject_join(descriptor(SENSOR, &[cid::TEMPERATURE_MEASUREMENT]));
        radio.inject_join(descriptor(BULB, &[cid::ON_OFF]));
        settle().await;
        sink.messages.lock().unwrap().clear();

        gateway.announce_all_devices().await;
        settle().await;

        let topics = sink.topics();
        let sensor_node = ieee(SENSOR).node_id();
        let bulb_node = ieee(BULB).node_id();
        assert!(topics
            .iter()
            .any(|t| t == &format!("homeassistant/sensor/{sensor_node}/temperature/config")));
        assert!(topics
            .iter()
            .any(|t| t == &format!("homeassistant/switch/{bulb_node}/switch/config")));
        // Initial retained state goes out with available=false.
        let payload = sink.payload_for(&format!("zigbee/{BULB}")).expect("initial state");
        let parsed: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["available"], json!(false));
    }

    #[tokio::test]
    async fn discovery_removal_clears_retained_configs() {
        let (_dir, gateway, radio, sink) = harness().await;
        radio.inject_join(descriptor(BULB, &[cid::ON_OFF]));
        settle().await;

        let entities = gateway.devices.get(&ieee(BULB)).unwrap().discovery_entities();
        assert!(!entities.is_empty());
        let config_topic =
            format!("homeassistant/switch/{}/switch/config", ieee(BULB).node_id());

        gateway.mqtt.remove_discovery(&ieee(BULB), &entities);
        settle().await;

        // The retained config slot now holds an empty payload.
        let payload = sink.payload_for(&config_topic).expect("config topic touched");
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn resolver_accepts_any_identifier_shape() {
        let (_dir, gateway, radio, _sink) = harness().await;
        radio.inject_join(descriptor(SENSOR, &[cid::TEMPERATURE_MEASUREMENT]));
        settle().await;
        gateway.rename_device(&ieee(SENSOR), "Hall Sensor");

        let canonical = ieee(SENSOR);
        assert_eq!(gateway.resolve_identifier(SENSOR), Some(canonical.clone()));
        assert_eq!(gateway.resolve_identifier("0011223344556677"), Some(canonical.clone()));
        assert_eq!(
            gateway.resolve_identifier("00:11:22:33:44:55:66:77"),
            Some(canonical.clone())
        );
        assert_eq!(
            gateway.resolve_identifier("00:11:22:33:44:55:66:77".to_uppercase().as_str()),
            Some(canonical.clone())
        );
        assert_eq!(gateway.resolve_identifier("Hall Sensor"), Some(canonical.clone()));
        assert_eq!(gateway.resolve_identifier("hall sensor"), Some(canonical.clone()));
        assert_eq!(gateway.resolve_identifier("hall"), Some(canonical));
        assert_eq!(gateway.resolve_identifier("nonexistent-xyz"), None);
    }

    #[tokio::test]
    async fn command_failure_reports_error_and_counts() {
        let (_dir, gateway, radio, _sink) = harness().await;
        radio.inject_join(descriptor(BULB, &[cid::ON_OFF]));
        settle().await;

        radio.fail_next_send(RadioError::Stack("NOT_FOUND".into()));
        let outcome = gateway.send_command(&ieee(BULB), "on", None, None, None).await;
        assert!(!outcome.success);
        assert_eq!(gateway.stats.get(&ieee(BULB)).errors, 1);
    }

    #[tokio::test]
    async fn contact_published_in_ha_door_sense() {
        let (_dir, gateway, radio, sink) = harness().await;
        let mut magnet = descriptor(SENSOR, &[cid::IAS_ZONE]);
        magnet.manufacturer = Some("LUMI".into());
        magnet.model = Some("lumi.sensor_magnet.aq2".into());
        radio.inject_join(magnet);
        settle().await;

        // alarm_1 set: native contact true.
        radio.inject_report(&ieee(SENSOR), 1, cid::IAS_ZONE, 0x0002, json!(1));
        settle().await;

        let payload = sink.payload_for(&format!("zigbee/{SENSOR}")).expect("published");
        let parsed: Value = serde_json::from_slice(&payload).unwrap();
        // Pipeline inverts native sense to HA door sense.
        assert_eq!(parsed["contact"], json!(false));
        assert_eq!(parsed["is_open"], json!(false));
        assert_eq!(parsed["is_closed"], json!(true));
        let _ = gateway;
    }
}
