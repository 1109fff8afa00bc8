//! Threshold automation engine.
//!
//! Rules watch one source device and fire direct Zigbee commands at a
//! target, bypassing MQTT for latency. Conditions AND together with
//! optional sustain timers; prerequisites check other devices' current
//! state; a per-rule cooldown stops rapid refires. Evaluation is driven
//! by every state delta the gateway emits and returns the actions to
//! execute so the command path stays with the device layer.
//!
//! Persistence: `./data/automations.json`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::ieee::Ieee;
use crate::storage::DataDir;

pub const MAX_RULES_PER_DEVICE: usize = 10;
pub const MAX_CONDITIONS_PER_RULE: usize = 5;
pub const MAX_PREREQUISITES_PER_RULE: usize = 5;
pub const DEFAULT_COOLDOWN_S: f64 = 5.0;
const TRACE_CAPACITY: usize = 100;
const RULES_FILE: &str = "automations.json";

const VALID_COMMANDS: &[&str] = &[
    "on", "off", "toggle", "brightness", "color_temp", "open", "close", "stop", "position",
    "temperature",
];

// ── Rule model ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub attribute: String,
    pub operator: Operator,
    pub value: Value,
    /// Seconds the condition must hold continuously before it passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sustain: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prerequisite {
    pub ieee: Ieee,
    pub attribute: String,
    pub operator: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<u8>,
    #[serde(default)]
    pub delay: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source_ieee: Ieee,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    pub target_ieee: Ieee,
    pub action: RuleAction,
    #[serde(default = "default_cooldown")]
    pub cooldown: f64,
    #[serde(default)]
    pub created: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> f64 {
    DEFAULT_COOLDOWN_S
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// An action the gateway should execute (after `delay` seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub rule_id: String,
    pub rule_name: String,
    pub source_ieee: Ieee,
    pub target_ieee: Ieee,
    pub command: String,
    pub value: Option<Value>,
    pub endpoint_id: Option<u8>,
    pub delay: f64,
}

/// Uniform outcome for rule CRUD.
#[derive(Debug, Serialize)]
pub struct RuleOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<Rule>,
}

impl RuleOutcome {
    fn ok(rule: Rule) -> Self {
        Self { success: true, error: None, rule: Some(rule) }
    }
    fn err(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()), rule: None }
    }
}

/// Read-only view of device state the engine evaluates against.
pub trait StateProvider {
    fn device_exists(&self, ieee: &Ieee) -> bool;
    fn device_state(&self, ieee: &Ieee) -> Option<Map<String, Value>>;
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStats {
    pub evaluations: u64,
    pub matches: u64,
    pub executions: u64,
    pub execution_successes: u64,
    pub execution_failures: u64,
}

#[derive(Default)]
struct EngineState {
    rules: Vec<Rule>,
    source_index: HashMap<Ieee, Vec<String>>,
    cooldowns: HashMap<String, Instant>,
    sustain: HashMap<String, Instant>,
    trace: VecDeque<Value>,
    stats: EngineStats,
}

pub struct AutomationEngine {
    data: DataDir,
    state: Mutex<EngineState>,
}

impl AutomationEngine {
    pub fn load(data: DataDir) -> Self {
        let file: RulesFile = data.load_json(RULES_FILE);
        let mut state = EngineState { rules: file.rules, ..Default::default() };
        rebuild_index(&mut state);
        tracing::info!("Automation engine initialised with {} rule(s)", state.rules.len());
        Self { data, state: Mutex::new(state) }
    }

    fn save(&self, state: &EngineState) {
        self.data.save_json(RULES_FILE, &RulesFile { rules: state.rules.clone() });
    }

    // ── CRUD ────────────────────────────────────────────

    pub fn add_rule(
        &self,
        mut rule: Rule,
        provider: &dyn StateProvider,
    ) -> RuleOutcome {
        if rule.conditions.is_empty() {
            return RuleOutcome::err("conditions must be a non-empty list");
        }
        if rule.conditions.len() > MAX_CONDITIONS_PER_RULE {
            return RuleOutcome::err(format!("Maximum {MAX_CONDITIONS_PER_RULE} conditions per rule"));
        }
        if rule.prerequisites.len() > MAX_PREREQUISITES_PER_RULE {
            return RuleOutcome::err(format!("Maximum {MAX_PREREQUISITES_PER_RULE} prerequisites"));
        }
        if !VALID_COMMANDS.contains(&rule.action.command.as_str()) {
            return RuleOutcome::err(format!("Invalid command: {}", rule.action.command));
        }
        if !provider.device_exists(&rule.source_ieee) {
            return RuleOutcome::err(format!("Source device not found: {}", rule.source_ieee));
        }
        if !provider.device_exists(&rule.target_ieee) {
            return RuleOutcome::err(format!("Target device not found: {}", rule.target_ieee));
        }

        // Zero or negative sustain means no sustain at all.
        for condition in &mut rule.conditions {
            if matches!(condition.sustain, Some(s) if s <= 0.0) {
                condition.sustain = None;
            }
        }
        rule.action.delay = rule.action.delay.max(0.0);

        let mut state = self.state.lock().expect("automation lock");
        if state.source_index.get(&rule.source_ieee).map(|ids| ids.len()).unwrap_or(0)
            >= MAX_RULES_PER_DEVICE
        {
            return RuleOutcome::err(format!("Maximum {MAX_RULES_PER_DEVICE} rules per device"));
        }

        if rule.id.is_empty() {
            rule.id = format!("auto_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        }
        rule.created = crate::device::now_ms() as f64 / 1000.0;

        let summary: Vec<String> = rule
            .conditions
            .iter()
            .map(|c| format!("{} {:?} {}", c.attribute, c.operator, c.value))
            .collect();
        tracing::info!("Rule added: {} '{}' ({})", rule.id, rule.name, summary.join(" AND "));

        state.rules.push(rule.clone());
        rebuild_index(&mut state);
        self.save(&state);
        RuleOutcome::ok(rule)
    }

    pub fn delete_rule(&self, rule_id: &str) -> RuleOutcome {
        let mut state = self.state.lock().expect("automation lock");
        let Some(pos) = state.rules.iter().position(|r| r.id == rule_id) else {
            return RuleOutcome::err(format!("Rule not found: {rule_id}"));
        };
        let rule = state.rules.remove(pos);
        state.cooldowns.remove(rule_id);
        state.sustain.retain(|key, _| !key.starts_with(rule_id));
        rebuild_index(&mut state);
        self.save(&state);
        RuleOutcome::ok(rule)
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> RuleOutcome {
        let mut state = self.state.lock().expect("automation lock");
        let Some(rule) = state.rules.iter_mut().find(|r| r.id == rule_id) else {
            return RuleOutcome::err(format!("Rule not found: {rule_id}"));
        };
        rule.enabled = enabled;
        let rule = rule.clone();
        self.save(&state);
        RuleOutcome::ok(rule)
    }

    pub fn rules(&self, source: Option<&Ieee>) -> Vec<Rule> {
        let state = self.state.lock().expect("automation lock");
        state
            .rules
            .iter()
            .filter(|r| source.map(|s| &r.source_ieee == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        self.state.lock().expect("automation lock").stats.clone()
    }

    pub fn trace_log(&self) -> Vec<Value> {
        self.state.lock().expect("automation lock").trace.iter().cloned().collect()
    }

    // ── Evaluation ──────────────────────────────────────

    /// Evaluate one state delta. Returns the actions that fired; the
    /// caller dispatches them and reports back via `record_result`.
    pub fn evaluate(
        &self,
        source: &Ieee,
        changed: &Map<String, Value>,
        provider: &dyn StateProvider,
    ) -> Vec<PendingAction> {
        let mut state = self.state.lock().expect("automation lock");
        let Some(rule_ids) = state.source_index.get(source).cloned() else {
            return Vec::new();
        };
        state.stats.evaluations += 1;

        let full_state = provider.device_state(source).unwrap_or_default();
        let now = Instant::now();
        let mut fired = Vec::new();

        for rule_id in rule_ids {
            let Some(rule) = state.rules.iter().find(|r| r.id == rule_id).cloned() else {
                continue;
            };
            if !rule.enabled || rule.conditions.is_empty() {
                continue;
            }

            // Relevance: skip unless the delta touches a watched attribute.
            if !rule.conditions.iter().any(|c| changed.contains_key(&c.attribute)) {
                continue;
            }

            // Conditions, AND with short-circuit and sustain tracking.
            let mut all_matched = true;
            let mut sustain_pending = false;
            for (index, condition) in rule.conditions.iter().enumerate() {
                let current = changed
                    .get(&condition.attribute)
                    .or_else(|| full_state.get(&condition.attribute));
                let Some(current) = current else {
                    all_matched = false;
                    break;
                };

                let matched = evaluate_condition(current, condition.operator, &condition.value);
                let sustain_key = format!("{}_{}", rule.id, index);

                if matched {
                    if let Some(sustain) = condition.sustain {
                        let first = *state.sustain.entry(sustain_key.clone()).or_insert(now);
                        let elapsed = now.duration_since(first).as_secs_f64();
                        if elapsed < sustain {
                            trace(&mut state, json!({
                                "rule_id": rule.id,
                                "phase": "evaluate",
                                "result": "SUSTAIN_WAIT",
                                "attribute": condition.attribute,
                                "sustain_required": sustain,
                                "sustain_elapsed": elapsed,
                            }));
                            sustain_pending = true;
                            all_matched = false;
                            break;
                        }
                    } else {
                        state.sustain.remove(&sustain_key);
                    }
                } else {
                    // Any interruption resets the sustain timer.
                    state.sustain.remove(&sustain_key);
                    all_matched = false;
                    break;
                }
            }

            if !all_matched {
                if !sustain_pending {
                    trace(&mut state, json!({
                        "rule_id": rule.id,
                        "phase": "evaluate",
                        "result": "NO_MATCH",
                        "source_ieee": rule.source_ieee,
                    }));
                }
                continue;
            }

            // Prerequisites against other devices' current state.
            let mut prereqs_met = true;
            for prereq in &rule.prerequisites {
                let actual = provider
                    .device_state(&prereq.ieee)
                    .and_then(|s| s.get(&prereq.attribute).cloned());
                let passed = match actual {
                    Some(value) => evaluate_condition(&value, prereq.operator, &prereq.value),
                    None => false,
                };
                if !passed {
                    prereqs_met = false;
                    break;
                }
            }
            if !prereqs_met {
                trace(&mut state, json!({
                    "rule_id": rule.id,
                    "phase": "prerequisite",
                    "result": "PREREQ_FAIL",
                }));
                continue;
            }

            state.stats.matches += 1;

            // Cooldown.
            if let Some(last) = state.cooldowns.get(&rule.id) {
                let elapsed = now.duration_since(*last).as_secs_f64();
                if elapsed < rule.cooldown {
                    trace(&mut state, json!({
                        "rule_id": rule.id,
                        "phase": "cooldown",
                        "result": "BLOCKED",
                        "elapsed": elapsed,
                        "cooldown": rule.cooldown,
                    }));
                    continue;
                }
            }

            state.cooldowns.insert(rule.id.clone(), now);
            for index in 0..rule.conditions.len() {
                state.sustain.remove(&format!("{}_{}", rule.id, index));
            }

            trace(&mut state, json!({
                "rule_id": rule.id,
                "phase": "execute",
                "result": "FIRING",
                "source_ieee": rule.source_ieee,
                "target_ieee": rule.target_ieee,
                "command": rule.action.command,
                "delay": rule.action.delay,
            }));

            fired.push(PendingAction {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                source_ieee: rule.source_ieee.clone(),
                target_ieee: rule.target_ieee.clone(),
                command: rule.action.command.clone(),
                value: rule.action.value.clone(),
                endpoint_id: rule.action.endpoint_id,
                delay: rule.action.delay,
            });
        }

        fired
    }

    /// Record the execution outcome for the trace ring and stats.
    pub fn record_result(&self, rule_id: &str, success: bool, error: Option<&str>) {
        let mut state = self.state.lock().expect("automation lock");
        state.stats.executions += 1;
        if success {
            state.stats.execution_successes += 1;
        } else {
            state.stats.execution_failures += 1;
        }
        trace(&mut state, json!({
            "rule_id": rule_id,
            "phase": "result",
            "result": if success { "SUCCESS" } else { "COMMAND_FAILED" },
            "error": error,
        }));
    }
}

fn rebuild_index(state: &mut EngineState) {
    state.source_index.clear();
    for rule in &state.rules {
        state
            .source_index
            .entry(rule.source_ieee.clone())
            .or_default()
            .push(rule.id.clone());
    }
}

fn trace(state: &mut EngineState, mut entry: Value) {
    if let Some(object) = entry.as_object_mut() {
        object.insert("timestamp".into(), json!(crate::device::now_ms()));
    }
    state.trace.push_back(entry);
    while state.trace.len() > TRACE_CAPACITY {
        state.trace.pop_front();
    }
}

// ── Value normalisation and comparison ──────────────────

/// Strings holding numbers become numbers, literal "true"/"false" become
/// bools. "ON"/"OFF" stay strings so eq/neq can match case-insensitively.
pub fn normalise_value(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let stripped = s.trim().trim_matches(|c| c == '\'' || c == '"');
            match stripped.to_lowercase().as_str() {
                "true" => return json!(true),
                "false" => return json!(false),
                _ => {}
            }
            if stripped.contains('.') {
                if let Ok(f) = stripped.parse::<f64>() {
                    return json!(f);
                }
            } else if let Ok(i) = stripped.parse::<i64>() {
                return json!(i);
            }
            json!(stripped)
        }
        other => other.clone(),
    }
}

pub fn evaluate_condition(actual: &Value, operator: Operator, threshold: &Value) -> bool {
    let mut actual = normalise_value(actual);
    let mut threshold = normalise_value(threshold);

    // String eq/neq compares case-insensitively.
    if let (Value::String(a), Value::String(t)) = (&actual, &threshold) {
        match operator {
            Operator::Eq => return a.to_lowercase() == t.to_lowercase(),
            Operator::Neq => return a.to_lowercase() != t.to_lowercase(),
            _ => {}
        }
    }

    // Bool vs ON/OFF string: convert the string side.
    if actual.is_boolean() {
        if let Value::String(t) = &threshold {
            threshold = json!(matches!(t.to_lowercase().as_str(), "on" | "true"));
        }
    } else if threshold.is_boolean() {
        if let Value::String(a) = &actual {
            actual = json!(matches!(a.to_lowercase().as_str(), "on" | "true"));
        }
    }

    if let (Some(a), Some(t)) = (as_number(&actual), as_number(&threshold)) {
        return match operator {
            Operator::Eq => a == t,
            Operator::Neq => a != t,
            Operator::Gt => a > t,
            Operator::Lt => a < t,
            Operator::Gte => a >= t,
            Operator::Lte => a <= t,
        };
    }

    // Last resort: lowercase string comparison.
    let a = value_as_string(&actual).to_lowercase();
    let t = value_as_string(&threshold).to_lowercase();
    match operator {
        Operator::Eq => a == t,
        Operator::Neq => a != t,
        Operator::Gt => a > t,
        Operator::Lt => a < t,
        Operator::Gte => a >= t,
        Operator::Lte => a <= t,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    struct FakeProvider {
        states: StdHashMap<Ieee, Map<String, Value>>,
    }

    impl FakeProvider {
        fn new(devices: &[(&str, Value)]) -> Self {
            let mut states = StdHashMap::new();
            for (raw, state) in devices {
                let map = state.as_object().cloned().unwrap_or_default();
                states.insert(Ieee::parse(raw).unwrap(), map);
            }
            Self { states }
        }
    }

    impl StateProvider for FakeProvider {
        fn device_exists(&self, ieee: &Ieee) -> bool {
            self.states.contains_key(ieee)
        }
        fn device_state(&self, ieee: &Ieee) -> Option<Map<String, Value>> {
            self.states.get(ieee).cloned()
        }
    }

    const SENSOR: &str = "00:11:22:33:44:55:66:77";
    const BULB: &str = "aa:aa:aa:aa:aa:aa:aa:01";
    const OTHER: &str = "bb:bb:bb:bb:bb:bb:bb:02";

    fn engine() -> (tempfile::TempDir, AutomationEngine, FakeProvider) {
        let dir = tempfile::tempdir().unwrap();
        let engine = AutomationEngine::load(DataDir::new(dir.path()));
        let provider = FakeProvider::new(&[
            (SENSOR, json!({"occupancy": false})),
            (BULB, json!({"state": "OFF"})),
            (OTHER, json!({"illuminance_lux": 5})),
        ]);
        (dir, engine, provider)
    }

    fn motion_rule(sustain: Option<f64>, cooldown: f64) -> Rule {
        Rule {
            id: String::new(),
            name: "motion light".into(),
            enabled: true,
            source_ieee: Ieee::parse(SENSOR).unwrap(),
            conditions: vec![Condition {
                attribute: "occupancy".into(),
                operator: Operator::Eq,
                value: json!(true),
                sustain,
            }],
            prerequisites: Vec::new(),
            target_ieee: Ieee::parse(BULB).unwrap(),
            action: RuleAction { command: "on".into(), value: None, endpoint_id: None, delay: 0.0 },
            cooldown,
            created: 0.0,
        }
    }

    fn delta(fields: Value) -> Map<String, Value> {
        fields.as_object().cloned().unwrap()
    }

    #[test]
    fn rule_fires_on_matching_delta() {
        let (_dir, engine, provider) = engine();
        let added = engine.add_rule(motion_rule(None, 5.0), &provider);
        assert!(added.success);

        let source = Ieee::parse(SENSOR).unwrap();
        let actions = engine.evaluate(&source, &delta(json!({"occupancy": true})), &provider);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].command, "on");
        assert_eq!(actions[0].target_ieee, Ieee::parse(BULB).unwrap());
    }

    #[test]
    fn unrelated_delta_is_skipped() {
        let (_dir, engine, provider) = engine();
        engine.add_rule(motion_rule(None, 5.0), &provider);
        let source = Ieee::parse(SENSOR).unwrap();
        let actions = engine.evaluate(&source, &delta(json!({"battery": 80})), &provider);
        assert!(actions.is_empty());
    }

    #[test]
    fn cooldown_blocks_refire() {
        let (_dir, engine, provider) = engine();
        engine.add_rule(motion_rule(None, 5.0), &provider);
        let source = Ieee::parse(SENSOR).unwrap();
        let changed = delta(json!({"occupancy": true}));

        assert_eq!(engine.evaluate(&source, &changed, &provider).len(), 1);
        // Any number of crossings inside the window stay quiet.
        assert!(engine.evaluate(&source, &changed, &provider).is_empty());
        assert!(engine.evaluate(&source, &changed, &provider).is_empty());
    }

    #[test]
    fn sustain_waits_then_fires() {
        let (_dir, engine, provider) = engine();
        engine.add_rule(motion_rule(Some(0.05), 0.0), &provider);
        let source = Ieee::parse(SENSOR).unwrap();
        let changed = delta(json!({"occupancy": true}));

        assert!(engine.evaluate(&source, &changed, &provider).is_empty(), "sustain not elapsed");
        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(engine.evaluate(&source, &changed, &provider).len(), 1);
    }

    #[test]
    fn sustain_interruption_resets_timer() {
        let (_dir, engine, provider) = engine();
        engine.add_rule(motion_rule(Some(0.05), 0.0), &provider);
        let source = Ieee::parse(SENSOR).unwrap();

        assert!(engine.evaluate(&source, &delta(json!({"occupancy": true})), &provider).is_empty());
        std::thread::sleep(Duration::from_millis(30));
        // One non-matching tick clears the first-crossing timestamp.
        assert!(engine.evaluate(&source, &delta(json!({"occupancy": false})), &provider).is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert!(
            engine.evaluate(&source, &delta(json!({"occupancy": true})), &provider).is_empty(),
            "timer restarted, 30ms is not enough"
        );
    }

    #[test]
    fn prerequisite_failure_aborts() {
        let (_dir, engine, provider) = engine();
        let mut rule = motion_rule(None, 5.0);
        rule.prerequisites.push(Prerequisite {
            ieee: Ieee::parse(OTHER).unwrap(),
            attribute: "illuminance_lux".into(),
            operator: Operator::Lt,
            value: json!(3),
        });
        engine.add_rule(rule, &provider);

        let source = Ieee::parse(SENSOR).unwrap();
        // Other device reads 5 lux, prerequisite wants < 3.
        assert!(engine.evaluate(&source, &delta(json!({"occupancy": true})), &provider).is_empty());
    }

    #[test]
    fn normalisation_rules() {
        assert_eq!(normalise_value(&json!("true")), json!(true));
        assert_eq!(normalise_value(&json!("21.5")), json!(21.5));
        assert_eq!(normalise_value(&json!("42")), json!(42));
        assert_eq!(normalise_value(&json!("ON")), json!("ON"));

        // ON/OFF compares case-insensitively for eq/neq.
        assert!(evaluate_condition(&json!("ON"), Operator::Eq, &json!("on")));
        assert!(evaluate_condition(&json!("off"), Operator::Neq, &json!("ON")));
        // Bool vs ON/OFF converts the string side.
        assert!(evaluate_condition(&json!(true), Operator::Eq, &json!("ON")));
        assert!(evaluate_condition(&json!("OFF"), Operator::Eq, &json!(false)));
        // Floats tolerate string thresholds.
        assert!(evaluate_condition(&json!(21.5), Operator::Gt, &json!("20")));
        // Bool actual vs literal true string.
        assert!(evaluate_condition(&json!(true), Operator::Eq, &json!("true")));
    }

    #[test]
    fn limits_are_enforced() {
        let (_dir, engine, provider) = engine();
        for _ in 0..MAX_RULES_PER_DEVICE {
            assert!(engine.add_rule(motion_rule(None, 5.0), &provider).success);
        }
        let overflow = engine.add_rule(motion_rule(None, 5.0), &provider);
        assert!(!overflow.success);

        let mut fat = motion_rule(None, 5.0);
        fat.conditions = (0..6)
            .map(|i| Condition {
                attribute: format!("f{i}"),
                operator: Operator::Eq,
                value: json!(1),
                sustain: None,
            })
            .collect();
        assert!(!engine.add_rule(fat, &provider).success);

        let mut bad = motion_rule(None, 5.0);
        bad.action.command = "explode".into();
        assert!(!engine.add_rule(bad, &provider).success);
    }

    #[test]
    fn rules_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new(&[
            (SENSOR, json!({})),
            (BULB, json!({})),
        ]);
        let rule_id = {
            let engine = AutomationEngine::load(DataDir::new(dir.path()));
            let outcome = engine.add_rule(motion_rule(None, 5.0), &provider);
            outcome.rule.unwrap().id
        };
        let engine = AutomationEngine::load(DataDir::new(dir.path()));
        let rules = engine.rules(None);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, rule_id);
    }

    #[test]
    fn delete_clears_cooldown_and_index() {
        let (_dir, engine, provider) = engine();
        let id = engine.add_rule(motion_rule(None, 5.0), &provider).rule.unwrap().id;
        let source = Ieee::parse(SENSOR).unwrap();
        engine.evaluate(&source, &delta(json!({"occupancy": true})), &provider);

        assert!(engine.delete_rule(&id).success);
        assert!(engine.rules(None).is_empty());
        assert!(engine.evaluate(&source, &delta(json!({"occupancy": true})), &provider).is_empty());
    }

    #[test]
    fn trace_ring_is_bounded() {
        let (_dir, engine, provider) = engine();
        engine.add_rule(motion_rule(None, 0.0), &provider);
        let source = Ieee::parse(SENSOR).unwrap();
        for _ in 0..150 {
            engine.evaluate(&source, &delta(json!({"occupancy": true})), &provider);
        }
        assert!(engine.trace_log().len() <= TRACE_CAPACITY);
    }
}
