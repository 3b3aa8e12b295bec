//! # Controllable consumers
//!
//! Every consumer shares the same admission state machine and eligibility
//! rules; the five variants only differ in how they read their device
//! ("is it running, does it need energy, is that need critical") and in the
//! commands that start or stop it.
//!
//! ```text
//!   Off ──needs──▶ NeedsEnergy ──emergency──▶ CriticallyNeedsEnergy
//!    ▲                 │                              │
//!    └──── stopped ─── Running ◀──────── started ─────┘
//! ```

mod appliance;
mod cooling;
mod dynamic;
mod sg_ready;
mod simple;

pub use appliance::ApplianceConsumer;
pub use cooling::CoolingConsumer;
pub use dynamic::{DynamicConsumer, DynamicLimits};
pub use sg_ready::SgReadyConsumer;
pub use simple::SimpleConsumer;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::Display;
use tracing::info;
use validator::Validate;

use super::grid::LoadEstimateMethod;
use super::sample::{LatestValue, SensorSample, SlidingWindow};
use super::time_window::TimeWindow;
use crate::config::{ConfigError, ConsumerConfig, ConsumerKind};
use crate::hardware::{Command, SignalValue};

/// Re-blocking is suppressed this long after a timeout unblock when the
/// consumer has no minimum runtime of its own.
const DEFAULT_REBLOCK_GRACE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdmissionState {
    #[default]
    Off,
    NeedsEnergy,
    CriticallyNeedsEnergy,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BlockReason {
    PeakLoad,
    /// Scheduled blackout; lifted only when the window ends
    TimeWindow,
    /// Stopped so a member of a group it balances for could run
    Delegated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub since: DateTime<Utc>,
    pub reason: BlockReason,
}

/// Whether a consumer may count the battery's discharge power as headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AllowBatteryPower {
    #[default]
    No,
    Yes,
    WhenCritical,
}

/// Persisted consumer record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerState {
    pub admission: AdmissionState,
    pub started_at: Option<DateTime<Utc>>,
    /// When the consumer last stopped running
    pub last_run_at: Option<DateTime<Utc>>,
    pub block: Option<Block>,
    pub unblocked_at: Option<DateTime<Utc>>,
    pub reblock_grace_until: Option<DateTime<Utc>>,
    pub boosted: bool,
    pub load_estimate: LoadEstimateMethod,
    pub balance_on_behalf_of: Option<String>,
    pub allow_battery_power: AllowBatteryPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerSignal {
    Switch,
    Power,
    /// Forced-run flag
    CriticalFlag,
    /// Gate sensor of a time window
    Gate,
    Temperature,
    ApplianceState,
    DeviceState,
    DeviceMode,
    ChargerStatus,
    ChargerCurrent,
}

/// What a variant reads from its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Evaluation {
    pub running: bool,
    pub needs_energy: bool,
    pub critical: bool,
}

/// Common signals a variant may need when evaluating or building commands
#[derive(Debug, Clone, Copy)]
pub struct SignalContext<'a> {
    pub switch: Option<&'a str>,
    pub switch_on: Option<bool>,
    pub power_w: Option<f64>,
}

impl SignalContext<'_> {
    /// Switch command unless the switch already reports the wanted state.
    pub fn switch_command(&self, on: bool) -> Option<Command> {
        let entity = self.switch?;
        if self.switch_on == Some(on) {
            return None;
        }
        Some(if on {
            Command::turn_on(entity)
        } else {
            Command::turn_off(entity)
        })
    }
}

pub(crate) trait VariantBehavior {
    fn inputs(&self) -> Vec<(String, ConsumerSignal)> {
        Vec::new()
    }

    fn ingest(&mut self, _signal: ConsumerSignal, _value: &SignalValue) {}

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Evaluation;

    /// Variant veto on being stopped by the controller.
    fn may_stop(&self) -> bool {
        true
    }

    /// Whether a long time without running makes the need critical.
    fn honors_max_timeout(&self) -> bool {
        true
    }

    fn start_commands(&self, ctx: &SignalContext<'_>) -> Vec<Command> {
        ctx.switch_command(true).into_iter().collect()
    }

    fn stop_commands(&self, ctx: &SignalContext<'_>) -> Vec<Command> {
        ctx.switch_command(false).into_iter().collect()
    }
}

#[derive(Debug, Clone)]
pub enum Variant {
    Simple(SimpleConsumer),
    Cooling(CoolingConsumer),
    Appliance(ApplianceConsumer),
    SgReady(SgReadyConsumer),
    Dynamic(DynamicConsumer),
}

impl Variant {
    fn from_config(cfg: &ConsumerConfig) -> Result<Self, ConfigError> {
        let missing = |section: &'static str| ConfigError::MissingVariantConfig {
            id: cfg.id.clone(),
            kind: cfg.kind.to_string(),
            section,
        };
        let variant = match cfg.kind {
            ConsumerKind::Simple => {
                require_switch(cfg)?;
                Variant::Simple(SimpleConsumer)
            }
            ConsumerKind::Cooling => {
                require_switch(cfg)?;
                let section = cfg.cooling.clone().ok_or_else(|| missing("cooling"))?;
                Variant::Cooling(CoolingConsumer::new(&cfg.id, section)?)
            }
            ConsumerKind::Appliance => {
                let section = cfg.appliance.clone().ok_or_else(|| missing("appliance"))?;
                Variant::Appliance(ApplianceConsumer::new(&cfg.id, section, cfg.switch.is_some())?)
            }
            ConsumerKind::SgReady => {
                let section = cfg.sg_ready.clone().ok_or_else(|| missing("sg_ready"))?;
                Variant::SgReady(SgReadyConsumer::new(&cfg.id, section)?)
            }
            ConsumerKind::Dynamic => {
                let section = cfg.dynamic.clone().ok_or_else(|| missing("dynamic"))?;
                Variant::Dynamic(DynamicConsumer::new(&cfg.id, section)?)
            }
        };
        Ok(variant)
    }

    fn behavior(&self) -> &dyn VariantBehavior {
        match self {
            Variant::Simple(v) => v,
            Variant::Cooling(v) => v,
            Variant::Appliance(v) => v,
            Variant::SgReady(v) => v,
            Variant::Dynamic(v) => v,
        }
    }

    fn behavior_mut(&mut self) -> &mut dyn VariantBehavior {
        match self {
            Variant::Simple(v) => v,
            Variant::Cooling(v) => v,
            Variant::Appliance(v) => v,
            Variant::SgReady(v) => v,
            Variant::Dynamic(v) => v,
        }
    }
}

fn require_switch(cfg: &ConsumerConfig) -> Result<(), ConfigError> {
    if cfg.switch.is_none() {
        return Err(ConfigError::invalid(&cfg.id, "a switch entity is required"));
    }
    Ok(())
}

fn seconds(value: Option<i64>, id: &str, name: &str) -> Result<Option<Duration>, ConfigError> {
    match value {
        Some(s) if s < 0 => Err(ConfigError::invalid(id, format!("{name} must not be negative"))),
        Some(s) => Duration::try_seconds(s)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(id, format!("{name} out of range"))),
        None => Ok(None),
    }
}

/// One controllable load and everything the controller knows about it.
#[derive(Debug, Clone)]
pub struct Consumer {
    cfg: ConsumerConfig,
    tz: Tz,
    variant: Variant,
    time_window: Option<TimeWindow>,
    blackouts: Vec<TimeWindow>,
    minimum_runtime: Option<Duration>,
    minimum_timeout: Option<Duration>,
    maximum_timeout: Option<Duration>,
    switch_on: LatestValue<bool>,
    critical_flag: LatestValue<bool>,
    power: SlidingWindow,
    gates: HashMap<String, bool>,
    state: ConsumerState,
    critical: bool,
    created_at: DateTime<Utc>,
    inputs: Vec<(String, ConsumerSignal)>,
}

impl Consumer {
    pub fn new(cfg: ConsumerConfig, tz: Tz, now: DateTime<Utc>) -> Result<Self, ConfigError> {
        cfg.validate()
            .map_err(|e| ConfigError::from_validation(&cfg.id, e))?;
        let variant = Variant::from_config(&cfg)?;
        let time_window = cfg.time_window.as_ref().map(|w| w.to_window()).transpose()?;
        let blackouts = cfg
            .blocked_time_windows
            .iter()
            .map(|w| w.to_window())
            .collect::<Result<Vec<_>, _>>()?;

        let mut inputs = Vec::new();
        if let Some(switch) = &cfg.switch {
            inputs.push((switch.clone(), ConsumerSignal::Switch));
        }
        if let Some(sensor) = &cfg.power_sensor {
            inputs.push((sensor.clone(), ConsumerSignal::Power));
        }
        if let Some(sensor) = &cfg.critical_sensor {
            inputs.push((sensor.clone(), ConsumerSignal::CriticalFlag));
        }
        for gate in time_window.iter().chain(blackouts.iter()).filter_map(|w| w.gate.clone()) {
            inputs.push((gate, ConsumerSignal::Gate));
        }
        inputs.extend(variant.behavior().inputs());

        let state = ConsumerState {
            load_estimate: cfg.load_estimate,
            balance_on_behalf_of: cfg.balance_on_behalf_of.clone(),
            allow_battery_power: cfg.allow_battery_power,
            ..ConsumerState::default()
        };

        Ok(Self {
            minimum_runtime: seconds(cfg.minimum_runtime_seconds, &cfg.id, "minimum_runtime")?,
            minimum_timeout: seconds(cfg.minimum_timeout_seconds, &cfg.id, "minimum_timeout")?,
            maximum_timeout: seconds(cfg.maximum_timeout_seconds, &cfg.id, "maximum_timeout")?,
            cfg,
            tz,
            variant,
            time_window,
            blackouts,
            switch_on: LatestValue::empty(),
            critical_flag: LatestValue::empty(),
            power: SlidingWindow::default(),
            gates: HashMap::new(),
            state,
            critical: false,
            created_at: now,
            inputs,
        })
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn kind(&self) -> ConsumerKind {
        self.cfg.kind
    }

    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    pub fn inputs(&self) -> &[(String, ConsumerSignal)] {
        &self.inputs
    }

    pub fn state(&self) -> &ConsumerState {
        &self.state
    }

    /// Take over runtime fields of a persisted record. Configuration-derived
    /// fields always come from the current configuration.
    pub fn restore(&mut self, saved: ConsumerState) {
        self.state = ConsumerState {
            load_estimate: self.cfg.load_estimate,
            balance_on_behalf_of: self.cfg.balance_on_behalf_of.clone(),
            allow_battery_power: self.cfg.allow_battery_power,
            ..saved
        };
    }

    pub fn nominal_power(&self) -> f64 {
        self.cfg.nominal_power_w
    }

    pub fn load_estimate(&self) -> LoadEstimateMethod {
        self.cfg.load_estimate
    }

    pub fn allow_battery_power(&self) -> AllowBatteryPower {
        self.cfg.allow_battery_power
    }

    pub fn balance_on_behalf_of(&self) -> Option<&str> {
        self.cfg.balance_on_behalf_of.as_deref()
    }

    pub fn is_controllable(&self) -> bool {
        self.cfg.controllable
    }

    pub fn admission(&self) -> AdmissionState {
        self.state.admission
    }

    pub fn is_running(&self) -> bool {
        self.state.admission == AdmissionState::Running
    }

    pub fn needs_energy(&self) -> bool {
        matches!(
            self.state.admission,
            AdmissionState::NeedsEnergy | AdmissionState::CriticallyNeedsEnergy
        )
    }

    /// Critical need holds, whether or not the consumer is running.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn may_use_battery(&self) -> bool {
        match self.cfg.allow_battery_power {
            AllowBatteryPower::No => false,
            AllowBatteryPower::Yes => true,
            AllowBatteryPower::WhenCritical => self.critical,
        }
    }

    pub fn ingest(
        &mut self,
        signal: ConsumerSignal,
        entity_id: &str,
        value: &SignalValue,
        timestamp: DateTime<Utc>,
    ) {
        match signal {
            ConsumerSignal::Switch => {
                self.switch_on.update(value.as_switch());
            }
            ConsumerSignal::CriticalFlag => {
                self.critical_flag.update(value.as_switch());
            }
            ConsumerSignal::Power => {
                if let Some(w) = value.as_numeric() {
                    self.power.push(SensorSample::new(timestamp, w));
                }
            }
            ConsumerSignal::Gate => {
                if let Some(on) = value.as_switch() {
                    self.gates.insert(entity_id.to_string(), on);
                }
            }
            other => self.variant.behavior_mut().ingest(other, value),
        }
    }

    fn context(&self) -> SignalContext<'_> {
        SignalContext {
            switch: self.cfg.switch.as_deref(),
            switch_on: self.switch_on.get(),
            power_w: self.power.latest().map(|s| s.value),
        }
    }

    /// Re-derive the admission state from the latest signals. Returns `true`
    /// when the persisted record changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let eval = self.variant.behavior().evaluate(&self.context());
        let overdue = self.variant.behavior().honors_max_timeout()
            && !eval.running
            && self.maximum_timeout.is_some_and(|timeout| {
                now >= self.state.last_run_at.unwrap_or(self.created_at) + timeout
            });
        self.critical = eval.critical || self.critical_flag.get() == Some(true) || overdue;

        let next = if eval.running {
            AdmissionState::Running
        } else if self.critical {
            AdmissionState::CriticallyNeedsEnergy
        } else if eval.needs_energy {
            AdmissionState::NeedsEnergy
        } else {
            AdmissionState::Off
        };

        let previous = self.state.admission;
        if next == previous {
            return false;
        }
        if next == AdmissionState::Running {
            self.state.started_at = Some(now);
        } else if previous == AdmissionState::Running {
            self.state.last_run_at = Some(now);
        }
        self.state.admission = next;
        info!(consumer = %self.cfg.id, from = %previous, to = %next, "admission state changed");
        true
    }

    fn gate_state(&self, window: &TimeWindow) -> Option<bool> {
        window.gate.as_ref().and_then(|g| self.gates.get(g).copied())
    }

    pub fn can_start(&self, now: DateTime<Utc>) -> bool {
        if !self.needs_energy() {
            return false;
        }
        if let Some(window) = &self.time_window {
            if window.is_gating(self.gate_state(window)) && !window.contains(now, &self.tz) {
                return false;
            }
        }
        match (self.minimum_timeout, self.state.last_run_at) {
            (Some(timeout), Some(last)) => now >= last + timeout,
            _ => true,
        }
    }

    fn minimum_runtime_elapsed(&self, now: DateTime<Utc>) -> bool {
        match (self.minimum_runtime, self.state.started_at) {
            (Some(runtime), Some(started)) if self.is_running() => now >= started + runtime,
            _ => true,
        }
    }

    pub fn can_force_stop(&self, now: DateTime<Utc>) -> bool {
        self.minimum_runtime_elapsed(now) && !self.critical && self.variant.behavior().may_stop()
    }

    pub fn can_force_stop_on_peak_load(&self, now: DateTime<Utc>) -> bool {
        self.minimum_runtime_elapsed(now)
            && (!self.critical || self.cfg.peak_overrides_critical)
            && self.variant.behavior().may_stop()
    }

    pub fn in_blackout(&self, now: DateTime<Utc>) -> bool {
        self.blackouts
            .iter()
            .any(|w| w.is_active(now, &self.tz, self.gate_state(w)))
    }

    pub fn block(&self) -> Option<Block> {
        self.state.block
    }

    pub fn is_blocked(&self) -> bool {
        self.state.block.is_some()
    }

    pub fn in_reblock_grace(&self, now: DateTime<Utc>) -> bool {
        self.state.reblock_grace_until.is_some_and(|until| now < until)
    }

    /// Trailing mean of the consumer's own draw over its estimate lookback.
    /// Without a power sensor a running consumer is assumed at nominal power.
    pub fn average_power(&self, now: DateTime<Utc>) -> f64 {
        match self.power.average_over(self.cfg.load_estimate.lookback(), now) {
            Some(w) => w,
            None if self.is_running() => self.cfg.nominal_power_w,
            None => 0.0,
        }
    }

    /// Extra load to expect if the consumer runs as intended.
    pub fn load_correction(&self, now: DateTime<Utc>) -> f64 {
        let expected = match &self.variant {
            Variant::Dynamic(d) => d.limits().min_power_w,
            _ => self.cfg.nominal_power_w,
        };
        expected - self.average_power(now)
    }

    pub fn start(&self) -> Vec<Command> {
        self.variant.behavior().start_commands(&self.context())
    }

    pub fn stop(&self) -> Vec<Command> {
        self.variant.behavior().stop_commands(&self.context())
    }

    pub fn block_for(&mut self, reason: BlockReason, now: DateTime<Utc>) -> Vec<Command> {
        self.state.block = Some(Block { since: now, reason });
        self.state.reblock_grace_until = None;
        let commands = match &self.variant {
            Variant::SgReady(sg) => sg.block_commands(),
            _ => self.stop(),
        };
        self.state.boosted = false;
        info!(consumer = %self.cfg.id, reason = %reason, "consumer blocked");
        commands
    }

    /// Commands that keep a blocked consumer stopped if the device drifted.
    pub fn enforce_block(&self) -> Vec<Command> {
        match &self.variant {
            Variant::SgReady(sg) => sg.block_commands(),
            _ if self.is_running() => self.stop(),
            _ => Vec::new(),
        }
    }

    /// Lift the block. `timed_out` grants a grace period against immediate re-blocking.
    pub fn unblock(&mut self, now: DateTime<Utc>, timed_out: bool) -> Vec<Command> {
        let reason = self.state.block.take().map(|b| b.reason);
        self.state.unblocked_at = Some(now);
        self.state.reblock_grace_until = timed_out.then(|| {
            now + self
                .minimum_runtime
                .unwrap_or_else(|| Duration::seconds(DEFAULT_REBLOCK_GRACE_SECS))
        });
        info!(consumer = %self.cfg.id, reason = ?reason, timed_out, "consumer unblocked");
        match &self.variant {
            Variant::SgReady(sg) => sg.normal_commands(),
            _ => Vec::new(),
        }
    }

    pub fn is_boosted(&self) -> bool {
        match &self.variant {
            Variant::SgReady(sg) => self.state.boosted || sg.is_boosted(),
            _ => false,
        }
    }

    pub fn boost(&mut self) -> Vec<Command> {
        let Variant::SgReady(sg) = &self.variant else {
            return Vec::new();
        };
        let commands = sg.boost_commands();
        self.state.boosted = true;
        info!(consumer = %self.cfg.id, "boost enabled");
        commands
    }

    pub fn unboost(&mut self) -> Vec<Command> {
        let Variant::SgReady(sg) = &self.variant else {
            return Vec::new();
        };
        let commands = sg.normal_commands();
        self.state.boosted = false;
        info!(consumer = %self.cfg.id, "boost disabled");
        commands
    }

    pub fn dynamic_limits(&self) -> Option<DynamicLimits> {
        match &self.variant {
            Variant::Dynamic(d) => Some(d.limits()),
            _ => None,
        }
    }

    /// Charging current setpoint command, `None` when the device already reports it.
    pub fn set_current(&self, amps: f64) -> Option<Command> {
        match &self.variant {
            Variant::Dynamic(d) => d.current_command(amps),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoolingConfig, TimeWindowConfig};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        // Tuesday
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
    }

    fn heater() -> ConsumerConfig {
        let mut cfg = ConsumerConfig::simple("heater", "switch.heater", 2000.0);
        cfg.power_sensor = Some("sensor.heater_power".into());
        cfg
    }

    fn switch(c: &mut Consumer, on: bool, ts: DateTime<Utc>) {
        c.ingest(ConsumerSignal::Switch, "switch.heater", &SignalValue::Switch(Some(on)), ts);
        c.refresh(ts);
    }

    #[test]
    fn test_simple_admission_follows_switch() {
        let mut c = Consumer::new(heater(), Tz::UTC, t0()).unwrap();
        assert!(c.refresh(t0()));
        assert_eq!(c.admission(), AdmissionState::NeedsEnergy);

        switch(&mut c, true, t0());
        assert_eq!(c.admission(), AdmissionState::Running);
        assert_eq!(c.state().started_at, Some(t0()));

        let later = t0() + Duration::minutes(5);
        switch(&mut c, false, later);
        assert_eq!(c.admission(), AdmissionState::NeedsEnergy);
        assert_eq!(c.state().last_run_at, Some(later));
    }

    #[test]
    fn test_minimum_runtime_protects_from_stop() {
        let mut cfg = heater();
        cfg.minimum_runtime_seconds = Some(600);
        let mut c = Consumer::new(cfg, Tz::UTC, t0()).unwrap();
        switch(&mut c, true, t0());

        assert!(!c.can_force_stop(t0() + Duration::minutes(9)));
        assert!(!c.can_force_stop_on_peak_load(t0() + Duration::minutes(9)));
        assert!(c.can_force_stop(t0() + Duration::minutes(10)));
    }

    #[test]
    fn test_minimum_timeout_delays_restart() {
        let mut cfg = heater();
        cfg.minimum_timeout_seconds = Some(300);
        let mut c = Consumer::new(cfg, Tz::UTC, t0()).unwrap();
        switch(&mut c, true, t0());
        switch(&mut c, false, t0() + Duration::minutes(1));

        assert!(!c.can_start(t0() + Duration::minutes(5)));
        assert!(c.can_start(t0() + Duration::minutes(6)));
    }

    #[test]
    fn test_maximum_timeout_makes_need_critical() {
        let mut cfg = heater();
        cfg.maximum_timeout_seconds = Some(3600);
        let mut c = Consumer::new(cfg, Tz::UTC, t0()).unwrap();
        c.refresh(t0());
        assert!(!c.is_critical());

        // never ran: measured from creation
        c.refresh(t0() + Duration::hours(1));
        assert_eq!(c.admission(), AdmissionState::CriticallyNeedsEnergy);
        assert!(!c.can_force_stop(t0() + Duration::hours(1)));
    }

    #[test]
    fn test_critical_flag_and_peak_override() {
        let mut cfg = heater();
        cfg.critical_sensor = Some("input_boolean.heater_force".into());
        let mut c = Consumer::new(cfg.clone(), Tz::UTC, t0()).unwrap();
        switch(&mut c, true, t0());
        c.ingest(ConsumerSignal::CriticalFlag, "input_boolean.heater_force", &SignalValue::Switch(Some(true)), t0());
        c.refresh(t0());
        assert!(c.is_critical());
        assert!(!c.can_force_stop_on_peak_load(t0()));

        cfg.peak_overrides_critical = true;
        let mut c = Consumer::new(cfg, Tz::UTC, t0()).unwrap();
        switch(&mut c, true, t0());
        c.ingest(ConsumerSignal::CriticalFlag, "input_boolean.heater_force", &SignalValue::Switch(Some(true)), t0());
        c.refresh(t0());
        assert!(!c.can_force_stop(t0()));
        assert!(c.can_force_stop_on_peak_load(t0()));
    }

    #[test]
    fn test_time_window_limits_start() {
        let mut cfg = heater();
        cfg.time_window = Some(TimeWindowConfig {
            gate: None,
            days: vec![],
            start: "22:00".into(),
            end: "06:00".into(),
        });
        let mut c = Consumer::new(cfg, Tz::UTC, t0()).unwrap();
        c.refresh(t0());
        assert!(!c.can_start(t0()));
        assert!(c.can_start(t0() + Duration::hours(11)));
    }

    #[test]
    fn test_cooling_refuses_stop_above_max() {
        let mut cfg = ConsumerConfig::simple("freezer", "switch.freezer", 150.0);
        cfg.kind = ConsumerKind::Cooling;
        cfg.cooling = Some(CoolingConfig {
            temperature_sensor: "sensor.freezer_temp".into(),
            target_temperature: -18.0,
            max_temperature: -12.0,
        });
        let mut c = Consumer::new(cfg, Tz::UTC, t0()).unwrap();
        let temp = |c: &mut Consumer, t: f64| {
            c.ingest(ConsumerSignal::Temperature, "sensor.freezer_temp", &SignalValue::Numeric(Some(t)), t0());
            c.refresh(t0());
        };

        temp(&mut c, -20.0);
        assert_eq!(c.admission(), AdmissionState::Off);
        temp(&mut c, -17.0);
        assert_eq!(c.admission(), AdmissionState::NeedsEnergy);
        temp(&mut c, -11.0);
        assert_eq!(c.admission(), AdmissionState::CriticallyNeedsEnergy);

        c.ingest(ConsumerSignal::Switch, "switch.freezer", &SignalValue::Switch(Some(true)), t0());
        c.refresh(t0());
        assert!(c.is_running());
        assert!(!c.can_force_stop_on_peak_load(t0()));
    }

    #[test]
    fn test_missing_variant_section_fails() {
        let mut cfg = heater();
        cfg.kind = ConsumerKind::Cooling;
        assert!(matches!(
            Consumer::new(cfg, Tz::UTC, t0()),
            Err(ConfigError::MissingVariantConfig { section: "cooling", .. })
        ));
    }

    #[test]
    fn test_out_of_range_timer_fails() {
        let mut cfg = heater();
        cfg.minimum_runtime_seconds = Some(i64::MAX);
        assert!(matches!(
            Consumer::new(cfg, Tz::UTC, t0()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_load_correction_uses_own_average() {
        let mut c = Consumer::new(heater(), Tz::UTC, t0()).unwrap();
        assert_eq!(c.load_correction(t0()), 2000.0);

        c.ingest(ConsumerSignal::Power, "sensor.heater_power", &SignalValue::Numeric(Some(1500.0)), t0());
        assert_eq!(c.load_correction(t0()), 500.0);
    }

    #[test]
    fn test_block_and_timeout_unblock_grace() {
        let mut c = Consumer::new(heater(), Tz::UTC, t0()).unwrap();
        switch(&mut c, true, t0());

        let commands = c.block_for(BlockReason::PeakLoad, t0());
        assert_eq!(commands, vec![Command::turn_off("switch.heater")]);
        assert!(c.is_blocked());

        let later = t0() + Duration::minutes(15);
        assert!(c.unblock(later, true).is_empty());
        assert!(c.in_reblock_grace(later + Duration::seconds(59)));
        assert!(!c.in_reblock_grace(later + Duration::seconds(60)));

        c.block_for(BlockReason::PeakLoad, later + Duration::minutes(2));
        c.unblock(later + Duration::minutes(3), false);
        assert!(!c.in_reblock_grace(later + Duration::minutes(3)));
    }

    #[test]
    fn test_enforce_block_only_while_running() {
        let mut c = Consumer::new(heater(), Tz::UTC, t0()).unwrap();
        switch(&mut c, true, t0());
        c.block_for(BlockReason::PeakLoad, t0());
        assert_eq!(c.enforce_block(), vec![Command::turn_off("switch.heater")]);

        switch(&mut c, false, t0() + Duration::seconds(5));
        assert!(c.enforce_block().is_empty());
    }

    #[test]
    fn test_restore_keeps_configured_policy() {
        let mut c = Consumer::new(heater(), Tz::UTC, t0()).unwrap();
        let saved = ConsumerState {
            admission: AdmissionState::Running,
            block: Some(Block {
                since: t0(),
                reason: BlockReason::PeakLoad,
            }),
            allow_battery_power: AllowBatteryPower::Yes,
            ..ConsumerState::default()
        };
        c.restore(saved);
        assert!(c.is_blocked());
        assert_eq!(c.state().allow_battery_power, AllowBatteryPower::No);
    }
}
