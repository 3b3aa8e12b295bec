use anyhow::Result;
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use validator::Validate;

use crate::domain::consumer::AllowBatteryPower;
use crate::domain::grid::{LoadEstimateMethod, DEFAULT_PEAK_FLOOR_W};
use crate::domain::sample::DEFAULT_WINDOW_CAPACITY;
use crate::domain::time_window::TimeWindow;

/// Deployment mistakes. Fatal for the entity they concern, never for the site.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{id}: kind '{kind}' requires a [{section}] section")]
    MissingVariantConfig {
        id: String,
        kind: String,
        section: &'static str,
    },
    #[error("{entity}: invalid configuration: {reason}")]
    Invalid { entity: String, reason: String },
    #[error("Invalid time of day '{0}' (expected HH:MM)")]
    InvalidTime(String),
    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("Duplicate id '{0}'")]
    DuplicateId(String),
    #[error("{consumer}: balances on behalf of unknown group '{group}'")]
    UnknownGroup { consumer: String, group: String },
}

impl ConfigError {
    pub fn invalid(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Wrap `validator` failures for one entity.
    pub fn from_validation(entity: &str, errors: validator::ValidationErrors) -> Self {
        Self::invalid(entity, errors.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub controller: ControllerConfig,
    pub grid: GridConfig,
    #[serde(default)]
    pub batteries: Vec<BatteryConfig>,
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ControllerConfig {
    #[serde(default = "default_rebalance_interval")]
    #[validate(range(min = 1))]
    pub rebalance_interval_seconds: u64,
    #[serde(default = "default_persist_interval")]
    #[validate(range(min = 1))]
    pub persist_interval_seconds: u64,
    /// Longest the dispatcher waits on one actuator command
    #[serde(default = "default_command_timeout")]
    #[validate(range(min = 1))]
    pub command_timeout_seconds: u64,
    /// Longest a peak-load block holds before the consumer may try again
    #[serde(default = "default_max_block_minutes")]
    #[validate(range(min = 1))]
    pub max_block_minutes: i64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Log filter directives when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Directory for persisted entity state; in-memory only when unset
    pub state_dir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_seconds: default_rebalance_interval(),
            persist_interval_seconds: default_persist_interval(),
            command_timeout_seconds: default_command_timeout(),
            max_block_minutes: default_max_block_minutes(),
            timezone: default_timezone(),
            log_filter: default_log_filter(),
            state_dir: None,
        }
    }
}

impl ControllerConfig {
    pub fn max_block(&self) -> Result<chrono::Duration, ConfigError> {
        chrono::Duration::try_minutes(self.max_block_minutes)
            .ok_or_else(|| ConfigError::invalid("controller", "max_block_minutes out of range"))
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GridConfig {
    #[validate(length(min = 1))]
    pub import_sensor: String,
    #[validate(length(min = 1))]
    pub export_sensor: String,
    #[validate(length(min = 1))]
    pub peak_import_sensor: String,
    pub battery_charge_sensor: Option<String>,
    pub battery_discharge_sensor: Option<String>,
    pub average_demand_sensor: Option<String>,
    pub solar_production_sensor: Option<String>,
    pub solar_forecast_sensor: Option<String>,
    /// Multiplier turning the peak sensor's unit into watts
    #[serde(default = "default_peak_scale")]
    #[validate(range(exclusive_min = 0.0))]
    pub peak_scale: f64,
    #[serde(default = "default_peak_floor")]
    #[validate(range(min = 0.0))]
    pub peak_floor_w: f64,
    #[serde(default = "default_window_capacity")]
    #[validate(range(min = 1))]
    pub window_capacity: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            import_sensor: "sensor.grid_import_power".into(),
            export_sensor: "sensor.grid_export_power".into(),
            peak_import_sensor: "sensor.grid_peak_import".into(),
            battery_charge_sensor: Some("sensor.battery_charge_power".into()),
            battery_discharge_sensor: Some("sensor.battery_discharge_power".into()),
            average_demand_sensor: Some("sensor.grid_average_demand".into()),
            solar_production_sensor: Some("sensor.solar_power".into()),
            solar_forecast_sensor: Some("sensor.solar_forecast_next_hour".into()),
            peak_scale: default_peak_scale(),
            peak_floor_w: default_peak_floor(),
            window_capacity: default_window_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BatteryConfig {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub soc_sensor: String,
    /// Number entity holding the charge power limit; also reported back as telemetry
    #[validate(length(min = 1))]
    pub charge_limit_entity: String,
    #[validate(length(min = 1))]
    pub discharge_limit_entity: String,
    pub charged_energy_sensor: Option<String>,
    pub discharged_energy_sensor: Option<String>,
    #[validate(range(exclusive_min = 0.0))]
    pub capacity_kwh: f64,
    #[validate(range(min = 0.0))]
    pub max_charge_power_w: f64,
    #[validate(range(min = 0.0))]
    pub max_discharge_power_w: f64,
    #[serde(default = "default_minimum_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub minimum_soc: f64,
    #[serde(default = "default_full_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub full_soc: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub optimal_charge_power_min_w: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub optimal_charge_power_max_w: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub optimal_discharge_power_min_w: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub optimal_discharge_power_max_w: f64,
    #[serde(default = "default_reference_points")]
    pub rte_reference_points: Vec<f64>,
    #[serde(default = "default_control_settle")]
    #[validate(range(min = 0))]
    pub control_settle_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerKind {
    #[default]
    Simple,
    Cooling,
    Appliance,
    SgReady,
    Dynamic,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConsumerConfig {
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(default)]
    pub kind: ConsumerKind,
    pub switch: Option<String>,
    pub power_sensor: Option<String>,
    /// Draw when running, used to project the effect of a start
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub nominal_power_w: f64,
    pub minimum_runtime_seconds: Option<i64>,
    pub minimum_timeout_seconds: Option<i64>,
    pub maximum_timeout_seconds: Option<i64>,
    /// Forced-run sensor; while on the consumer critically needs energy
    pub critical_sensor: Option<String>,
    /// Window the consumer may start in
    pub time_window: Option<TimeWindowConfig>,
    /// Scheduled blackouts during which the consumer is blocked
    #[serde(default)]
    pub blocked_time_windows: Vec<TimeWindowConfig>,
    #[serde(default)]
    pub load_estimate: LoadEstimateMethod,
    #[serde(default)]
    pub allow_battery_power: AllowBatteryPower,
    pub balance_on_behalf_of: Option<String>,
    /// Peak protection may stop this consumer even while critically needed
    #[serde(default)]
    pub peak_overrides_critical: bool,
    #[serde(default = "default_true")]
    pub controllable: bool,
    pub cooling: Option<CoolingConfig>,
    pub appliance: Option<ApplianceConfig>,
    pub sg_ready: Option<SgReadyConfig>,
    pub dynamic: Option<DynamicConfig>,
}

impl ConsumerConfig {
    /// Minimal switch-driven consumer, mostly for tests and examples.
    pub fn simple(id: impl Into<String>, switch: impl Into<String>, nominal_power_w: f64) -> Self {
        Self {
            id: id.into(),
            kind: ConsumerKind::Simple,
            switch: Some(switch.into()),
            power_sensor: None,
            nominal_power_w,
            minimum_runtime_seconds: None,
            minimum_timeout_seconds: None,
            maximum_timeout_seconds: None,
            critical_sensor: None,
            time_window: None,
            blocked_time_windows: Vec::new(),
            load_estimate: LoadEstimateMethod::Instant,
            allow_battery_power: AllowBatteryPower::No,
            balance_on_behalf_of: None,
            peak_overrides_critical: false,
            controllable: true,
            cooling: None,
            appliance: None,
            sg_ready: None,
            dynamic: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CoolingConfig {
    #[validate(length(min = 1))]
    pub temperature_sensor: String,
    pub target_temperature: f64,
    /// Safety ceiling; above it the consumer is critical and cannot be stopped
    pub max_temperature: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApplianceConfig {
    #[validate(length(min = 1))]
    pub state_sensor: String,
    #[serde(default)]
    pub running_states: Vec<String>,
    #[serde(default)]
    pub start_states: Vec<String>,
    #[serde(default)]
    pub paused_states: Vec<String>,
    #[serde(default)]
    pub critical_states: Vec<String>,
    #[serde(default)]
    pub can_pause: bool,
    /// Select entity driving the program when there is no switch
    pub control_entity: Option<String>,
    pub start_option: Option<String>,
    pub pause_option: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SgReadyConfig {
    #[validate(length(min = 1))]
    pub mode_entity: String,
    #[validate(length(min = 1))]
    pub state_sensor: String,
    #[serde(default = "default_sg_running_threshold")]
    pub running_power_threshold_w: f64,
    #[serde(default = "default_blocked_option")]
    pub blocked_option: String,
    #[serde(default = "default_normal_option")]
    pub normal_option: String,
    #[serde(default = "default_boosted_option")]
    pub boosted_option: String,
    #[serde(default = "default_needs_energy_states")]
    pub needs_energy_states: Vec<String>,
    #[serde(default = "default_critical_states")]
    pub critical_states: Vec<String>,
    /// Export surplus that switches the device into boost
    #[serde(default = "default_boost_surplus")]
    #[validate(range(min = 0.0))]
    pub boost_surplus_w: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DynamicConfig {
    #[validate(length(min = 1))]
    pub current_entity: String,
    pub status_sensor: Option<String>,
    #[serde(default = "default_connected_states")]
    pub connected_states: Vec<String>,
    #[serde(default = "default_min_current")]
    #[validate(range(exclusive_min = 0.0))]
    pub min_current_a: f64,
    #[serde(default = "default_max_current")]
    #[validate(range(exclusive_min = 0.0))]
    pub max_current_a: f64,
    #[serde(default = "default_phases")]
    #[validate(range(min = 1, max = 3))]
    pub phases: u8,
    #[serde(default = "default_voltage")]
    #[validate(range(exclusive_min = 0.0))]
    pub voltage_v: f64,
    #[serde(default = "default_dynamic_running_threshold")]
    pub running_power_threshold_w: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeWindowConfig {
    pub gate: Option<String>,
    #[serde(default)]
    pub days: Vec<Weekday>,
    pub start: String,
    pub end: String,
}

impl TimeWindowConfig {
    pub fn to_window(&self) -> Result<TimeWindow, ConfigError> {
        let mut window = TimeWindow::new(
            self.days.clone(),
            parse_time_of_day(&self.start)?,
            parse_time_of_day(&self.end)?,
        );
        if let Some(gate) = &self.gate {
            window = window.with_gate(gate.clone());
        }
        Ok(window)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GroupConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
        .map_err(|_| ConfigError::InvalidTime(s.to_string()))
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("GPB__").split("__"));
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Site-wide checks. Per-entity checks happen when each entity is built,
    /// so one bad consumer does not take the others down.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller
            .validate()
            .map_err(|e| ConfigError::from_validation("controller", e))?;
        self.grid
            .validate()
            .map_err(|e| ConfigError::from_validation("grid", e))?;
        self.controller.timezone()?;
        self.controller.max_block()?;

        let mut ids = HashSet::new();
        let all_ids = self
            .consumers
            .iter()
            .map(|c| &c.id)
            .chain(self.batteries.iter().map(|b| &b.id));
        for id in all_ids {
            if !ids.insert(id.as_str()) {
                return Err(ConfigError::DuplicateId(id.clone()));
            }
        }

        let groups: HashSet<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
        if groups.len() != self.groups.len() {
            let dup = self
                .groups
                .iter()
                .find(|g| self.groups.iter().filter(|o| o.name == g.name).count() > 1)
                .map(|g| g.name.clone())
                .unwrap_or_default();
            return Err(ConfigError::DuplicateId(dup));
        }
        for consumer in &self.consumers {
            if let Some(group) = &consumer.balance_on_behalf_of {
                if !groups.contains(group.as_str()) {
                    return Err(ConfigError::UnknownGroup {
                        consumer: consumer.id.clone(),
                        group: group.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_rebalance_interval() -> u64 {
    5
}
fn default_persist_interval() -> u64 {
    1
}
fn default_log_filter() -> String {
    "info".into()
}
fn default_command_timeout() -> u64 {
    10
}
fn default_max_block_minutes() -> i64 {
    15
}
fn default_timezone() -> String {
    "UTC".into()
}
fn default_peak_scale() -> f64 {
    1000.0
}
fn default_peak_floor() -> f64 {
    DEFAULT_PEAK_FLOOR_W
}
fn default_window_capacity() -> usize {
    DEFAULT_WINDOW_CAPACITY
}
fn default_minimum_soc() -> f64 {
    10.0
}
fn default_full_soc() -> f64 {
    100.0
}
fn default_reference_points() -> Vec<f64> {
    vec![20.0, 50.0, 80.0]
}
fn default_control_settle() -> i64 {
    30
}
fn default_sg_running_threshold() -> f64 {
    300.0
}
fn default_blocked_option() -> String {
    "blocked".into()
}
fn default_normal_option() -> String {
    "normal".into()
}
fn default_boosted_option() -> String {
    "boosted".into()
}
fn default_needs_energy_states() -> Vec<String> {
    vec!["energy_needed".into()]
}
fn default_critical_states() -> Vec<String> {
    vec!["critical".into()]
}
fn default_boost_surplus() -> f64 {
    1500.0
}
fn default_connected_states() -> Vec<String> {
    vec!["connected".into(), "charging".into(), "suspended".into()]
}
fn default_min_current() -> f64 {
    6.0
}
fn default_max_current() -> f64 {
    16.0
}
fn default_phases() -> u8 {
    3
}
fn default_voltage() -> f64 {
    230.0
}
fn default_dynamic_running_threshold() -> f64 {
    500.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Toml;

    const SITE: &str = r#"
        [controller]
        timezone = "Europe/Stockholm"

        [grid]
        import_sensor = "sensor.import"
        export_sensor = "sensor.export"
        peak_import_sensor = "sensor.peak"

        [[batteries]]
        id = "house_battery"
        soc_sensor = "sensor.battery_soc"
        charge_limit_entity = "number.battery_charge_limit"
        discharge_limit_entity = "number.battery_discharge_limit"
        capacity_kwh = 10.0
        max_charge_power_w = 5000.0
        max_discharge_power_w = 5000.0

        [[groups]]
        name = "heating"
        members = ["floor_heating"]

        [[consumers]]
        id = "floor_heating"
        switch = "switch.floor_heating"
        nominal_power_w = 1200.0

        [[consumers]]
        id = "freezer"
        kind = "cooling"
        switch = "switch.freezer"
        balance_on_behalf_of = "heating"
        load_estimate = "average_2m"
        [consumers.cooling]
        temperature_sensor = "sensor.freezer_temp"
        target_temperature = -18.0
        max_temperature = -12.0

        [[consumers.blocked_time_windows]]
        days = ["Mon", "Tue", "Wed", "Thu", "Fri"]
        start = "22:00"
        end = "06:00"
    "#;

    fn parse(toml: &str) -> Config {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .expect("valid config")
    }

    #[test]
    fn test_parse_site_config() {
        let cfg = parse(SITE);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.controller.rebalance_interval_seconds, 5);
        assert_eq!(cfg.controller.persist_interval_seconds, 1);
        assert_eq!(cfg.controller.command_timeout_seconds, 10);
        assert_eq!(cfg.controller.log_filter, "info");
        assert_eq!(cfg.grid.peak_floor_w, 2500.0);
        assert_eq!(cfg.consumers.len(), 2);
        assert_eq!(cfg.consumers[1].kind, ConsumerKind::Cooling);
        assert_eq!(cfg.consumers[1].load_estimate, LoadEstimateMethod::Average2m);
        assert_eq!(cfg.consumers[1].blocked_time_windows.len(), 1);
        assert_eq!(cfg.batteries[0].rte_reference_points, vec![20.0, 50.0, 80.0]);
        assert_eq!(cfg.controller.timezone().unwrap(), chrono_tz::Europe::Stockholm);
    }

    #[test]
    fn test_unknown_group_rejected() {
        let mut cfg = parse(SITE);
        cfg.consumers[1].balance_on_behalf_of = Some("cooling".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownGroup { .. })));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut cfg = parse(SITE);
        cfg.consumers[1].id = "floor_heating".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateId(_))));
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let mut cfg = parse(SITE);
        cfg.controller.timezone = "Mars/Olympus".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownTimezone(_))));
    }

    #[test]
    fn test_out_of_range_block_duration_rejected() {
        let mut cfg = parse(SITE);
        cfg.controller.max_block_minutes = i64::MAX;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
        assert_eq!(
            ControllerConfig::default().max_block().unwrap(),
            chrono::Duration::minutes(15)
        );
    }

    #[test]
    fn test_time_window_parsing() {
        let window = TimeWindowConfig {
            gate: None,
            days: vec![Weekday::Sat],
            start: "07:30".into(),
            end: "09:15:30".into(),
        }
        .to_window()
        .unwrap();
        assert_eq!(window.start, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert_eq!(window.end, NaiveTime::from_hms_opt(9, 15, 30).unwrap());

        assert!(matches!(
            parse_time_of_day("25:99"),
            Err(ConfigError::InvalidTime(_))
        ));
    }
}
