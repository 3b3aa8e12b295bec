use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use grid_peak_balancer::config::{
    BatteryConfig, Config, ConsumerConfig, ConsumerKind, ControllerConfig, DynamicConfig,
    GridConfig, TimeWindowConfig,
};
use grid_peak_balancer::controller::{Action, RebalanceEngine, Route, Site, TickOutcome};
use grid_peak_balancer::domain::consumer::AllowBatteryPower;
use grid_peak_balancer::domain::BlockReason;
use grid_peak_balancer::hardware::{Command, SignalValue};

// 2024-03-05 is a Tuesday
fn tuesday(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, h, m, s).unwrap()
}

struct Harness {
    site: Site,
    engine: RebalanceEngine,
}

impl Harness {
    fn new(consumers: Vec<ConsumerConfig>, batteries: Vec<BatteryConfig>, start: DateTime<Utc>) -> Self {
        let cfg = Config {
            controller: ControllerConfig::default(),
            grid: GridConfig::default(),
            batteries,
            consumers,
            groups: vec![],
        };
        Self {
            site: Site::from_config(&cfg, Tz::UTC, start),
            engine: RebalanceEngine::from_config(&cfg.controller).unwrap(),
        }
    }

    fn feed(&mut self, entity: &str, value: SignalValue, ts: DateTime<Utc>) {
        let routes = self.site.routes().remove(entity).unwrap_or_default();
        assert!(!routes.is_empty(), "nothing listens to {entity}");
        for route in routes {
            match route {
                Route::Grid(signal) => self.site.grid.ingest(signal, value.as_numeric(), ts),
                Route::Battery(idx, signal) => {
                    self.site.batteries[idx].ingest(signal, value.as_numeric());
                }
                Route::Consumer(idx, signal) => {
                    self.site.consumers[idx].ingest(signal, entity, &value, ts);
                }
            }
        }
    }

    fn grid(&mut self, load_w: f64, ts: DateTime<Utc>) {
        self.feed("sensor.grid_import_power", SignalValue::Numeric(Some(load_w.max(0.0))), ts);
        self.feed("sensor.grid_export_power", SignalValue::Numeric(Some((-load_w).max(0.0))), ts);
    }

    fn switch(&mut self, entity: &str, on: bool, ts: DateTime<Utc>) {
        self.feed(entity, SignalValue::Switch(Some(on)), ts);
    }

    fn power(&mut self, entity: &str, watts: f64, ts: DateTime<Utc>) {
        self.feed(entity, SignalValue::Numeric(Some(watts)), ts);
    }

    fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        self.engine.tick(&mut self.site, now)
    }
}

fn heater(nominal_w: f64) -> ConsumerConfig {
    let mut cfg = ConsumerConfig::simple("heater", "switch.heater", nominal_w);
    cfg.power_sensor = Some("sensor.heater_power".into());
    cfg
}

#[test]
fn test_over_budget_blocks_then_timeout_unblocks() {
    let t0 = tuesday(12, 0, 0);
    let mut h = Harness::new(vec![heater(700.0)], vec![], t0);
    h.switch("switch.heater", true, t0);
    h.power("sensor.heater_power", 500.0, t0);
    h.grid(2400.0, t0);

    let out = h.tick(t0);
    let decision = &out.decisions[0];
    assert_eq!(decision.action, Action::Block(BlockReason::PeakLoad));
    assert_eq!(decision.estimated_w, 2600.0);
    assert_eq!(decision.budget_w, 2500.0);
    assert_eq!(out.commands, vec![Command::turn_off("switch.heater")]);

    // device follows the command; the site is still too busy to restart it
    let t1 = t0 + Duration::seconds(5);
    h.switch("switch.heater", false, t1);
    h.power("sensor.heater_power", 0.0, t1);
    h.grid(2100.0, t1);
    assert!(h.tick(t1).decisions.is_empty());
    assert!(h.site.consumers[0].is_blocked());

    let t2 = t0 + Duration::minutes(16);
    h.grid(2000.0, t2);
    let out = h.tick(t2);
    assert_eq!(out.actions_for("heater"), vec![Action::Unblock { timed_out: true }]);
    assert!(!h.site.consumers[0].is_blocked());
}

/// Single-phase charger on 100 V: 7 A minimum is 700 W.
fn charger() -> ConsumerConfig {
    let mut cfg = ConsumerConfig::simple("charger", "unused", 0.0);
    cfg.kind = ConsumerKind::Dynamic;
    cfg.switch = None;
    cfg.power_sensor = Some("sensor.charger_power".into());
    cfg.dynamic = Some(DynamicConfig {
        current_entity: "number.charger_current".into(),
        status_sensor: None,
        connected_states: vec![],
        min_current_a: 7.0,
        max_current_a: 16.0,
        phases: 1,
        voltage_v: 100.0,
        running_power_threshold_w: 100.0,
    });
    cfg
}

#[test]
fn test_charger_over_budget_blocks_then_timeout_unblocks() {
    let t0 = tuesday(12, 0, 0);
    let mut h = Harness::new(vec![charger()], vec![], t0);
    h.power("sensor.charger_power", 500.0, t0);
    h.grid(2400.0, t0);

    // 2400 + (700 minimum - 500 drawn) = 2600; only 600 W left, below 7 A
    let out = h.tick(t0);
    assert_eq!(out.decisions.len(), 1);
    let decision = &out.decisions[0];
    assert_eq!(decision.entity, "charger");
    assert_eq!(decision.action, Action::Block(BlockReason::PeakLoad));
    assert_eq!(decision.estimated_w, 2600.0);
    assert_eq!(decision.budget_w, 2500.0);
    assert_eq!(
        out.commands,
        vec![Command::set_numeric("number.charger_current", 0.0)]
    );

    let t1 = t0 + Duration::seconds(5);
    h.power("sensor.charger_power", 0.0, t1);
    h.feed("number.charger_current", SignalValue::Numeric(Some(0.0)), t1);
    h.grid(2100.0, t1);
    let out = h.tick(t1);
    assert!(out.decisions.is_empty());
    assert!(out.commands.is_empty());
    assert!(h.site.consumers[0].is_blocked());

    let t2 = t0 + Duration::minutes(16);
    h.grid(2000.0, t2);
    let out = h.tick(t2);
    // unblocked, but 500 W of headroom is still short of the minimum current
    assert_eq!(out.actions_for("charger"), vec![Action::Unblock { timed_out: true }]);
    assert!(out.commands.is_empty());
    assert!(!h.site.consumers[0].is_blocked());
}

#[test]
fn test_unblocks_early_when_load_drops() {
    let t0 = tuesday(12, 0, 0);
    let mut h = Harness::new(vec![heater(700.0)], vec![], t0);
    h.switch("switch.heater", true, t0);
    h.power("sensor.heater_power", 500.0, t0);
    h.grid(2400.0, t0);
    h.tick(t0);

    let t1 = t0 + Duration::minutes(2);
    h.switch("switch.heater", false, t1);
    h.power("sensor.heater_power", 0.0, t1);
    h.grid(1000.0, t1);
    let out = h.tick(t1);

    // 1000 + 700 fits: unblocked and started again in the same pass
    assert_eq!(
        out.actions_for("heater"),
        vec![Action::Unblock { timed_out: false }, Action::Start]
    );
    assert_eq!(out.commands, vec![Command::turn_on("switch.heater")]);
}

#[test]
fn test_blackout_window_blocks_regardless_of_load() {
    let mut cfg = heater(1000.0);
    cfg.blocked_time_windows = vec![TimeWindowConfig {
        gate: None,
        days: grid_peak_balancer::domain::time_window::WEEKDAYS.to_vec(),
        start: "22:00".into(),
        end: "06:00".into(),
    }];
    let t0 = tuesday(23, 0, 0);
    let mut h = Harness::new(vec![cfg], vec![], t0);
    h.switch("switch.heater", true, t0);
    h.grid(300.0, t0);

    let out = h.tick(t0);
    assert_eq!(
        out.actions_for("heater"),
        vec![Action::Block(BlockReason::TimeWindow)]
    );
    assert_eq!(out.commands, vec![Command::turn_off("switch.heater")]);

    let at_end = Utc.with_ymd_and_hms(2024, 3, 6, 6, 0, 0).unwrap();
    h.switch("switch.heater", false, at_end);
    h.grid(0.0, at_end);
    assert!(h.tick(at_end).decisions.is_empty());
    assert!(h.site.consumers[0].is_blocked());

    let after = at_end + Duration::seconds(1);
    h.grid(0.0, after);
    let out = h.tick(after);
    assert_eq!(
        out.actions_for("heater"),
        vec![Action::Unblock { timed_out: false }, Action::Start]
    );
}

#[test]
fn test_blackout_is_not_lifted_by_low_load_or_timeout() {
    let mut cfg = heater(1000.0);
    cfg.blocked_time_windows = vec![TimeWindowConfig {
        gate: None,
        days: vec![],
        start: "17:00".into(),
        end: "20:00".into(),
    }];
    let t0 = tuesday(17, 0, 0);
    let mut h = Harness::new(vec![cfg], vec![], t0);
    h.grid(0.0, t0);
    h.tick(t0);

    let later = t0 + Duration::minutes(30);
    h.grid(0.0, later);
    assert!(h.tick(later).decisions.is_empty());
    assert!(h.site.consumers[0].is_blocked());
}

fn battery() -> BatteryConfig {
    BatteryConfig {
        id: "house_battery".into(),
        soc_sensor: "sensor.battery_soc".into(),
        charge_limit_entity: "number.battery_charge_limit".into(),
        discharge_limit_entity: "number.battery_discharge_limit".into(),
        charged_energy_sensor: None,
        discharged_energy_sensor: None,
        capacity_kwh: 10.0,
        max_charge_power_w: 5000.0,
        max_discharge_power_w: 5000.0,
        minimum_soc: 10.0,
        full_soc: 100.0,
        optimal_charge_power_min_w: 500.0,
        optimal_charge_power_max_w: 3000.0,
        optimal_discharge_power_min_w: 300.0,
        optimal_discharge_power_max_w: 1500.0,
        rte_reference_points: vec![20.0, 50.0, 80.0],
        control_settle_seconds: 30,
    }
}

#[test]
fn test_battery_assist_only_for_allowed_consumers() {
    let t0 = tuesday(12, 0, 0);
    let mut assisted = ConsumerConfig::simple("heat_pump", "switch.heat_pump", 1500.0);
    assisted.allow_battery_power = AllowBatteryPower::Yes;
    let plain = ConsumerConfig::simple("boiler", "switch.boiler", 1500.0);

    let mut h = Harness::new(vec![plain, assisted], vec![battery()], t0);
    h.feed("sensor.battery_soc", SignalValue::Numeric(Some(70.0)), t0);
    h.grid(1500.0, t0);

    let out = h.tick(t0);
    // 1500 + 1500 exceeds 2500 for the boiler; the heat pump may count 1500 W of battery
    assert!(out.actions_for("boiler").is_empty());
    assert_eq!(out.actions_for("heat_pump"), vec![Action::Start]);
}

#[test]
fn test_empty_battery_gives_no_assist() {
    let t0 = tuesday(12, 0, 0);
    let mut assisted = ConsumerConfig::simple("heat_pump", "switch.heat_pump", 1500.0);
    assisted.allow_battery_power = AllowBatteryPower::Yes;

    let mut h = Harness::new(vec![assisted], vec![battery()], t0);
    h.feed("sensor.battery_soc", SignalValue::Numeric(Some(10.0)), t0);
    h.grid(1500.0, t0);

    assert!(h.tick(t0).actions_for("heat_pump").is_empty());
}

#[test]
fn test_earlier_consumer_takes_the_budget() {
    let t0 = tuesday(12, 0, 0);
    let first = ConsumerConfig::simple("dryer", "switch.dryer", 1200.0);
    let second = ConsumerConfig::simple("boiler", "switch.boiler", 1200.0);
    let third = ConsumerConfig::simple("towel_rail", "switch.towel_rail", 100.0);

    let mut h = Harness::new(vec![first, second, third], vec![], t0);
    h.grid(1000.0, t0);
    let out = h.tick(t0);

    // 1000 + 1200 = 2200; the boiler would reach 3400, the towel rail fits at 2300
    assert_eq!(out.actions_for("dryer"), vec![Action::Start]);
    assert!(out.actions_for("boiler").is_empty());
    assert_eq!(out.actions_for("towel_rail"), vec![Action::Start]);
    assert_eq!(
        out.commands,
        vec![Command::turn_on("switch.dryer"), Command::turn_on("switch.towel_rail")]
    );
}

#[test]
fn test_minimum_runtime_makes_consumer_ineligible() {
    let t0 = tuesday(12, 0, 0);
    let mut cfg = heater(2000.0);
    cfg.minimum_runtime_seconds = Some(600);
    let mut h = Harness::new(vec![cfg], vec![], t0);
    h.switch("switch.heater", true, t0);
    h.power("sensor.heater_power", 2000.0, t0);
    h.grid(3000.0, t0);
    h.site.consumers[0].refresh(t0);

    let t1 = t0 + Duration::minutes(5);
    h.power("sensor.heater_power", 2000.0, t1);
    h.grid(3000.0, t1);
    let out = h.tick(t1);
    assert_eq!(out.actions_for("heater"), vec![Action::Ineligible]);
    assert!(out.commands.is_empty());

    let t2 = t0 + Duration::minutes(10);
    h.power("sensor.heater_power", 2000.0, t2);
    h.grid(3000.0, t2);
    let out = h.tick(t2);
    assert_eq!(out.actions_for("heater"), vec![Action::Block(BlockReason::PeakLoad)]);
}

#[test]
fn test_peak_budget_follows_meter_above_floor() {
    let t0 = tuesday(12, 0, 0);
    let mut h = Harness::new(vec![heater(2000.0)], vec![], t0);
    h.feed("sensor.grid_peak_import", SignalValue::Numeric(Some(4.0)), t0);
    h.grid(1500.0, t0);

    let out = h.tick(t0);
    assert_eq!(out.decisions[0].budget_w, 4000.0);
    assert_eq!(out.actions_for("heater"), vec![Action::Start]);
}
