use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info};
use validator::Validate;

use super::sample::LatestValue;
use crate::config::{BatteryConfig, ConfigError};
use crate::hardware::Command;

/// Charged/discharged deltas below this are too small for a meaningful
/// efficiency figure (kWh).
const MIN_RTE_ENERGY_KWH: f64 = 1.0;

/// Battery-side signals the controller subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatterySignal {
    StateOfCharge,
    /// Reported charge power limit (W); zero means charging is disabled
    ChargeLimit,
    DischargeLimit,
    /// Lifetime charged energy counter (kWh)
    EnergyCharged,
    EnergyDischarged,
}

/// Persisted battery record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_energy_charged_at_reference: Option<f64>,
    pub last_energy_discharged_at_reference: Option<f64>,
    pub last_reference_soc: Option<f64>,
    /// Last SoC reading, so a crossing spanning a restart is still seen
    #[serde(default)]
    pub last_soc: Option<f64>,
    /// Percent, from the last full cycle between two crossings of the same reference SoC
    pub round_trip_efficiency: Option<f64>,
}

/// Power thresholds the rebalance pass uses to toggle charging and discharging
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryThresholds {
    pub charge_power_min_w: f64,
    pub charge_power_max_w: f64,
    pub discharge_power_min_w: f64,
    pub discharge_power_max_w: f64,
}

/// Home battery controlled through its charge and discharge power limits.
///
/// The device is the source of truth: "charging enabled" means the reported
/// charge limit is above zero. Toggles are no-ops when the device already
/// reports the wanted state, and are rate limited so a new command is not
/// issued before the previous one had time to show up in telemetry.
#[derive(Debug, Clone)]
pub struct Battery {
    cfg: BatteryConfig,
    state: BatteryState,
    soc: LatestValue<f64>,
    charge_limit: LatestValue<f64>,
    discharge_limit: LatestValue<f64>,
    energy_charged: LatestValue<f64>,
    energy_discharged: LatestValue<f64>,
    settle: Duration,
    inputs: Vec<(String, BatterySignal)>,
}

impl Battery {
    pub fn new(cfg: BatteryConfig) -> Result<Self, ConfigError> {
        cfg.validate()
            .map_err(|e| ConfigError::from_validation(&cfg.id, e))?;
        if cfg.minimum_soc >= cfg.full_soc {
            return Err(ConfigError::invalid(&cfg.id, "minimum_soc must be below full_soc"));
        }
        if cfg.optimal_charge_power_min_w > cfg.optimal_charge_power_max_w
            || cfg.optimal_discharge_power_min_w > cfg.optimal_discharge_power_max_w
        {
            return Err(ConfigError::invalid(
                &cfg.id,
                "optimal power minimum exceeds maximum",
            ));
        }

        let settle = Duration::try_seconds(cfg.control_settle_seconds)
            .ok_or_else(|| ConfigError::invalid(&cfg.id, "control_settle_seconds out of range"))?;

        let mut inputs = vec![
            (cfg.soc_sensor.clone(), BatterySignal::StateOfCharge),
            (cfg.charge_limit_entity.clone(), BatterySignal::ChargeLimit),
            (cfg.discharge_limit_entity.clone(), BatterySignal::DischargeLimit),
        ];
        if let Some(sensor) = &cfg.charged_energy_sensor {
            inputs.push((sensor.clone(), BatterySignal::EnergyCharged));
        }
        if let Some(sensor) = &cfg.discharged_energy_sensor {
            inputs.push((sensor.clone(), BatterySignal::EnergyDischarged));
        }

        Ok(Self {
            cfg,
            state: BatteryState::default(),
            soc: LatestValue::empty(),
            charge_limit: LatestValue::empty(),
            discharge_limit: LatestValue::empty(),
            energy_charged: LatestValue::empty(),
            energy_discharged: LatestValue::empty(),
            settle,
            inputs,
        })
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn inputs(&self) -> &[(String, BatterySignal)] {
        &self.inputs
    }

    pub fn state(&self) -> &BatteryState {
        &self.state
    }

    pub fn restore(&mut self, state: BatteryState) {
        self.state = state;
    }

    /// Apply one reading. Returns `true` when the persisted record changed.
    pub fn ingest(&mut self, signal: BatterySignal, reading: Option<f64>) -> bool {
        match signal {
            BatterySignal::StateOfCharge => {
                let Some(soc) = reading else { return false };
                self.soc.update(Some(soc));
                match self.state.last_soc.replace(soc) {
                    Some(previous) if previous == soc => false,
                    Some(previous) => {
                        self.track_reference_crossing(previous, soc);
                        true
                    }
                    None => true,
                }
            }
            BatterySignal::ChargeLimit => {
                self.charge_limit.update(reading);
                false
            }
            BatterySignal::DischargeLimit => {
                self.discharge_limit.update(reading);
                false
            }
            BatterySignal::EnergyCharged => {
                self.energy_charged.update(reading);
                false
            }
            BatterySignal::EnergyDischarged => {
                self.energy_discharged.update(reading);
                false
            }
        }
    }

    pub fn soc(&self) -> Option<f64> {
        self.soc.get()
    }

    pub fn can_charge(&self) -> bool {
        self.charge_limit.get_or(0.0) > 0.0
    }

    pub fn can_discharge(&self) -> bool {
        self.discharge_limit.get_or(0.0) > 0.0
    }

    /// At or below the reserve. An unknown SoC counts as empty.
    pub fn is_empty(&self) -> bool {
        self.soc.get().map_or(true, |soc| soc <= self.cfg.minimum_soc)
    }

    pub fn is_full(&self) -> bool {
        self.soc.get().is_some_and(|soc| soc >= self.cfg.full_soc)
    }

    /// Energy above the reserve (kWh).
    pub fn remaining_available_capacity(&self) -> f64 {
        let Some(soc) = self.soc.get() else { return 0.0 };
        (self.cfg.capacity_kwh * (soc - self.cfg.minimum_soc) / 100.0).max(0.0)
    }

    /// Discharge power a consumer may count on when battery use is allowed.
    pub fn available_discharge_power(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.cfg
            .optimal_discharge_power_max_w
            .min(self.cfg.max_discharge_power_w)
    }

    pub fn thresholds(&self) -> BatteryThresholds {
        BatteryThresholds {
            charge_power_min_w: self.cfg.optimal_charge_power_min_w,
            charge_power_max_w: self.cfg.optimal_charge_power_max_w,
            discharge_power_min_w: self.cfg.optimal_discharge_power_min_w,
            discharge_power_max_w: self.cfg.optimal_discharge_power_max_w,
        }
    }

    pub fn round_trip_efficiency(&self) -> Option<f64> {
        self.state.round_trip_efficiency
    }

    /// Enough time passed since the last issued command for its effect to be visible.
    pub fn can_control(&self, now: DateTime<Utc>) -> bool {
        self.state.last_change_at.map_or(true, |at| now - at >= self.settle)
    }

    pub fn enable_charging(&mut self, now: DateTime<Utc>) -> Option<Command> {
        if self.can_charge() {
            return None;
        }
        let entity = self.cfg.charge_limit_entity.clone();
        self.issue(now, Command::set_numeric(entity, self.cfg.max_charge_power_w))
    }

    pub fn disable_charging(&mut self, now: DateTime<Utc>) -> Option<Command> {
        if !self.can_charge() {
            return None;
        }
        let entity = self.cfg.charge_limit_entity.clone();
        self.issue(now, Command::set_numeric(entity, 0.0))
    }

    pub fn enable_discharging(&mut self, now: DateTime<Utc>) -> Option<Command> {
        if self.can_discharge() {
            return None;
        }
        let entity = self.cfg.discharge_limit_entity.clone();
        self.issue(now, Command::set_numeric(entity, self.cfg.max_discharge_power_w))
    }

    pub fn disable_discharging(&mut self, now: DateTime<Utc>) -> Option<Command> {
        if !self.can_discharge() {
            return None;
        }
        let entity = self.cfg.discharge_limit_entity.clone();
        self.issue(now, Command::set_numeric(entity, 0.0))
    }

    fn issue(&mut self, now: DateTime<Utc>, command: Command) -> Option<Command> {
        if !self.can_control(now) {
            debug!(battery = %self.cfg.id, entity = %command.entity(), "waiting for previous command to settle");
            return None;
        }
        self.state.last_change_at = Some(now);
        Some(command)
    }

    /// Round-trip efficiency bookkeeping on every SoC move.
    ///
    /// Crossing the reference point that holds the current snapshot closes a
    /// cycle: with enough energy through the battery the efficiency is
    /// recomputed and the snapshot restarts there, otherwise the old snapshot
    /// is kept. Crossing a different reference point moves the snapshot.
    /// A jump over several points counts as crossing the nearest one.
    fn track_reference_crossing(&mut self, previous: f64, current: f64) -> bool {
        let Some(point) = self
            .cfg
            .rte_reference_points
            .iter()
            .copied()
            .filter(|&p| (previous < p && current >= p) || (previous > p && current <= p))
            .min_by(|a, b| (a - previous).abs().total_cmp(&(b - previous).abs()))
        else {
            return false;
        };
        let (Some(charged), Some(discharged)) = (self.energy_charged.get(), self.energy_discharged.get())
        else {
            return false;
        };

        if self.state.last_reference_soc == Some(point) {
            if let (Some(charged_ref), Some(discharged_ref)) = (
                self.state.last_energy_charged_at_reference,
                self.state.last_energy_discharged_at_reference,
            ) {
                let charged_delta = charged - charged_ref;
                let discharged_delta = discharged - discharged_ref;
                if charged_delta <= MIN_RTE_ENERGY_KWH || discharged_delta <= MIN_RTE_ENERGY_KWH {
                    return false;
                }
                let rte = (discharged_delta * 100.0 / charged_delta * 100.0).round() / 100.0;
                info!(
                    battery = %self.cfg.id,
                    reference_soc = point,
                    charged_kwh = charged_delta,
                    discharged_kwh = discharged_delta,
                    round_trip_efficiency = rte,
                    "round-trip efficiency updated"
                );
                self.state.round_trip_efficiency = Some(rte);
            }
        }

        self.state.last_reference_soc = Some(point);
        self.state.last_energy_charged_at_reference = Some(charged);
        self.state.last_energy_discharged_at_reference = Some(discharged);
        true
    }
}
