//! # Rebalance pass
//!
//! Runs once per interval over the whole site. Batteries are gated first,
//! then consumers are visited in configured order. Each consumer sees the
//! grid estimate through its own lookback plus every adjustment made earlier
//! in the same pass, so the budget is consumed sequentially and the outcome
//! is deterministic for a given order.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use strum::Display;
use tracing::{debug, info};

use super::site::Site;
use crate::config::{ConfigError, ConsumerKind, ControllerConfig};
use crate::domain::consumer::{Block, BlockReason, Variant};
use crate::domain::Battery;
use crate::hardware::Command;

#[derive(Debug, Clone, Copy, PartialEq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Start,
    Block(BlockReason),
    Unblock { timed_out: bool },
    /// Over budget but not allowed to stop; retried next pass
    Ineligible,
    Boost,
    Unboost,
    SetCurrent { amps: f64 },
    EnableCharging,
    DisableCharging,
    EnableDischarging,
    DisableDischarging,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub entity: String,
    pub action: Action,
    pub estimated_w: f64,
    pub budget_w: f64,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub commands: Vec<Command>,
    pub decisions: Vec<Decision>,
    pub dirty_consumers: BTreeSet<usize>,
    pub dirty_batteries: BTreeSet<usize>,
}

impl TickOutcome {
    pub fn actions_for(&self, entity: &str) -> Vec<Action> {
        self.decisions
            .iter()
            .filter(|d| d.entity == entity)
            .map(|d| d.action)
            .collect()
    }
}

/// Load figures for one consumer within a pass
#[derive(Debug, Clone, Copy)]
struct View {
    estimate: f64,
    own_w: f64,
    correction: f64,
    assist: f64,
    projected: f64,
}

struct Pass {
    now: DateTime<Utc>,
    budget: f64,
    battery_assist: f64,
    applied: f64,
    out: TickOutcome,
}

impl Pass {
    fn record(&mut self, entity: &str, action: Action, estimated_w: f64, commands: Vec<Command>) {
        match action {
            Action::Ineligible => debug!(
                entity,
                estimated_w,
                budget_w = self.budget,
                "over budget but not eligible to stop"
            ),
            _ => info!(
                entity,
                action = %action,
                estimated_w,
                budget_w = self.budget,
                commands = commands.len(),
                "rebalance decision"
            ),
        }
        self.out.commands.extend(commands);
        self.out.decisions.push(Decision {
            entity: entity.to_string(),
            action,
            estimated_w,
            budget_w: self.budget,
        });
    }
}

#[derive(Debug, Clone)]
pub struct RebalanceEngine {
    max_block: Duration,
}

impl Default for RebalanceEngine {
    fn default() -> Self {
        Self::new(Duration::minutes(15))
    }
}

impl RebalanceEngine {
    pub fn new(max_block: Duration) -> Self {
        Self { max_block }
    }

    pub fn from_config(cfg: &ControllerConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(cfg.max_block()?))
    }

    pub fn tick(&self, site: &mut Site, now: DateTime<Utc>) -> TickOutcome {
        let mut pass = Pass {
            now,
            budget: site.grid.peak_budget(),
            battery_assist: 0.0,
            applied: 0.0,
            out: TickOutcome::default(),
        };

        for (idx, consumer) in site.consumers.iter_mut().enumerate() {
            if consumer.refresh(now) {
                pass.out.dirty_consumers.insert(idx);
            }
        }

        self.balance_batteries(site, &mut pass);
        pass.battery_assist = site
            .batteries
            .iter()
            .map(Battery::available_discharge_power)
            .sum();

        for idx in 0..site.consumers.len() {
            if site.consumers[idx].is_controllable() {
                self.balance_consumer(site, idx, &mut pass);
            }
        }

        debug!(
            budget_w = pass.budget,
            applied_w = pass.applied,
            commands = pass.out.commands.len(),
            "rebalance pass done"
        );
        pass.out
    }

    fn balance_batteries(&self, site: &mut Site, pass: &mut Pass) {
        let load = site.grid.current_load_minus_batteries();
        let now = pass.now;

        for (idx, battery) in site.batteries.iter_mut().enumerate() {
            let t = battery.thresholds();
            let charge = !battery.is_full()
                && (-load >= t.charge_power_min_w || load + t.charge_power_max_w <= pass.budget);
            let discharge = !battery.is_empty() && load >= t.discharge_power_min_w;

            let (command, action) = if charge {
                (battery.enable_charging(now), Action::EnableCharging)
            } else {
                (battery.disable_charging(now), Action::DisableCharging)
            };
            if let Some(command) = command {
                pass.record(battery.id(), action, load, vec![command]);
                pass.out.dirty_batteries.insert(idx);
            }

            let (command, action) = if discharge {
                (battery.enable_discharging(now), Action::EnableDischarging)
            } else {
                (battery.disable_discharging(now), Action::DisableDischarging)
            };
            if let Some(command) = command {
                pass.record(battery.id(), action, load, vec![command]);
                pass.out.dirty_batteries.insert(idx);
            }
        }
    }

    fn view(&self, site: &Site, idx: usize, pass: &Pass) -> View {
        let consumer = &site.consumers[idx];
        let estimate = site.grid.estimated_load(consumer.load_estimate(), pass.now) + pass.applied;
        let own_w = consumer.average_power(pass.now);
        let correction = consumer.load_correction(pass.now);
        let assist = if consumer.may_use_battery() {
            pass.battery_assist
        } else {
            0.0
        };
        View {
            estimate,
            own_w,
            correction,
            assist,
            projected: estimate + correction - assist,
        }
    }

    fn balance_consumer(&self, site: &mut Site, idx: usize, pass: &mut Pass) {
        let view = self.view(site, idx, pass);
        if !self.apply_blocks(site, idx, &view, pass) {
            return;
        }
        match site.consumers[idx].kind() {
            ConsumerKind::Dynamic => self.modulate(site, idx, &view, pass),
            ConsumerKind::SgReady => self.balance_sg_ready(site, idx, &view, pass),
            _ => self.balance_switched(site, idx, &view, pass),
        }
    }

    /// Blackout and block bookkeeping. Returns whether the consumer may be
    /// evaluated further this pass.
    fn apply_blocks(&self, site: &mut Site, idx: usize, view: &View, pass: &mut Pass) -> bool {
        let now = pass.now;
        let consumer = &mut site.consumers[idx];
        let blackout = consumer.in_blackout(now);

        match consumer.block() {
            Some(Block {
                reason: BlockReason::TimeWindow,
                ..
            }) if blackout => {
                pass.out.commands.extend(consumer.enforce_block());
                false
            }
            Some(Block {
                reason: BlockReason::TimeWindow,
                ..
            }) => {
                let commands = consumer.unblock(now, false);
                pass.record(consumer.id(), Action::Unblock { timed_out: false }, view.projected, commands);
                pass.out.dirty_consumers.insert(idx);
                true
            }
            _ if blackout => {
                let was_running = consumer.is_running();
                let commands = consumer.block_for(BlockReason::TimeWindow, now);
                if was_running {
                    pass.applied -= view.own_w;
                }
                pass.record(
                    consumer.id(),
                    Action::Block(BlockReason::TimeWindow),
                    view.projected,
                    commands,
                );
                pass.out.dirty_consumers.insert(idx);
                false
            }
            Some(block) => {
                let timed_out = now - block.since >= self.max_block;
                let relieved = block.since < now && view.projected <= pass.budget;
                if !(timed_out || relieved) {
                    if block.since < now {
                        pass.out.commands.extend(consumer.enforce_block());
                    }
                    return false;
                }
                let commands = consumer.unblock(now, timed_out);
                pass.record(consumer.id(), Action::Unblock { timed_out }, view.projected, commands);
                pass.out.dirty_consumers.insert(idx);
                true
            }
            None => true,
        }
    }

    fn balance_switched(&self, site: &mut Site, idx: usize, view: &View, pass: &mut Pass) {
        let now = pass.now;
        let consumer = &site.consumers[idx];

        if view.projected > pass.budget {
            if consumer.is_running() {
                self.shed(site, idx, view, pass);
            } else if consumer.can_start(now) {
                if consumer.is_critical() {
                    self.start(site, idx, view, pass);
                } else if self.release_delegates(site, idx, view.projected - pass.budget, pass) {
                    self.start(site, idx, view, pass);
                }
            }
            return;
        }

        if consumer.can_start(now) {
            self.start(site, idx, view, pass);
        }
    }

    fn balance_sg_ready(&self, site: &mut Site, idx: usize, view: &View, pass: &mut Pass) {
        let now = pass.now;
        let consumer = &site.consumers[idx];
        let Variant::SgReady(device) = consumer.variant() else {
            return;
        };
        let boost_surplus_w = device.boost_surplus_w();

        if view.projected > pass.budget {
            let running = consumer.is_running();
            if !running && (!consumer.needs_energy() || consumer.is_critical()) {
                return;
            }
            if running {
                // shed covers grace, delegates and eligibility for running devices
                self.shed(site, idx, view, pass);
                return;
            }
            if consumer.in_reblock_grace(now) {
                return;
            }
            let consumer = &mut site.consumers[idx];
            let commands = consumer.block_for(BlockReason::PeakLoad, now);
            pass.record(consumer.id(), Action::Block(BlockReason::PeakLoad), view.projected, commands);
            pass.out.dirty_consumers.insert(idx);
            return;
        }

        let consumer = &mut site.consumers[idx];
        if consumer.is_boosted() {
            if view.estimate > 0.0 {
                let commands = consumer.unboost();
                pass.record(consumer.id(), Action::Unboost, view.estimate, commands);
                pass.out.dirty_consumers.insert(idx);
            }
        } else if consumer.needs_energy() && -view.estimate >= boost_surplus_w {
            let commands = consumer.boost();
            pass.applied += view.correction;
            pass.record(consumer.id(), Action::Boost, view.estimate, commands);
            pass.out.dirty_consumers.insert(idx);
        }
    }

    fn modulate(&self, site: &mut Site, idx: usize, view: &View, pass: &mut Pass) {
        let now = pass.now;
        let consumer = &site.consumers[idx];
        let Some(limits) = consumer.dynamic_limits() else {
            return;
        };
        let running = consumer.is_running();
        if !running && !consumer.can_start(now) {
            return;
        }

        let base = view.estimate - view.own_w;
        let available = pass.budget + view.assist - base;
        let target = limits
            .current_for(available)
            .or_else(|| consumer.is_critical().then_some(limits.min_current_a));

        match target {
            Some(amps) => {
                let mut commands: Vec<Command> = consumer.set_current(amps).into_iter().collect();
                if !running {
                    commands.extend(consumer.start());
                }
                if commands.is_empty() {
                    return;
                }
                pass.applied += amps * limits.watts_per_amp - view.own_w;
                let action = if running {
                    Action::SetCurrent { amps }
                } else {
                    Action::Start
                };
                pass.record(consumer.id(), action, view.projected, commands);
            }
            None if running => self.shed(site, idx, view, pass),
            None => {}
        }
    }

    /// Stop a running consumer for peak load, preferring its group's delegates.
    fn shed(&self, site: &mut Site, idx: usize, view: &View, pass: &mut Pass) {
        let now = pass.now;
        if site.consumers[idx].in_reblock_grace(now) {
            debug!(consumer = %site.consumers[idx].id(), "in re-block grace period");
            return;
        }
        if self.release_delegates(site, idx, view.projected - pass.budget, pass) {
            return;
        }

        let consumer = &mut site.consumers[idx];
        if consumer.can_force_stop_on_peak_load(now) {
            let commands = consumer.block_for(BlockReason::PeakLoad, now);
            pass.applied -= view.own_w;
            pass.record(consumer.id(), Action::Block(BlockReason::PeakLoad), view.projected, commands);
            pass.out.dirty_consumers.insert(idx);
        } else {
            pass.record(consumer.id(), Action::Ineligible, view.projected, Vec::new());
        }
    }

    fn start(&self, site: &Site, idx: usize, view: &View, pass: &mut Pass) {
        let consumer = &site.consumers[idx];
        let commands = consumer.start();
        pass.applied += view.correction;
        pass.record(consumer.id(), Action::Start, view.projected, commands);
    }

    /// Block running delegates of the consumer's groups until `needed_w` is
    /// freed. Nothing is blocked unless the delegates together free enough.
    fn release_delegates(&self, site: &mut Site, idx: usize, needed_w: f64, pass: &mut Pass) -> bool {
        let now = pass.now;
        let id = site.consumers[idx].id().to_string();
        let candidates: Vec<(usize, f64)> = site
            .groups
            .delegates_for(&id, idx)
            .into_iter()
            .filter(|&d| {
                let delegate = &site.consumers[d];
                delegate.is_running()
                    && !delegate.is_blocked()
                    && delegate.can_force_stop_on_peak_load(now)
            })
            .map(|d| (d, site.consumers[d].average_power(now)))
            .collect();

        let releasable: f64 = candidates.iter().map(|(_, w)| w).sum();
        if candidates.is_empty() || releasable < needed_w {
            return false;
        }

        let mut released = 0.0;
        for (d, watts) in candidates {
            if released >= needed_w {
                break;
            }
            let delegate = &mut site.consumers[d];
            let commands = delegate.block_for(BlockReason::Delegated, now);
            pass.applied -= watts;
            released += watts;
            pass.record(delegate.id(), Action::Block(BlockReason::Delegated), needed_w, commands);
            pass.out.dirty_consumers.insert(d);
        }
        info!(consumer = %id, released_w = released, needed_w, "balanced through delegates");
        true
    }
}
