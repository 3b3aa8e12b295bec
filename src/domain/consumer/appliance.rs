use validator::Validate;

use super::{ConsumerSignal, Evaluation, SignalContext, VariantBehavior};
use crate::config::{ApplianceConfig, ConfigError};
use crate::hardware::{Command, SignalValue};

/// Washer, dryer or dishwasher reporting a program sub-state.
///
/// Driven either through a switch or through a select entity with start and
/// pause options. Without pause support a running program is never stopped.
#[derive(Debug, Clone)]
pub struct ApplianceConsumer {
    cfg: ApplianceConfig,
    has_switch: bool,
    sub_state: Option<String>,
}

impl ApplianceConsumer {
    pub fn new(id: &str, cfg: ApplianceConfig, has_switch: bool) -> Result<Self, ConfigError> {
        cfg.validate().map_err(|e| ConfigError::from_validation(id, e))?;
        let has_select = cfg.control_entity.is_some() && cfg.start_option.is_some();
        if !has_switch && !has_select {
            return Err(ConfigError::invalid(
                id,
                "appliance needs a switch or a control_entity with start_option",
            ));
        }
        if !has_switch && cfg.can_pause && cfg.pause_option.is_none() {
            return Err(ConfigError::invalid(id, "can_pause requires pause_option"));
        }
        Ok(Self {
            cfg,
            has_switch,
            sub_state: None,
        })
    }

    pub fn sub_state(&self) -> Option<&str> {
        self.sub_state.as_deref()
    }

    fn in_states(&self, states: &[String]) -> bool {
        self.sub_state
            .as_deref()
            .is_some_and(|s| states.iter().any(|c| c.eq_ignore_ascii_case(s)))
    }

    fn select(&self, option: Option<&String>) -> Vec<Command> {
        match (&self.cfg.control_entity, option) {
            (Some(entity), Some(option)) => vec![Command::set_select_option(entity, option)],
            _ => Vec::new(),
        }
    }
}

impl VariantBehavior for ApplianceConsumer {
    fn inputs(&self) -> Vec<(String, ConsumerSignal)> {
        vec![(self.cfg.state_sensor.clone(), ConsumerSignal::ApplianceState)]
    }

    fn ingest(&mut self, signal: ConsumerSignal, value: &SignalValue) {
        if signal == ConsumerSignal::ApplianceState {
            if let Some(state) = value.as_text() {
                self.sub_state = Some(state);
            }
        }
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Evaluation {
        Evaluation {
            running: self.in_states(&self.cfg.running_states) && ctx.switch_on != Some(false),
            needs_energy: self.in_states(&self.cfg.start_states)
                || self.in_states(&self.cfg.paused_states),
            critical: self.in_states(&self.cfg.critical_states),
        }
    }

    fn may_stop(&self) -> bool {
        self.cfg.can_pause
    }

    fn honors_max_timeout(&self) -> bool {
        false
    }

    fn start_commands(&self, ctx: &SignalContext<'_>) -> Vec<Command> {
        if self.has_switch {
            return ctx.switch_command(true).into_iter().collect();
        }
        if self.in_states(&self.cfg.running_states) {
            return Vec::new();
        }
        self.select(self.cfg.start_option.as_ref())
    }

    fn stop_commands(&self, ctx: &SignalContext<'_>) -> Vec<Command> {
        if self.has_switch {
            return ctx.switch_command(false).into_iter().collect();
        }
        if !self.in_states(&self.cfg.running_states) {
            return Vec::new();
        }
        self.select(self.cfg.pause_option.as_ref())
    }
}
