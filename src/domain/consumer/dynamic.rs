use validator::Validate;

use super::{ConsumerSignal, Evaluation, SignalContext, VariantBehavior};
use crate::config::{ConfigError, DynamicConfig};
use crate::domain::sample::LatestValue;
use crate::hardware::{Command, SignalValue};

/// Setpoint changes smaller than this are not worth a command (A).
const CURRENT_DEADBAND_A: f64 = 0.5;

/// Current range of a modulating consumer, converted to watts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicLimits {
    pub min_current_a: f64,
    pub max_current_a: f64,
    /// Watts per ampere across all phases
    pub watts_per_amp: f64,
    pub min_power_w: f64,
    pub max_power_w: f64,
}

impl DynamicLimits {
    /// Whole-ampere current that fits in `available_w`, capped at the maximum.
    /// `None` when not even the minimum current fits.
    pub fn current_for(&self, available_w: f64) -> Option<f64> {
        let amps = (available_w / self.watts_per_amp).floor().min(self.max_current_a);
        (amps >= self.min_current_a).then_some(amps)
    }
}

/// EV charger or other load whose current can be modulated.
#[derive(Debug, Clone)]
pub struct DynamicConsumer {
    cfg: DynamicConfig,
    status: Option<String>,
    reported_current: LatestValue<f64>,
}

impl DynamicConsumer {
    pub fn new(id: &str, cfg: DynamicConfig) -> Result<Self, ConfigError> {
        cfg.validate().map_err(|e| ConfigError::from_validation(id, e))?;
        if cfg.min_current_a > cfg.max_current_a {
            return Err(ConfigError::invalid(id, "min_current_a exceeds max_current_a"));
        }
        Ok(Self {
            cfg,
            status: None,
            reported_current: LatestValue::empty(),
        })
    }

    pub fn limits(&self) -> DynamicLimits {
        let watts_per_amp = self.cfg.voltage_v * f64::from(self.cfg.phases);
        DynamicLimits {
            min_current_a: self.cfg.min_current_a,
            max_current_a: self.cfg.max_current_a,
            watts_per_amp,
            min_power_w: self.cfg.min_current_a * watts_per_amp,
            max_power_w: self.cfg.max_current_a * watts_per_amp,
        }
    }

    pub fn reported_current(&self) -> Option<f64> {
        self.reported_current.get()
    }

    pub fn current_command(&self, amps: f64) -> Option<Command> {
        if self
            .reported_current
            .get()
            .is_some_and(|current| (current - amps).abs() < CURRENT_DEADBAND_A)
        {
            return None;
        }
        Some(Command::set_numeric(&self.cfg.current_entity, amps))
    }

    fn connected(&self) -> bool {
        if self.cfg.status_sensor.is_none() {
            return true;
        }
        self.status
            .as_deref()
            .is_some_and(|s| self.cfg.connected_states.iter().any(|c| c.eq_ignore_ascii_case(s)))
    }
}

impl VariantBehavior for DynamicConsumer {
    fn inputs(&self) -> Vec<(String, ConsumerSignal)> {
        let mut inputs = vec![(self.cfg.current_entity.clone(), ConsumerSignal::ChargerCurrent)];
        if let Some(sensor) = &self.cfg.status_sensor {
            inputs.push((sensor.clone(), ConsumerSignal::ChargerStatus));
        }
        inputs
    }

    fn ingest(&mut self, signal: ConsumerSignal, value: &SignalValue) {
        match signal {
            ConsumerSignal::ChargerCurrent => {
                self.reported_current.update(value.as_numeric());
            }
            ConsumerSignal::ChargerStatus => {
                if let Some(status) = value.as_text() {
                    self.status = Some(status);
                }
            }
            _ => {}
        }
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Evaluation {
        let running = match ctx.power_w {
            Some(w) => w > self.cfg.running_power_threshold_w,
            None => ctx.switch_on == Some(true),
        };
        Evaluation {
            running,
            needs_energy: self.connected(),
            critical: false,
        }
    }

    fn honors_max_timeout(&self) -> bool {
        false
    }

    fn stop_commands(&self, ctx: &SignalContext<'_>) -> Vec<Command> {
        match ctx.switch_command(false) {
            Some(command) => vec![command],
            None if ctx.switch.is_none() => self.current_command(0.0).into_iter().collect(),
            None => Vec::new(),
        }
    }
}
