use validator::Validate;

use super::{ConsumerSignal, Evaluation, SignalContext, VariantBehavior};
use crate::config::{ConfigError, CoolingConfig};
use crate::domain::sample::LatestValue;
use crate::hardware::SignalValue;

/// Fridge, freezer or similar thermostat-driven load.
///
/// Needs energy once warmer than the target; at the maximum temperature the
/// need turns critical and the controller may no longer stop it.
#[derive(Debug, Clone)]
pub struct CoolingConsumer {
    cfg: CoolingConfig,
    temperature: LatestValue<f64>,
}

impl CoolingConsumer {
    pub fn new(id: &str, cfg: CoolingConfig) -> Result<Self, ConfigError> {
        cfg.validate().map_err(|e| ConfigError::from_validation(id, e))?;
        if cfg.max_temperature <= cfg.target_temperature {
            return Err(ConfigError::invalid(
                id,
                "max_temperature must be above target_temperature",
            ));
        }
        Ok(Self {
            cfg,
            temperature: LatestValue::empty(),
        })
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature.get()
    }

    fn at_max(&self) -> bool {
        self.temperature
            .get()
            .is_some_and(|t| t >= self.cfg.max_temperature)
    }
}

impl VariantBehavior for CoolingConsumer {
    fn inputs(&self) -> Vec<(String, ConsumerSignal)> {
        vec![(self.cfg.temperature_sensor.clone(), ConsumerSignal::Temperature)]
    }

    fn ingest(&mut self, signal: ConsumerSignal, value: &SignalValue) {
        if signal == ConsumerSignal::Temperature {
            self.temperature.update(value.as_numeric());
        }
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Evaluation {
        Evaluation {
            running: ctx.switch_on == Some(true),
            needs_energy: self
                .temperature
                .get()
                .is_some_and(|t| t >= self.cfg.target_temperature),
            critical: self.at_max(),
        }
    }

    fn may_stop(&self) -> bool {
        !self.at_max()
    }
}
