use validator::Validate;

use super::{ConsumerSignal, Evaluation, SignalContext, VariantBehavior};
use crate::config::{ConfigError, SgReadyConfig};
use crate::hardware::{Command, SignalValue};

/// Heat pump with an SG-ready style operating mode.
///
/// The device decides for itself when to run; the controller only moves it
/// between blocked, normal and boosted through the mode select entity.
#[derive(Debug, Clone)]
pub struct SgReadyConsumer {
    cfg: SgReadyConfig,
    mode: Option<String>,
    device_state: Option<String>,
}

impl SgReadyConsumer {
    pub fn new(id: &str, cfg: SgReadyConfig) -> Result<Self, ConfigError> {
        cfg.validate().map_err(|e| ConfigError::from_validation(id, e))?;
        Ok(Self {
            cfg,
            mode: None,
            device_state: None,
        })
    }

    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }

    pub fn is_boosted(&self) -> bool {
        self.mode.as_deref() == Some(self.cfg.boosted_option.as_str())
    }

    pub fn boost_surplus_w(&self) -> f64 {
        self.cfg.boost_surplus_w
    }

    fn select(&self, option: &str) -> Vec<Command> {
        if self.mode.as_deref() == Some(option) {
            return Vec::new();
        }
        vec![Command::set_select_option(&self.cfg.mode_entity, option)]
    }

    pub fn block_commands(&self) -> Vec<Command> {
        self.select(&self.cfg.blocked_option)
    }

    pub fn normal_commands(&self) -> Vec<Command> {
        self.select(&self.cfg.normal_option)
    }

    pub fn boost_commands(&self) -> Vec<Command> {
        self.select(&self.cfg.boosted_option)
    }

    fn state_in(&self, states: &[String]) -> bool {
        self.device_state
            .as_deref()
            .is_some_and(|s| states.iter().any(|c| c.eq_ignore_ascii_case(s)))
    }
}

impl VariantBehavior for SgReadyConsumer {
    fn inputs(&self) -> Vec<(String, ConsumerSignal)> {
        vec![
            (self.cfg.mode_entity.clone(), ConsumerSignal::DeviceMode),
            (self.cfg.state_sensor.clone(), ConsumerSignal::DeviceState),
        ]
    }

    fn ingest(&mut self, signal: ConsumerSignal, value: &SignalValue) {
        let Some(text) = value.as_text() else { return };
        match signal {
            ConsumerSignal::DeviceMode => self.mode = Some(text),
            ConsumerSignal::DeviceState => self.device_state = Some(text),
            _ => {}
        }
    }

    fn evaluate(&self, ctx: &SignalContext<'_>) -> Evaluation {
        let drawing = ctx
            .power_w
            .is_some_and(|w| w > self.cfg.running_power_threshold_w);
        Evaluation {
            running: drawing || self.is_boosted(),
            needs_energy: self.state_in(&self.cfg.needs_energy_states),
            critical: self.state_in(&self.cfg.critical_states),
        }
    }

    fn start_commands(&self, _ctx: &SignalContext<'_>) -> Vec<Command> {
        self.normal_commands()
    }

    fn stop_commands(&self, _ctx: &SignalContext<'_>) -> Vec<Command> {
        self.block_commands()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heat_pump() -> SgReadyConsumer {
        let cfg = SgReadyConfig {
            mode_entity: "select.heat_pump_mode".into(),
            state_sensor: "sensor.heat_pump_state".into(),
            running_power_threshold_w: 300.0,
            blocked_option: "blocked".into(),
            normal_option: "normal".into(),
            boosted_option: "boosted".into(),
            needs_energy_states: vec!["energy_needed".into()],
            critical_states: vec!["critical".into()],
            boost_surplus_w: 1500.0,
        };
        SgReadyConsumer::new("heat_pump", cfg).unwrap()
    }

    #[test]
    fn test_mode_commands_are_idempotent() {
        let mut hp = heat_pump();
        assert_eq!(
            hp.block_commands(),
            vec![Command::set_select_option("select.heat_pump_mode", "blocked")]
        );
        hp.ingest(ConsumerSignal::DeviceMode, &SignalValue::Text(Some("blocked".into())));
        assert!(hp.block_commands().is_empty());
        assert_eq!(hp.normal_commands().len(), 1);
    }

    #[test]
    fn test_running_from_power_or_boost() {
        let mut hp = heat_pump();
        let idle = SignalContext {
            switch: None,
            switch_on: None,
            power_w: Some(50.0),
        };
        let drawing = SignalContext {
            power_w: Some(1200.0),
            ..idle
        };
        assert!(!hp.evaluate(&idle).running);
        assert!(hp.evaluate(&drawing).running);

        hp.ingest(ConsumerSignal::DeviceMode, &SignalValue::Text(Some("boosted".into())));
        assert!(hp.evaluate(&idle).running);

        hp.ingest(ConsumerSignal::DeviceState, &SignalValue::Text(Some("critical".into())));
        assert!(hp.evaluate(&idle).critical);
    }
}
