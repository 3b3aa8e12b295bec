use super::{Evaluation, SignalContext, VariantBehavior};

/// Plain on/off load behind a switch. Always wants energy while off.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleConsumer;

impl VariantBehavior for SimpleConsumer {
    fn evaluate(&self, ctx: &SignalContext<'_>) -> Evaluation {
        Evaluation {
            running: ctx.switch_on == Some(true),
            needs_energy: true,
            critical: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Command;

    #[test]
    fn test_commands_skip_reported_state() {
        let ctx = SignalContext {
            switch: Some("switch.pool_pump"),
            switch_on: Some(true),
            power_w: None,
        };
        assert!(SimpleConsumer.start_commands(&ctx).is_empty());
        assert_eq!(
            SimpleConsumer.stop_commands(&ctx),
            vec![Command::turn_off("switch.pool_pump")]
        );
        assert!(SimpleConsumer.evaluate(&ctx).running);
    }
}
