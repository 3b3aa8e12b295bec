//! # Actuator and sensor plumbing
//!
//! The controller never talks to devices directly. Sensor readings arrive as
//! [`TelemetryEvent`]s and actuation leaves as [`Command`]s through a
//! [`CommandChannel`] supplied by the host platform.

pub mod dispatcher;
pub mod ingest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub use dispatcher::CommandDispatcher;

/// Actuation failures reported by the host platform
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command channel unavailable: {0}")]
    Unavailable(String),
    #[error("Entity {entity} rejected command: {reason}")]
    Rejected { entity: String, reason: String },
    #[error("Command to {0} timed out")]
    Timeout(String),
}

/// One actuator request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    TurnOn { entity: String },
    TurnOff { entity: String },
    SetNumeric { entity: String, value: f64 },
    SetSelectOption { entity: String, option: String },
}

impl Command {
    pub fn turn_on(entity: impl Into<String>) -> Self {
        Self::TurnOn {
            entity: entity.into(),
        }
    }

    pub fn turn_off(entity: impl Into<String>) -> Self {
        Self::TurnOff {
            entity: entity.into(),
        }
    }

    pub fn set_numeric(entity: impl Into<String>, value: f64) -> Self {
        Self::SetNumeric {
            entity: entity.into(),
            value,
        }
    }

    pub fn set_select_option(entity: impl Into<String>, option: impl Into<String>) -> Self {
        Self::SetSelectOption {
            entity: entity.into(),
            option: option.into(),
        }
    }

    pub fn entity(&self) -> &str {
        match self {
            Self::TurnOn { entity }
            | Self::TurnOff { entity }
            | Self::SetNumeric { entity, .. }
            | Self::SetSelectOption { entity, .. } => entity,
        }
    }
}

/// Outbound actuation interface of the host platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn turn_on(&self, entity: &str) -> Result<(), CommandError>;
    async fn turn_off(&self, entity: &str) -> Result<(), CommandError>;
    async fn set_numeric(&self, entity: &str, value: f64) -> Result<(), CommandError>;
    async fn set_select_option(&self, entity: &str, option: &str) -> Result<(), CommandError>;
}

/// Route a [`Command`] to the matching channel operation.
pub async fn execute(channel: &dyn CommandChannel, command: &Command) -> Result<(), CommandError> {
    match command {
        Command::TurnOn { entity } => channel.turn_on(entity).await,
        Command::TurnOff { entity } => channel.turn_off(entity).await,
        Command::SetNumeric { entity, value } => channel.set_numeric(entity, *value).await,
        Command::SetSelectOption { entity, option } => {
            channel.set_select_option(entity, option).await
        }
    }
}

/// Reading carried by a telemetry event. `None` means the sensor reported
/// itself unavailable, which is not the same as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalValue {
    Numeric(Option<f64>),
    Text(Option<String>),
    Switch(Option<bool>),
}

impl SignalValue {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => v.filter(|v| v.is_finite()),
            Self::Text(Some(s)) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Self::Switch(v) => v.map(|on| if on { 1.0 } else { 0.0 }),
            Self::Text(None) => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(v) => v.clone(),
            Self::Numeric(v) => v.map(|v| v.to_string()),
            Self::Switch(v) => v.map(|on| if on { "on".into() } else { "off".into() }),
        }
    }

    pub fn as_switch(&self) -> Option<bool> {
        match self {
            Self::Switch(v) => *v,
            Self::Numeric(v) => v.map(|v| v != 0.0),
            Self::Text(Some(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => Some(true),
                "off" | "false" | "0" => Some(false),
                _ => None,
            },
            Self::Text(None) => None,
        }
    }
}

/// A state change of one entity on the host platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: SignalValue,
}

impl TelemetryEvent {
    pub fn numeric(entity_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            value: SignalValue::Numeric(Some(value)),
        }
    }

    pub fn text(
        entity_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            value: SignalValue::Text(Some(value.into())),
        }
    }

    pub fn switch(entity_id: impl Into<String>, timestamp: DateTime<Utc>, on: bool) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            value: SignalValue::Switch(Some(on)),
        }
    }

    pub fn unavailable(entity_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            value: SignalValue::Numeric(None),
        }
    }
}

/// Dry-run channel: logs every command and reports success.
#[derive(Debug, Default)]
pub struct LoggingCommandChannel;

#[async_trait]
impl CommandChannel for LoggingCommandChannel {
    async fn turn_on(&self, entity: &str) -> Result<(), CommandError> {
        info!(entity, "turn_on");
        Ok(())
    }

    async fn turn_off(&self, entity: &str) -> Result<(), CommandError> {
        info!(entity, "turn_off");
        Ok(())
    }

    async fn set_numeric(&self, entity: &str, value: f64) -> Result<(), CommandError> {
        info!(entity, value, "set_numeric");
        Ok(())
    }

    async fn set_select_option(&self, entity: &str, option: &str) -> Result<(), CommandError> {
        info!(entity, option, "set_select_option");
        Ok(())
    }
}

/// Keeps every command it receives, in order.
#[derive(Debug, Default)]
pub struct RecordingCommandChannel {
    commands: Mutex<Vec<Command>>,
}

impl RecordingCommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn take(&self) -> Vec<Command> {
        std::mem::take(&mut *self.commands.lock())
    }
}

#[async_trait]
impl CommandChannel for RecordingCommandChannel {
    async fn turn_on(&self, entity: &str) -> Result<(), CommandError> {
        self.commands.lock().push(Command::turn_on(entity));
        Ok(())
    }

    async fn turn_off(&self, entity: &str) -> Result<(), CommandError> {
        self.commands.lock().push(Command::turn_off(entity));
        Ok(())
    }

    async fn set_numeric(&self, entity: &str, value: f64) -> Result<(), CommandError> {
        self.commands.lock().push(Command::set_numeric(entity, value));
        Ok(())
    }

    async fn set_select_option(&self, entity: &str, option: &str) -> Result<(), CommandError> {
        self.commands
            .lock()
            .push(Command::set_select_option(entity, option));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_signal_value_conversions() {
        assert_eq!(SignalValue::Text(Some(" 21.5 ".into())).as_numeric(), Some(21.5));
        assert_eq!(SignalValue::Text(Some("unknown".into())).as_numeric(), None);
        assert_eq!(SignalValue::Numeric(Some(f64::NAN)).as_numeric(), None);
        assert_eq!(SignalValue::Text(Some("ON".into())).as_switch(), Some(true));
        assert_eq!(SignalValue::Numeric(Some(0.0)).as_switch(), Some(false));
        assert_eq!(SignalValue::Switch(None).as_switch(), None);
        assert_eq!(SignalValue::Switch(Some(true)).as_text().as_deref(), Some("on"));
    }

    #[test]
    fn test_telemetry_event_json() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let line = r#"{"entity_id":"sensor.import","timestamp":"2024-03-05T12:00:00Z","value":{"numeric":1500.0}}"#;
        let event: TelemetryEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event, TelemetryEvent::numeric("sensor.import", ts, 1500.0));

        let unavailable = r#"{"entity_id":"sensor.import","timestamp":"2024-03-05T12:00:00Z","value":{"numeric":null}}"#;
        let event: TelemetryEvent = serde_json::from_str(unavailable).unwrap();
        assert_eq!(event.value.as_numeric(), None);
    }

    #[tokio::test]
    async fn test_execute_routes_to_channel() {
        let mut channel = MockCommandChannel::new();
        channel
            .expect_set_select_option()
            .withf(|entity, option| entity == "select.heat_pump" && option == "blocked")
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_turn_off()
            .returning(|entity| {
                Err(CommandError::Rejected {
                    entity: entity.to_string(),
                    reason: "offline".into(),
                })
            });

        execute(&channel, &Command::set_select_option("select.heat_pump", "blocked"))
            .await
            .unwrap();
        let err = execute(&channel, &Command::turn_off("switch.heater")).await;
        assert!(matches!(err, Err(CommandError::Rejected { .. })));
    }
}
