use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::sample::{LatestValue, SensorSample, SlidingWindow};
use crate::config::GridConfig;

/// Safety minimum for the peak budget (W).
pub const DEFAULT_PEAK_FLOOR_W: f64 = 2500.0;

/// Grid-side signals the monitor subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GridSignal {
    Import,
    Export,
    BatteryCharge,
    BatteryDischarge,
    /// Highest import registered this billing period, in the sensor's own unit
    PeakImport,
    /// Meter-reported average demand for the running billing interval (W)
    AverageDemand,
    SolarProduction,
    SolarForecastNextHour,
}

/// How a consumer looks at the grid when deciding about itself.
///
/// Slow thermal loads use trailing averages; fast loads react to the
/// instantaneous figure. The solar variants subtract a share of the expected
/// production increase over the next hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadEstimateMethod {
    #[default]
    Instant,
    SolarForecastNow,
    #[serde(rename = "solar_forecast_30min")]
    #[strum(serialize = "solar_forecast_30min")]
    SolarForecast30Min,
    #[serde(rename = "solar_forecast_60min")]
    #[strum(serialize = "solar_forecast_60min")]
    SolarForecast60Min,
    #[serde(rename = "average_30s")]
    #[strum(serialize = "average_30s")]
    Average30s,
    #[serde(rename = "average_1m")]
    #[strum(serialize = "average_1m")]
    Average1m,
    #[serde(rename = "average_2m")]
    #[strum(serialize = "average_2m")]
    Average2m,
    #[serde(rename = "average_5m")]
    #[strum(serialize = "average_5m")]
    Average5m,
}

impl LoadEstimateMethod {
    /// Lookback used for the estimate and for the consumer's own power average.
    pub fn lookback(&self) -> Duration {
        match self {
            Self::Average30s => Duration::seconds(30),
            Self::Average1m => Duration::minutes(1),
            Self::Average2m => Duration::minutes(2),
            Self::Average5m => Duration::minutes(5),
            _ => Duration::seconds(10),
        }
    }

    fn solar_weight(&self) -> Option<f64> {
        match self {
            Self::SolarForecastNow => Some(0.0),
            Self::SolarForecast30Min => Some(0.3),
            Self::SolarForecast60Min => Some(1.0),
            _ => None,
        }
    }
}

/// Point-in-time view of the grid, each figure at its last known value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub import_w: f64,
    pub export_w: f64,
    pub battery_charge_w: f64,
    pub battery_discharge_w: f64,
    pub current_load_w: f64,
    pub load_minus_batteries_w: f64,
    pub peak_budget_w: f64,
}

#[derive(Debug, Clone)]
struct MonitoredSignal {
    window: SlidingWindow,
    latest: LatestValue<f64>,
}

impl MonitoredSignal {
    fn new(capacity: usize) -> Self {
        Self {
            window: SlidingWindow::new(capacity),
            latest: LatestValue::empty(),
        }
    }

    fn push(&mut self, reading: Option<f64>, timestamp: DateTime<Utc>) {
        if let Some(value) = reading {
            self.window.push(SensorSample::new(timestamp, value));
            self.latest.update(Some(value));
        }
    }

    fn current(&self) -> f64 {
        self.latest.get_or(0.0)
    }

    fn average(&self, lookback: Duration, now: DateTime<Utc>) -> f64 {
        self.window.average_over(lookback, now).unwrap_or(0.0)
    }
}

/// Aggregates grid and battery power flows into load figures and the peak budget.
///
/// Unavailable readings never zero a figure: every signal degrades to its last
/// known value, so a stalled sensor yields stale numbers rather than a stall.
#[derive(Debug, Clone)]
pub struct GridMonitor {
    import: MonitoredSignal,
    export: MonitoredSignal,
    battery_charge: MonitoredSignal,
    battery_discharge: MonitoredSignal,
    peak_import: LatestValue<f64>,
    average_demand: LatestValue<f64>,
    solar_production: LatestValue<f64>,
    solar_forecast_next_hour: LatestValue<f64>,
    inputs: Vec<(String, GridSignal)>,
    peak_scale: f64,
    peak_floor_w: f64,
}

impl GridMonitor {
    pub fn new(cfg: &GridConfig) -> Self {
        let capacity = cfg.window_capacity;
        let mut inputs = vec![
            (cfg.import_sensor.clone(), GridSignal::Import),
            (cfg.export_sensor.clone(), GridSignal::Export),
            (cfg.peak_import_sensor.clone(), GridSignal::PeakImport),
        ];
        let optional = [
            (&cfg.battery_charge_sensor, GridSignal::BatteryCharge),
            (&cfg.battery_discharge_sensor, GridSignal::BatteryDischarge),
            (&cfg.average_demand_sensor, GridSignal::AverageDemand),
            (&cfg.solar_production_sensor, GridSignal::SolarProduction),
            (&cfg.solar_forecast_sensor, GridSignal::SolarForecastNextHour),
        ];
        inputs.extend(
            optional
                .into_iter()
                .filter_map(|(entity, signal)| entity.clone().map(|e| (e, signal))),
        );

        Self {
            import: MonitoredSignal::new(capacity),
            export: MonitoredSignal::new(capacity),
            battery_charge: MonitoredSignal::new(capacity),
            battery_discharge: MonitoredSignal::new(capacity),
            peak_import: LatestValue::empty(),
            average_demand: LatestValue::empty(),
            solar_production: LatestValue::empty(),
            solar_forecast_next_hour: LatestValue::empty(),
            inputs,
            peak_scale: cfg.peak_scale,
            peak_floor_w: cfg.peak_floor_w,
        }
    }

    /// Entity ids this monitor consumes, with the signal each one feeds.
    pub fn inputs(&self) -> &[(String, GridSignal)] {
        &self.inputs
    }

    pub fn ingest(&mut self, signal: GridSignal, reading: Option<f64>, timestamp: DateTime<Utc>) {
        match signal {
            GridSignal::Import => self.import.push(reading, timestamp),
            GridSignal::Export => self.export.push(reading, timestamp),
            GridSignal::BatteryCharge => self.battery_charge.push(reading, timestamp),
            GridSignal::BatteryDischarge => self.battery_discharge.push(reading, timestamp),
            GridSignal::PeakImport => {
                self.peak_import.update(reading);
            }
            GridSignal::AverageDemand => {
                self.average_demand.update(reading);
            }
            GridSignal::SolarProduction => {
                self.solar_production.update(reading);
            }
            GridSignal::SolarForecastNextHour => {
                self.solar_forecast_next_hour.update(reading);
            }
        }
    }

    /// Import minus export (W). Negative while exporting.
    pub fn current_load(&self) -> f64 {
        self.import.current() - self.export.current()
    }

    /// Site load with battery flows taken out: charging power is not demand,
    /// discharging power is demand the battery happens to cover.
    pub fn current_load_minus_batteries(&self) -> f64 {
        self.current_load() - self.battery_charge.current() + self.battery_discharge.current()
    }

    pub fn average_load(&self, lookback: Duration, now: DateTime<Utc>) -> f64 {
        self.import.average(lookback, now) - self.export.average(lookback, now)
    }

    pub fn average_load_minus_batteries(&self, lookback: Duration, now: DateTime<Utc>) -> f64 {
        self.average_load(lookback, now) - self.battery_charge.average(lookback, now)
            + self.battery_discharge.average(lookback, now)
    }

    /// Peak import reading scaled to watts, never below the safety floor.
    pub fn peak_budget(&self) -> f64 {
        match self.peak_import.get() {
            Some(raw) => (raw * self.peak_scale).max(self.peak_floor_w),
            None => self.peak_floor_w,
        }
    }

    /// Meter-reported average demand, or the 15 minute trailing load when the
    /// meter does not report one.
    pub fn current_average_demand(&self, now: DateTime<Utc>) -> f64 {
        self.average_demand
            .get()
            .unwrap_or_else(|| self.average_load(Duration::minutes(15), now))
    }

    /// Expected solar production increase over the next hour (W).
    pub fn solar_forecast_delta(&self) -> Option<f64> {
        let forecast = self.solar_forecast_next_hour.get()?;
        Some(forecast - self.solar_production.get_or(0.0))
    }

    /// Near-future load as seen through `method`, batteries excluded.
    pub fn estimated_load(&self, method: LoadEstimateMethod, now: DateTime<Utc>) -> f64 {
        if let Some(weight) = method.solar_weight() {
            let base = self.current_load_minus_batteries();
            return match self.solar_forecast_delta() {
                Some(delta) => base - weight * delta,
                None => base,
            };
        }
        match method {
            LoadEstimateMethod::Instant => self.current_load_minus_batteries(),
            _ => self.average_load_minus_batteries(method.lookback(), now),
        }
    }

    pub fn snapshot(&self) -> GridSnapshot {
        GridSnapshot {
            import_w: self.import.current(),
            export_w: self.export.current(),
            battery_charge_w: self.battery_charge.current(),
            battery_discharge_w: self.battery_discharge.current(),
            current_load_w: self.current_load(),
            load_minus_batteries_w: self.current_load_minus_batteries(),
            peak_budget_w: self.peak_budget(),
        }
    }
}
