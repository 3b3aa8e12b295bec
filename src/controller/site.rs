use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use tracing::{error, info};

use crate::config::Config;
use crate::domain::{
    Battery, BatterySignal, Consumer, ConsumerGroup, ConsumerSignal, GridMonitor, GridSignal,
    GroupIndex,
};

/// Where one telemetry entity feeds into the site model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Grid(GridSignal),
    Battery(usize, BatterySignal),
    Consumer(usize, ConsumerSignal),
}

/// Every entity the controller owns, in configured order.
#[derive(Debug, Clone)]
pub struct Site {
    pub grid: GridMonitor,
    pub batteries: Vec<Battery>,
    pub consumers: Vec<Consumer>,
    pub groups: GroupIndex,
}

impl Site {
    /// Build all entities. An entity with a broken configuration is logged
    /// and left out; the rest of the site still runs.
    pub fn from_config(cfg: &Config, tz: Tz, now: DateTime<Utc>) -> Self {
        let grid = GridMonitor::new(&cfg.grid);

        let batteries: Vec<Battery> = cfg
            .batteries
            .iter()
            .filter_map(|b| match Battery::new(b.clone()) {
                Ok(battery) => Some(battery),
                Err(e) => {
                    error!(battery = %b.id, error = %e, "battery disabled: invalid configuration");
                    None
                }
            })
            .collect();

        let consumers: Vec<Consumer> = cfg
            .consumers
            .iter()
            .filter_map(|c| match Consumer::new(c.clone(), tz, now) {
                Ok(consumer) => Some(consumer),
                Err(e) => {
                    error!(consumer = %c.id, error = %e, "consumer disabled: invalid configuration");
                    None
                }
            })
            .collect();

        let groups = GroupIndex::new(cfg.groups.iter().map(ConsumerGroup::new).collect(), &consumers);

        info!(
            batteries = batteries.len(),
            consumers = consumers.len(),
            groups = groups.groups().len(),
            "site model built"
        );
        Self {
            grid,
            batteries,
            consumers,
            groups,
        }
    }

    /// Entity id to every place it feeds. One sensor may feed several entities.
    pub fn routes(&self) -> HashMap<String, Vec<Route>> {
        let mut routes: HashMap<String, Vec<Route>> = HashMap::new();
        for (entity, signal) in self.grid.inputs() {
            routes.entry(entity.clone()).or_default().push(Route::Grid(*signal));
        }
        for (idx, battery) in self.batteries.iter().enumerate() {
            for (entity, signal) in battery.inputs() {
                routes
                    .entry(entity.clone())
                    .or_default()
                    .push(Route::Battery(idx, *signal));
            }
        }
        for (idx, consumer) in self.consumers.iter().enumerate() {
            for (entity, signal) in consumer.inputs() {
                routes
                    .entry(entity.clone())
                    .or_default()
                    .push(Route::Consumer(idx, *signal));
            }
        }
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsumerConfig, ConsumerKind, ControllerConfig, GridConfig};
    use chrono::TimeZone;

    #[test]
    fn test_broken_consumer_is_skipped() {
        let mut broken = ConsumerConfig::simple("freezer", "switch.freezer", 150.0);
        broken.kind = ConsumerKind::Cooling;
        let mut heater = ConsumerConfig::simple("heater", "switch.heater", 2000.0);
        heater.power_sensor = Some("sensor.grid_import_power".into());

        let cfg = Config {
            controller: ControllerConfig::default(),
            grid: GridConfig::default(),
            batteries: vec![],
            consumers: vec![broken, heater],
            groups: vec![],
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let site = Site::from_config(&cfg, Tz::UTC, now);
        assert_eq!(site.consumers.len(), 1);
        assert_eq!(site.consumers[0].id(), "heater");

        let routes = site.routes();
        assert_eq!(
            routes["sensor.grid_import_power"],
            vec![
                Route::Grid(GridSignal::Import),
                Route::Consumer(0, ConsumerSignal::Power)
            ]
        );
        assert_eq!(
            routes["switch.heater"],
            vec![Route::Consumer(0, ConsumerSignal::Switch)]
        );
    }
}
