use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::site::Site;
use crate::domain::GridSnapshot;

/// Human-readable state of one entity, as published to the metrics sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub entity: String,
    pub state: String,
    pub attributes: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteStatus {
    pub at: DateTime<Utc>,
    pub grid: GridSnapshot,
    pub last_tick: Option<DateTime<Utc>>,
    pub entities: Vec<EntityStatus>,
}

impl SiteStatus {
    pub fn entity(&self, id: &str) -> Option<&EntityStatus> {
        self.entities.iter().find(|e| e.entity == id)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish(&self, status: EntityStatus) -> anyhow::Result<()>;
}

/// Sink that only writes statuses to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMetricsSink;

#[async_trait]
impl MetricsSink for LoggingMetricsSink {
    async fn publish(&self, status: EntityStatus) -> anyhow::Result<()> {
        debug!(
            entity = %status.entity,
            state = %status.state,
            attributes = %status.attributes,
            "status"
        );
        Ok(())
    }
}

/// Fire-and-forget publication; a slow or failing sink never holds up the caller.
#[derive(Clone)]
pub struct StatusPublisher {
    sink: Arc<dyn MetricsSink>,
}

impl StatusPublisher {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    pub fn publish(&self, statuses: Vec<EntityStatus>) {
        if statuses.is_empty() {
            return;
        }
        let sink = self.sink.clone();
        tokio::spawn(async move {
            for status in statuses {
                let entity = status.entity.clone();
                if let Err(e) = sink.publish(status).await {
                    warn!(entity = %entity, error = %e, "status publish failed");
                }
            }
        });
    }
}

pub fn entity_statuses(site: &Site, now: DateTime<Utc>) -> Vec<EntityStatus> {
    let groups = site.groups.groups();
    let mut statuses =
        Vec::with_capacity(site.consumers.len() + site.batteries.len() + groups.len());

    for consumer in &site.consumers {
        let state = consumer.state();
        statuses.push(EntityStatus {
            entity: consumer.id().to_string(),
            state: consumer.admission().to_string(),
            attributes: json!({
                "kind": consumer.kind().to_string(),
                "critical": consumer.is_critical(),
                "blocked": state.block.map(|b| b.reason.to_string()),
                "blocked_since": state.block.map(|b| b.since),
                "boosted": consumer.is_boosted(),
                "started_at": state.started_at,
                "last_run_at": state.last_run_at,
                "average_power_w": consumer.average_power(now),
            }),
            timestamp: now,
        });
    }

    for battery in &site.batteries {
        statuses.push(EntityStatus {
            entity: battery.id().to_string(),
            state: battery
                .soc()
                .map_or_else(|| "unknown".to_string(), |soc| format!("{soc:.1}")),
            attributes: json!({
                "can_charge": battery.can_charge(),
                "can_discharge": battery.can_discharge(),
                "remaining_capacity_kwh": battery.remaining_available_capacity(),
                "round_trip_efficiency": battery.round_trip_efficiency(),
                "last_change_at": battery.state().last_change_at,
            }),
            timestamp: now,
        });
    }

    for group in groups {
        let average_power_w = group.average_power(&site.consumers, now);
        statuses.push(EntityStatus {
            entity: group.name.clone(),
            state: format!("{average_power_w:.0}"),
            attributes: json!({
                "kind": "group",
                "members": group.members,
                "members_needing_energy": group.members_needing_energy(&site.consumers),
                "average_power_w": average_power_w,
            }),
            timestamp: now,
        });
    }

    statuses
}
