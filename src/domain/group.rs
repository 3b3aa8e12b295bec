use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::consumer::Consumer;
use crate::config::GroupConfig;

/// Named set of consumers that can hand their peak balancing to a delegate.
///
/// A consumer configured to balance on behalf of a group is stopped first
/// when a member of that group needs headroom.
#[derive(Debug, Clone)]
pub struct ConsumerGroup {
    pub name: String,
    pub members: Vec<String>,
}

impl ConsumerGroup {
    pub fn new(cfg: &GroupConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            members: cfg.members.clone(),
        }
    }

    pub fn contains(&self, consumer_id: &str) -> bool {
        self.members.iter().any(|m| m == consumer_id)
    }

    /// Summed trailing power of all members present in `consumers`.
    pub fn average_power(&self, consumers: &[Consumer], now: DateTime<Utc>) -> f64 {
        consumers
            .iter()
            .filter(|c| self.contains(c.id()))
            .map(|c| c.average_power(now))
            .sum()
    }

    pub fn members_needing_energy(&self, consumers: &[Consumer]) -> usize {
        consumers
            .iter()
            .filter(|c| self.contains(c.id()) && c.needs_energy())
            .count()
    }
}

/// Group membership and delegation lookups by consumer position.
#[derive(Debug, Clone, Default)]
pub struct GroupIndex {
    groups: Vec<ConsumerGroup>,
    /// group name -> positions of consumers balancing on its behalf
    delegates: HashMap<String, Vec<usize>>,
}

impl GroupIndex {
    pub fn new(groups: Vec<ConsumerGroup>, consumers: &[Consumer]) -> Self {
        let mut delegates: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, consumer) in consumers.iter().enumerate() {
            if let Some(group) = consumer.balance_on_behalf_of() {
                delegates.entry(group.to_string()).or_default().push(idx);
            }
        }
        Self { groups, delegates }
    }

    pub fn groups(&self) -> &[ConsumerGroup] {
        &self.groups
    }

    /// Delegates of every group `consumer_id` belongs to, excluding itself.
    pub fn delegates_for(&self, consumer_id: &str, own_idx: usize) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .groups
            .iter()
            .filter(|g| g.contains(consumer_id))
            .filter_map(|g| self.delegates.get(&g.name))
            .flatten()
            .copied()
            .filter(|&idx| idx != own_idx)
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    #[test]
    fn test_delegates_for_member() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let floor = ConsumerConfig::simple("floor_heating", "switch.floor", 1200.0);
        let towel = ConsumerConfig::simple("towel_rail", "switch.towel", 100.0);
        let mut boiler = ConsumerConfig::simple("boiler", "switch.boiler", 3000.0);
        boiler.balance_on_behalf_of = Some("bathroom".into());

        let consumers: Vec<Consumer> = [floor, towel, boiler]
            .into_iter()
            .map(|cfg| Consumer::new(cfg, Tz::UTC, now).unwrap())
            .collect();
        let group = ConsumerGroup::new(&GroupConfig {
            name: "bathroom".into(),
            members: vec!["floor_heating".into(), "towel_rail".into()],
        });
        let index = GroupIndex::new(vec![group], &consumers);

        assert_eq!(index.delegates_for("floor_heating", 0), vec![2]);
        assert!(index.delegates_for("boiler", 2).is_empty());

        // nothing refreshed yet: no member is running or asking for energy
        let bathroom = &index.groups()[0];
        assert_eq!(bathroom.members_needing_energy(&consumers), 0);
        assert_eq!(bathroom.average_power(&consumers, now), 0.0);
    }
}
