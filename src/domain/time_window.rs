use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Recurring local-time window, optionally switched by a gate sensor.
///
/// `days` name the day the window *starts* on, so an overnight window
/// `Mon-Fri 22:00-06:00` still covers Saturday 05:00. An empty `days` list
/// means every day. Both bounds are inclusive; `start == end` covers the
/// whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub gate: Option<String>,
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(days: Vec<Weekday>, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            gate: None,
            days,
            start,
            end,
        }
    }

    pub fn with_gate(mut self, gate: impl Into<String>) -> Self {
        self.gate = Some(gate.into());
        self
    }

    /// Whether the window applies at all given the gate sensor's last state.
    /// Ungated windows always apply; a gated one only while its gate is on.
    pub fn is_gating(&self, gate_state: Option<bool>) -> bool {
        self.gate.is_none() || gate_state == Some(true)
    }

    pub fn contains(&self, now: DateTime<Utc>, tz: &Tz) -> bool {
        let local = now.with_timezone(tz);
        let time = local.time();
        let day = local.weekday();

        if self.start == self.end {
            return self.applies_on(day);
        }
        if self.start < self.end {
            return self.applies_on(day) && time >= self.start && time <= self.end;
        }
        (time >= self.start && self.applies_on(day))
            || (time <= self.end && self.applies_on(day.pred()))
    }

    pub fn is_active(&self, now: DateTime<Utc>, tz: &Tz, gate_state: Option<bool>) -> bool {
        self.is_gating(gate_state) && self.contains(now, tz)
    }

    fn applies_on(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }
}

pub const WEEKDAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];
