use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Ten minutes of 1 Hz samples.
pub const DEFAULT_WINDOW_CAPACITY: usize = 600;

/// One timestamped numeric reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl SensorSample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Bounded, time-ordered buffer of samples for trailing averages.
///
/// The oldest sample is evicted once `capacity` is reached. Samples older than
/// the newest one already held are rejected so the buffer stays ordered.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<SensorSample>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample. Returns `false` if it was rejected as out of order.
    pub fn push(&mut self, sample: SensorSample) -> bool {
        if let Some(last) = self.samples.back() {
            if sample.timestamp < last.timestamp {
                return false;
            }
        }
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    pub fn latest(&self) -> Option<SensorSample> {
        self.samples.back().copied()
    }

    /// Mean of all samples with `timestamp + duration > now`.
    ///
    /// Falls back to the most recent sample when none fall inside the lookback,
    /// and to `None` only when the window has never received a sample.
    pub fn average_over(&self, duration: Duration, now: DateTime<Utc>) -> Option<f64> {
        let (sum, count) = self
            .samples
            .iter()
            .rev()
            .take_while(|s| s.timestamp + duration > now)
            .fold((0.0, 0usize), |(sum, count), s| (sum + s.value, count + 1));

        if count == 0 {
            return self.latest().map(|s| s.value);
        }
        Some(sum / count as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorSample> {
        self.samples.iter()
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

/// Last known valid reading of a signal.
///
/// Only a present value overwrites the cell; an unavailable reading leaves the
/// previous value in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatestValue<T> {
    value: Option<T>,
}

impl<T: Copy> LatestValue<T> {
    pub fn empty() -> Self {
        Self { value: None }
    }

    /// Returns `true` when the cell changed.
    pub fn update(&mut self, reading: Option<T>) -> bool
    where
        T: PartialEq,
    {
        match reading {
            Some(v) if self.value != Some(v) => {
                self.value = Some(v);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self) -> Option<T> {
        self.value
    }

    pub fn get_or(&self, fallback: T) -> T {
        self.value.unwrap_or(fallback)
    }

    pub fn is_known(&self) -> bool {
        self.value.is_some()
    }
}

impl<T: Copy> Default for LatestValue<T> {
    fn default() -> Self {
        Self::empty()
    }
}
