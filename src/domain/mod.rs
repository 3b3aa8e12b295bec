pub mod battery;
pub mod consumer;
pub mod grid;
pub mod group;
pub mod sample;
pub mod time_window;

pub use battery::{Battery, BatterySignal, BatteryState};
pub use consumer::{AdmissionState, BlockReason, Consumer, ConsumerSignal, ConsumerState};
pub use grid::{GridMonitor, GridSignal, GridSnapshot, LoadEstimateMethod};
pub use group::{ConsumerGroup, GroupIndex};
pub use sample::{LatestValue, SensorSample, SlidingWindow};
pub use time_window::TimeWindow;
