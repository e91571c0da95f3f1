//! Node metrics: history storage and the sync collector

mod collector;
mod history;

pub use collector::{MetricsCollector, SyncReport};
pub use history::{downsample, MetricsHistory};
