pub mod config;
pub mod error;
pub mod ids;

pub use config::{Config, LogConfig, PriorityWeights, SchedulerConfig};
pub use error::*;
pub use ids::*;
