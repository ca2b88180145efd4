#![doc = include_str!("../README.md")]

mod batch;
pub mod config;
pub mod metrics;
mod pool;
pub mod queue;
pub mod scheduler;
mod task_table;

pub use batch::MODEL_CHANNEL_ORDER;
pub use config::SchedulerConfig;
pub use metrics::MetricsSnapshot;
pub use scheduler::{ModelState, Scheduler, TeardownReport};
pub use task_table::TaskId;
