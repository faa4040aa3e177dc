//! Built-in collectors

mod monitoring;
mod system;

pub use monitoring::MonitoringCollector;
pub use system::SystemCollector;
