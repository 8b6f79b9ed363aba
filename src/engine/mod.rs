// Signal evaluation, position sizing and the monitoring loop
pub mod monitor;
pub mod signal;
pub mod sizing;

pub use monitor::{FlowMonitor, MonitorConfig};
pub use signal::evaluate_flow;
pub use sizing::{format_size, position_size};
