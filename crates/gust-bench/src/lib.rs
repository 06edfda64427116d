pub mod aggregator;
pub mod camera;
pub mod config;
pub mod confirm;
pub mod listener;
pub mod orchestrator;
pub mod report;
pub mod shutdown;
pub mod sweep;
pub mod termination;

pub use aggregator::*;
pub use camera::*;
pub use config::*;
pub use confirm::*;
pub use listener::*;
pub use orchestrator::*;
pub use report::*;
pub use shutdown::*;
pub use sweep::*;
pub use termination::*;
