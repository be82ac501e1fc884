mod runner;
mod shutdown;

pub use runner::{RunOptions, ShutdownOptions};
pub use shutdown::{wait_for_shutdown, StopSignal};
