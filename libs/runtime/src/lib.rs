//! Ambient stack shared by every binary: layered application config, the CLI
//! override model, and the process logging subscriber.

pub mod config;
pub mod logging;
mod module;

pub use config::{AppConfig, AppConfigProvider, CliArgs, LoggingConfig, Section, ServerConfig};
pub use logging::{init_logging_from_config, TracingHandle, TracingSlot};
pub use module::LoggingModule;
