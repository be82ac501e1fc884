use async_trait::async_trait;
use modkit::{AppContext, ConfigCell, ConfigTarget, Configurable, Initializer, Module};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{default_logging_config, LoggingConfig};
use crate::logging::{init_logging_from_config, TracingHandle};

/// Installs the process subscriber during Initialize and publishes its
/// [`TracingHandle`] for modules that attach extra layers.
pub struct LoggingModule {
    cfg: ConfigCell<LoggingConfig>,
    base_dir: PathBuf,
}

impl LoggingModule {
    /// `base_dir` resolves relative log file paths (usually `server.home_dir`).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            cfg: ConfigCell::new("logging", default_logging_config()),
            base_dir: base_dir.into(),
        }
    }

    pub fn current(&self) -> Arc<LoggingConfig> {
        self.cfg.get()
    }
}

#[async_trait]
impl Module for LoggingModule {
    async fn start(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &AppContext) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Configurable for LoggingModule {
    fn config(&self) -> anyhow::Result<&dyn ConfigTarget> {
        Ok(&self.cfg)
    }
}

#[async_trait]
impl Initializer for LoggingModule {
    async fn initialize(&self, ctx: AppContext) -> anyhow::Result<AppContext> {
        let cfg = self.cfg.get();
        let handle = init_logging_from_config(&cfg, &self.base_dir);
        tracing::debug!(
            subsystems = cfg.len(),
            base_dir = %self.base_dir.display(),
            "Logging initialized"
        );
        Ok(ctx.with_client(Arc::new(handle)))
    }
}

impl From<LoggingModule> for modkit::ModuleDef {
    fn from(module: LoggingModule) -> Self {
        modkit::ModuleDef::builder(Arc::new(module))
            .configurable()
            .initializer()
            .build()
    }
}
