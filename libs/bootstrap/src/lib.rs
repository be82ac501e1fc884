//! One-call entry for HTTP services.
//!
//! [`http`] loads the layered [`AppConfig`], registers the stock collaborators
//! (environment, logging, HTTP host) ahead of the caller's modules and runs the
//! application until a signal or the supplied shutdown trigger.
//!
//! ```rust,ignore
//! bootstrap::http(
//!     "demo",
//!     env!("CARGO_PKG_VERSION"),
//!     Some("./public".into()),
//!     BootstrapOptions::default().with_module("users", users),
//! )
//! .await?;
//! ```

use anyhow::Context;
use env_config::EnvConfig;
use http_server::HttpServer;
use modkit::{AppError, Application, ModuleDef, RunOptions, ShutdownOptions};
use runtime::{AppConfig, AppConfigProvider, CliArgs, LoggingModule};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Names of the stock modules, in registration order.
pub const ENV_MODULE: &str = "env";
pub const LOGGING_MODULE: &str = "logging";
pub const HTTP_MODULE: &str = "http";

#[derive(Default)]
pub struct BootstrapOptions {
    pub args: CliArgs,
    /// Defaults to OS signals.
    pub shutdown: Option<ShutdownOptions>,
    /// Registered after the stock modules, in this order.
    pub modules: Vec<(String, ModuleDef)>,
}

impl BootstrapOptions {
    #[must_use]
    pub fn with_args(mut self, args: CliArgs) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownOptions) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    #[must_use]
    pub fn with_module(mut self, name: impl Into<String>, def: impl Into<ModuleDef>) -> Self {
        self.modules.push((name.into(), def.into()));
        self
    }
}

/// Configuration from `args.config` (or defaults) with CLI flags applied.
pub fn load_config(args: &CliArgs) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    config.apply_cli_overrides(args);
    Ok(config)
}

/// An assembled application, ready to run.
pub struct Bootstrap {
    app: Arc<Application>,
    http: Arc<HttpServer>,
    config: AppConfig,
}

impl Bootstrap {
    /// Register the stock modules and then `modules`. Fails on a duplicate or
    /// empty module name.
    pub fn new(
        name: &str,
        version: &str,
        content: Option<PathBuf>,
        config: AppConfig,
        modules: Vec<(String, ModuleDef)>,
    ) -> anyhow::Result<Self> {
        let app = Arc::new(Application::new(name, version));
        let http = Arc::new(HttpServer::new(content));

        // Environment first so the logging section is final before the
        // subscriber is installed.
        app.add(ENV_MODULE, EnvConfig::new(None, HashMap::new()))?;
        app.add(LOGGING_MODULE, LoggingModule::new(&config.server.home_dir))?;
        app.add(HTTP_MODULE, http.definition())?;
        for (module, def) in modules {
            app.add(module.as_str(), def)
                .with_context(|| format!("failed to register module \"{module}\""))?;
        }

        Ok(Self { app, http, config })
    }

    pub fn app(&self) -> &Arc<Application> {
        &self.app
    }

    pub fn http(&self) -> &Arc<HttpServer> {
        &self.http
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Apply every configuration section without starting anything.
    pub fn check(&self) -> Result<(), AppError> {
        let provider = AppConfigProvider::new(&self.config).map_err(AppError::Runtime)?;
        self.app.configure(Some(&provider))
    }

    pub async fn run(&self, shutdown: ShutdownOptions) -> Result<(), AppError> {
        let provider = AppConfigProvider::new(&self.config).map_err(AppError::Runtime)?;
        let opts = RunOptions::default()
            .with_config(Arc::new(provider))
            .with_shutdown(shutdown)
            .with_stop_timeout(self.config.server.stop_timeout);
        self.app.run(opts).await
    }
}

/// Load configuration, assemble and run until shutdown.
pub async fn http(
    name: &str,
    version: &str,
    content: Option<PathBuf>,
    options: BootstrapOptions,
) -> anyhow::Result<()> {
    let config = load_config(&options.args)?;
    let bootstrap = Bootstrap::new(name, version, content, config, options.modules)?;
    let shutdown = options.shutdown.unwrap_or(ShutdownOptions::Signals);
    bootstrap.run(shutdown).await?;
    Ok(())
}
