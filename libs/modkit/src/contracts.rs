use async_trait::async_trait;
use axum::Router;

use crate::config::ConfigTarget;
use crate::context::AppContext;

/// Core module: every registered module can be started and stopped.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Runs in registration order with the fully initialized context.
    async fn start(&self, ctx: &AppContext) -> anyhow::Result<()>;

    /// Runs in reverse registration order under a bounded deadline.
    /// Only modules whose `start` succeeded are stopped.
    async fn stop(&self, ctx: &AppContext) -> anyhow::Result<()>;
}

/// Exposes a configuration object that is populated (file, flags, environment)
/// before any Initializer runs.
pub trait Configurable: Send + Sync {
    fn config(&self) -> anyhow::Result<&dyn ConfigTarget>;
}

/// Early setup. May extend the shared context; the returned context is the one
/// every later Initializer and every `start` receives.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize(&self, ctx: AppContext) -> anyhow::Result<AppContext>;
}

/// Runs after every module's `start` completed, e.g. to open a listener once
/// all routes are registered.
#[async_trait]
pub trait PostStarter: Send + Sync {
    async fn post_start(&self, ctx: &AppContext) -> anyhow::Result<()>;
}

/// Pure wiring; must be sync. Called by the HTTP host during its `start`.
pub trait Routable: Send + Sync {
    fn route(&self, ctx: &AppContext, router: Router) -> anyhow::Result<Router>;

    /// Wrap the finished router once every Routable has added its routes, so a
    /// layer here sees responses from all of them.
    fn decorate(&self, _ctx: &AppContext, router: Router) -> anyhow::Result<Router> {
        Ok(router)
    }
}
