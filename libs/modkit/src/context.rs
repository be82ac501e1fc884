use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::app::Application;
use crate::client_hub::{ClientHub, ClientHubError};

/// Context threaded through every lifecycle call.
///
/// Cloning is cheap. Extending it (`with_client`) returns a new context and
/// leaves the receiver untouched, so modules never race on shared state.
#[derive(Clone)]
pub struct AppContext {
    pub(crate) app: Option<Arc<Application>>,
    pub(crate) client_hub: ClientHub,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) module_name: Option<Arc<str>>,
}

// ---- construction/scoping ----
pub struct AppContextBuilder {
    inner: AppContext,
}

impl AppContextBuilder {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            inner: AppContext::from_token(token),
        }
    }
    pub fn with_app(mut self, app: Arc<Application>) -> Self {
        self.inner.app = Some(app);
        self
    }
    pub fn with_client_hub(mut self, hub: ClientHub) -> Self {
        self.inner.client_hub = hub;
        self
    }
    pub fn build(self) -> AppContext {
        self.inner
    }
}

impl AppContext {
    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self {
            app: None,
            client_hub: ClientHub::default(),
            cancellation_token: token,
            module_name: None,
        }
    }

    /// A context that is not attached to any application.
    pub fn detached() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// Scope context to a specific module name (used by the runner).
    pub(crate) fn for_module(&self, name: &str) -> Self {
        let mut ctx = self.clone();
        ctx.module_name = Some(Arc::<str>::from(name));
        ctx
    }

    pub(crate) fn with_token(&self, token: CancellationToken) -> Self {
        let mut ctx = self.clone();
        ctx.cancellation_token = token;
        ctx
    }

    // ---- public read-only API for modules ----

    /// The running application, if this context belongs to one.
    pub fn app(&self) -> Option<&Arc<Application>> {
        self.app.as_ref()
    }

    pub fn client_hub(&self) -> &ClientHub {
        &self.client_hub
    }

    /// Cancelled when the application leaves `RUNNING`. Inside `stop`, cancelled
    /// when the stop deadline expires.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn current_module(&self) -> Option<&str> {
        self.module_name.as_deref()
    }

    /// Returns a new context that also carries `client` under type `T`.
    #[must_use]
    pub fn with_client<T>(&self, client: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let mut ctx = self.clone();
        ctx.client_hub = self.client_hub.with::<T>(client);
        ctx
    }

    /// Returns a new context that also carries `client` under type `T` in a named scope.
    #[must_use]
    pub fn with_scoped_client<T>(&self, scope: &str, client: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let mut ctx = self.clone();
        ctx.client_hub = self.client_hub.with_scoped::<T>(scope, client);
        ctx
    }

    /// Typed lookup of a client published by an earlier Initializer.
    pub fn client<T>(&self) -> Result<Arc<T>, ClientHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.client_hub.get::<T>()
    }

    pub fn scoped_client<T>(&self, scope: &str) -> Result<Arc<T>, ClientHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.client_hub.get_scoped::<T>(scope)
    }

    /// Route a runtime failure from a background task into a coordinated exit.
    ///
    /// Without an application there is nobody to coordinate with, so the
    /// process terminates with status 1.
    pub fn exit_or_abort(&self, err: anyhow::Error) {
        match &self.app {
            Some(app) => {
                if !app.exit(err) {
                    tracing::debug!("exit already requested; keeping the first reason");
                }
            }
            None => {
                tracing::error!("fatal error outside of an application, aborting: {err:#}");
                std::process::exit(1);
            }
        }
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("app", &self.app.as_ref().map(|a| a.name()))
            .field("module", &self.module_name)
            .field("clients", &self.client_hub)
            .field("cancelled", &self.cancellation_token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_client_leaves_receiver_untouched() {
        let base = AppContext::detached();
        let extended = base.with_client(Arc::new(42u32));

        assert!(base.client::<u32>().is_err());
        assert_eq!(*extended.client::<u32>().unwrap(), 42);
    }

    #[test]
    fn module_scope_is_per_clone() {
        let base = AppContext::detached();
        let scoped = base.for_module("http");
        assert_eq!(scoped.current_module(), Some("http"));
        assert_eq!(base.current_module(), None);
    }

    #[test]
    fn exit_or_abort_fires_the_app_signal() {
        let app = Arc::new(Application::new("demo", "1.0.0"));
        let ctx = AppContextBuilder::new(CancellationToken::new())
            .with_app(app.clone())
            .build();

        ctx.exit_or_abort(anyhow::anyhow!("first"));
        ctx.exit_or_abort(anyhow::anyhow!("second"));

        assert!(app.exit_signal().is_fired());
        let reason = app.exit_signal().take().unwrap();
        assert_eq!(reason.to_string(), "first");
    }
}
