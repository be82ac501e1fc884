//! Lifecycle runner.
//!
//! Design notes:
//! - Phases run strictly one module at a time, in registration order:
//!   config → init → start → post_start → running → stop (reverse).
//! - Initializers may extend the context; the extended context is what every
//!   later Initializer and every `start` receive.
//! - A failing `start`/`post_start` rolls back: the modules that already
//!   started are stopped in reverse order, the failing one is not.
//! - Shutdown can be driven by OS signals, an external `CancellationToken`,
//!   an arbitrary future, the exit signal or `Application::stop()`.

use serde_json::Value;
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::{AppError, AppState, Application};
use crate::config::{ConfigLayer, ConfigProvider};
use crate::context::{AppContext, AppContextBuilder};
use crate::runtime::shutdown;

/// How the runtime should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

/// Options for [`Application::run`].
pub struct RunOptions {
    /// Explicit config sections (file, flags), applied before any Initializer.
    pub config: Option<Arc<dyn ConfigProvider>>,
    /// Shutdown strategy.
    pub shutdown: ShutdownOptions,
    /// Bound for each module's `stop`.
    pub stop_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config: None,
            shutdown: ShutdownOptions::Signals,
            stop_timeout: Duration::from_secs(30),
        }
    }
}

impl RunOptions {
    #[must_use]
    pub fn with_config(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config = Some(provider);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownOptions) -> Self {
        self.shutdown = shutdown;
        self
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Spawn the shutdown waiter according to the chosen strategy. The returned
/// token is cancelled on external shutdown.
fn arm_shutdown(opts: ShutdownOptions) -> (CancellationToken, Option<JoinHandle<()>>) {
    match opts {
        ShutdownOptions::Signals => {
            let cancel = CancellationToken::new();
            let c = cancel.clone();
            let waiter = tokio::spawn(async move {
                match shutdown::wait_for_shutdown().await {
                    Ok(signal) => {
                        tracing::info!(%signal, "shutdown: signal received");
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "shutdown: signal handlers unavailable; falling back to ctrl_c()"
                        );
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
                c.cancel();
            });
            (cancel, Some(waiter))
        }
        ShutdownOptions::Future(fut) => {
            let cancel = CancellationToken::new();
            let c = cancel.clone();
            let waiter = tokio::spawn(async move {
                fut.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
            (cancel, Some(waiter))
        }
        ShutdownOptions::Token(t) => {
            tracing::debug!("shutdown: external token will control lifecycle");
            (t, None)
        }
    }
}

impl Application {
    /// Run the full lifecycle and return once every started module is stopped.
    ///
    /// Returns `Ok(())` on external shutdown or `stop()`, `AppError::Runtime`
    /// when the exit signal fired, and a phase error naming the module otherwise.
    pub async fn run(self: &Arc<Self>, opts: RunOptions) -> Result<(), AppError> {
        if !self.begin() {
            return Err(AppError::AlreadyRunning);
        }
        self.controller().seal();

        let RunOptions {
            config,
            shutdown,
            stop_timeout,
        } = opts;

        let (external, waiter) = arm_shutdown(shutdown);
        // Child token: entering STOPPING cancels it without touching the caller's token.
        let run_token = external.child_token();
        let ctx = AppContextBuilder::new(run_token)
            .with_app(self.clone())
            .build();

        let res = self
            .drive(ctx, config.as_deref(), &external, stop_timeout)
            .await;

        if let Some(w) = waiter {
            w.abort();
        }
        res
    }

    async fn drive(
        &self,
        ctx: AppContext,
        config: Option<&dyn ConfigProvider>,
        external: &CancellationToken,
        stop_timeout: Duration,
    ) -> Result<(), AppError> {
        tracing::info!(
            app = %self.name(),
            version = %self.version(),
            modules = ?self.controller().names(),
            "Phase: config"
        );
        if let Err(e) = self.configure(config) {
            self.abort_before_start(&ctx);
            return Err(e);
        }

        tracing::info!("Phase: init");
        let ctx = match self.initialize(ctx.clone()).await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.abort_before_start(&ctx);
                return Err(e);
            }
        };

        self.set_state(AppState::Starting);
        {
            let mut plan = self.plan.lock();
            plan.ctx = Some(ctx.clone());
            plan.timeout = stop_timeout;
        }

        tracing::info!("Phase: start");
        for e in self.controller().snapshot() {
            if let Err(source) = e.core.start(&ctx.for_module(&e.name)).await {
                tracing::warn!(module = %e.name, "start failed; stopping started modules");
                self.stop_started().await;
                return Err(AppError::Start {
                    module: e.name.clone(),
                    source,
                });
            }
            tracing::debug!(module = %e.name, "module started");
            self.plan.lock().started.push(e);
        }

        self.set_state(AppState::PostStarting);
        tracing::info!("Phase: post_start");
        for e in self.controller().post_starters() {
            let Some(p) = &e.post_start else { continue };
            if let Err(source) = p.post_start(&ctx.for_module(&e.name)).await {
                tracing::warn!(module = %e.name, "post-start failed; stopping started modules");
                self.stop_started().await;
                return Err(AppError::PostStart {
                    module: e.name.clone(),
                    source,
                });
            }
        }

        self.set_state(AppState::Running);
        tracing::info!("Phase: running");
        let exited = tokio::select! {
            biased;
            _ = self.exit_signal().fired() => {
                tracing::info!("shutdown: exit signal");
                true
            }
            _ = external.cancelled() => {
                tracing::info!("shutdown: external shutdown requested");
                false
            }
            _ = self.stop_requested.cancelled() => {
                tracing::info!("shutdown: stop requested");
                false
            }
        };

        self.stop_started().await;

        if exited {
            let reason = self
                .exit_signal()
                .take()
                .unwrap_or_else(|| anyhow::anyhow!("exit requested"));
            return Err(AppError::Runtime(reason));
        }
        Ok(())
    }

    /// Apply provider sections to every Configurable at the explicit layer.
    /// The config phase of `run`; callable alone to validate sections.
    pub fn configure(&self, provider: Option<&dyn ConfigProvider>) -> Result<(), AppError> {
        self.controller().try_range(|e| {
            let Some(c) = &e.config else { return Ok(()) };
            let fail = |source: anyhow::Error| AppError::Config {
                module: e.name.clone(),
                source,
            };

            let target = c.config().map_err(fail)?;
            let Some(section) = provider.and_then(|p| p.get_module_config(target.section())) else {
                return Ok(());
            };
            let values = match section {
                Value::Object(map) => map.clone(),
                Value::Null => return Ok(()),
                other => {
                    return Err(fail(anyhow::anyhow!(
                        "section '{}' must be a mapping, got {other}",
                        target.section()
                    )))
                }
            };

            let written = target.apply(ConfigLayer::Explicit, values).map_err(fail)?;
            tracing::debug!(module = %e.name, section = %target.section(), keys = ?written, "config applied");
            Ok(())
        })
    }

    /// Chain Initializers. Only the client set of a returned context is kept;
    /// application handle and run token stay those of this run.
    async fn initialize(&self, mut ctx: AppContext) -> Result<AppContext, AppError> {
        for e in self.controller().initializers() {
            let Some(init) = &e.init else { continue };
            let next = init
                .initialize(ctx.for_module(&e.name))
                .await
                .map_err(|source| AppError::Init {
                    module: e.name.clone(),
                    source,
                })?;
            tracing::debug!(module = %e.name, "module initialized");
            ctx.client_hub = next.client_hub;
        }
        Ok(ctx)
    }

    /// Nothing started yet: wind down workers spawned by Initializers and finish.
    fn abort_before_start(&self, ctx: &AppContext) {
        ctx.cancellation_token().cancel();
        self.finish();
    }

    /// Stop modules whose `start` succeeded, newest first, each under the
    /// configured bound. The started set is taken once, so repeated calls are no-ops.
    pub(crate) async fn stop_started(&self) {
        let plan = std::mem::take(&mut *self.plan.lock());
        let Some(ctx) = plan.ctx else {
            // Another caller holds the plan; return only once it is done.
            self.stopped.cancelled().await;
            return;
        };

        self.set_state(AppState::Stopping);
        ctx.cancellation_token().cancel();

        tracing::info!("Phase: stop");
        for e in plan.started.iter().rev() {
            let deadline = CancellationToken::new();
            let mctx = ctx.for_module(&e.name).with_token(deadline.clone());
            match tokio::time::timeout(plan.timeout, e.core.stop(&mctx)).await {
                Ok(Ok(())) => tracing::debug!(module = %e.name, "module stopped"),
                Ok(Err(err)) => {
                    tracing::warn!(module = %e.name, error = %err, "Failed to stop module");
                }
                Err(_) => {
                    deadline.cancel();
                    tracing::warn!(
                        module = %e.name,
                        error = %format!("stop timed out after {:?}", plan.timeout),
                        "Failed to stop module"
                    );
                }
            }
        }

        self.finish();
    }
}
