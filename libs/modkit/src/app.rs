use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::registry::{Controller, ModuleDef, ModuleEntry, RegistryError};

/// Application lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppState {
    Created,
    Initializing,
    Starting,
    PostStarting,
    Running,
    Stopping,
    Stopped,
}

impl AppState {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        match self {
            AppState::Created => 0,
            AppState::Initializing => 1,
            AppState::Starting => 2,
            AppState::PostStarting => 3,
            AppState::Running => 4,
            AppState::Stopping => 5,
            AppState::Stopped => 6,
        }
    }
    #[inline]
    pub const fn from_u8(x: u8) -> Self {
        match x {
            1 => AppState::Initializing,
            2 => AppState::Starting,
            3 => AppState::PostStarting,
            4 => AppState::Running,
            5 => AppState::Stopping,
            6 => AppState::Stopped,
            _ => AppState::Created,
        }
    }
}

/// Write-once exit request. The first reason wins.
#[derive(Default)]
pub struct ExitSignal {
    reason: Mutex<Option<anyhow::Error>>,
    fired: CancellationToken,
}

impl ExitSignal {
    /// Record `err` unless a reason was already recorded. Returns whether this call won.
    pub fn trigger(&self, err: anyhow::Error) -> bool {
        let mut reason = self.reason.lock();
        if self.fired.is_cancelled() {
            return false;
        }
        *reason = Some(err);
        self.fired.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.is_cancelled()
    }

    /// Resolves once the signal fired.
    pub async fn fired(&self) {
        self.fired.cancelled().await;
    }

    /// Take the recorded reason. The signal stays fired.
    pub fn take(&self) -> Option<anyhow::Error> {
        self.reason.lock().take()
    }
}

/// Lifecycle failures returned by [`Application::run`].
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to config for module \"{module}\"")]
    Config {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("initialization failed for module \"{module}\"")]
    Init {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("start failed for module \"{module}\"")]
    Start {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("post-start failed for module \"{module}\"")]
    PostStart {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("application exited with error")]
    Runtime(#[source] anyhow::Error),
    #[error("application has already been run")]
    AlreadyRunning,
}

impl AppError {
    /// Module the failure is attributed to, if any.
    pub fn module(&self) -> Option<&str> {
        match self {
            AppError::Config { module, .. }
            | AppError::Init { module, .. }
            | AppError::Start { module, .. }
            | AppError::PostStart { module, .. } => Some(module),
            AppError::Runtime(_) | AppError::AlreadyRunning => None,
        }
    }
}

/// What `stop` needs: modules whose `start` succeeded, the context they got
/// and the per-call bound.
#[derive(Default)]
pub(crate) struct StopPlan {
    pub(crate) ctx: Option<AppContext>,
    pub(crate) timeout: Duration,
    pub(crate) started: Vec<Arc<ModuleEntry>>,
}

/// Process-level holder: name, version, controller and exit signal.
pub struct Application {
    name: String,
    version: String,
    controller: Controller,
    exit: ExitSignal,
    state: AtomicU8,
    pub(crate) plan: Mutex<StopPlan>,
    pub(crate) stop_requested: CancellationToken,
    pub(crate) stopped: CancellationToken,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("state", &self.state())
            .field("controller", &self.controller)
            .finish()
    }
}

impl Application {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            controller: Controller::new(),
            exit: ExitSignal::default(),
            state: AtomicU8::new(AppState::Created.as_u8()),
            plan: Mutex::new(StopPlan::default()),
            stop_requested: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Shorthand for `controller().add(..)`.
    pub fn add(&self, name: impl Into<String>, def: impl Into<ModuleDef>) -> Result<(), RegistryError> {
        self.controller.add(name, def)
    }

    pub fn state(&self) -> AppState {
        AppState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: AppState) {
        tracing::debug!(state = ?s, "application state");
        self.state.store(s.as_u8(), Ordering::Release);
    }

    /// `Created -> Initializing`, exactly once.
    pub(crate) fn begin(&self) -> bool {
        self.state
            .compare_exchange(
                AppState::Created.as_u8(),
                AppState::Initializing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Request a coordinated shutdown with `err` as the run result. The first
    /// caller wins; later calls return `false` and change nothing.
    pub fn exit(&self, err: anyhow::Error) -> bool {
        let won = self.exit.trigger(err);
        if won {
            tracing::info!("exit requested");
        }
        won
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    /// Ask the run to leave `RUNNING` and wait until it has stopped every
    /// started module in reverse order.
    ///
    /// Safe to call any number of times: modules are stopped once, by the run
    /// itself. A call made while the run is still starting only records the
    /// request; the run stops as soon as it reaches `RUNNING`.
    pub async fn stop(&self) {
        self.stop_requested.cancel();
        if matches!(self.state(), AppState::Running | AppState::Stopping) {
            self.stopped.cancelled().await;
        }
    }

    /// Mark the run as finished.
    pub(crate) fn finish(&self) {
        self.set_state(AppState::Stopped);
        self.stopped.cancel();
    }
}
