//! Guarded background work owned by a module.
//!
//! A module that serves or polls from `post_start` keeps a [`Lifecycle`] for
//! that work and stops it from `stop` within a bound. The task sees a
//! cancellation token; the status is published through a watch channel so
//! callers can observe it without touching the task.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    /// Spawned, waiting for its [`ReadySignal`].
    Starting,
    Running,
    Stopping,
}

/// How a call to [`Lifecycle::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing was running, or the task had already returned.
    Finished,
    /// The task returned after its token was cancelled.
    Cancelled,
    /// The task ignored cancellation and was aborted.
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("background task is already running")]
    AlreadyStarted,
}

/// Handed to the task; marks it `Running` once it can serve (e.g. after bind).
pub struct ReadySignal {
    status: watch::Sender<Status>,
}

impl ReadySignal {
    pub fn notify(self) {
        self.status.send_if_modified(|s| {
            let starting = *s == Status::Starting;
            if starting {
                *s = Status::Running;
            }
            starting
        });
    }
}

struct Spawned {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct Lifecycle {
    status: watch::Sender<Status>,
    task: Mutex<Option<Spawned>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            status: watch::Sender::new(Status::Stopped),
            task: Mutex::new(None),
        }
    }

    /// Spawn `make` and mark it `Running` immediately.
    pub fn start<F, Fut>(&self, make: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.start_with_token(CancellationToken::new(), make)
    }

    /// Like [`start`](Self::start), cancelled by `token` as well as by `stop`.
    pub fn start_with_token<F, Fut>(
        &self,
        token: CancellationToken,
        make: F,
    ) -> Result<(), LifecycleError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn(token, Status::Running, move |cancel, _ready| make(cancel))
    }

    /// Spawn `make`; the status stays `Starting` until the task calls
    /// [`ReadySignal::notify`].
    pub fn start_with_ready_and_token<F, Fut>(
        &self,
        token: CancellationToken,
        make: F,
    ) -> Result<(), LifecycleError>
    where
        F: FnOnce(CancellationToken, ReadySignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn(token, Status::Starting, make)
    }

    fn spawn<F, Fut>(
        &self,
        token: CancellationToken,
        initial: Status,
        make: F,
    ) -> Result<(), LifecycleError>
    where
        F: FnOnce(CancellationToken, ReadySignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut slot = self.task.lock();
        let claimed = self.status.send_if_modified(|s| {
            let idle = *s == Status::Stopped;
            if idle {
                *s = initial;
            }
            idle
        });
        if !claimed {
            return Err(LifecycleError::AlreadyStarted);
        }

        let ready = ReadySignal {
            status: self.status.clone(),
        };
        let status = self.status.clone();
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = make(cancel, ready).await {
                tracing::error!(error = %format!("{err:#}"), "background task failed");
            }
            status.send_replace(Status::Stopped);
        });

        *slot = Some(Spawned {
            handle,
            cancel: token,
        });
        Ok(())
    }

    /// Cancel the task and wait up to `timeout` for it to return, aborting it
    /// afterwards. Safe to call repeatedly or concurrently.
    pub async fn stop(&self, timeout: Duration) -> Result<StopReason, LifecycleError> {
        let spawned = self.task.lock().take();
        let Some(Spawned { mut handle, cancel }) = spawned else {
            // Another caller may be stopping it right now.
            let _ = tokio::time::timeout(timeout, self.wait_stopped()).await;
            return Ok(StopReason::Finished);
        };

        // The task marks itself stopped as its last step.
        if handle.is_finished() || self.status() == Status::Stopped {
            let _ = tokio::time::timeout(timeout, handle).await;
            self.status.send_replace(Status::Stopped);
            return Ok(StopReason::Finished);
        }

        self.status.send_if_modified(|s| {
            let active = matches!(s, Status::Starting | Status::Running);
            if active {
                *s = Status::Stopping;
            }
            active
        });
        cancel.cancel();

        let reason = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => StopReason::Cancelled,
            Ok(Err(err)) => {
                if err.is_panic() {
                    tracing::error!("background task panicked");
                }
                StopReason::Cancelled
            }
            Err(_) => {
                tracing::warn!(?timeout, "background task ignored cancellation, aborting");
                handle.abort();
                let _ = handle.await;
                StopReason::Timeout
            }
        };
        self.status.send_replace(Status::Stopped);
        Ok(reason)
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// Resolves once the status is `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| *s == Status::Stopped).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }
}
