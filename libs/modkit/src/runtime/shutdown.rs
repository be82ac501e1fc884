//! OS termination signals that end the running phase.

use std::fmt;

/// The signal that asked the application to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
    Quit,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Quit => "SIGQUIT",
        })
    }
}

/// Resolves on the first SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn wait_for_shutdown() -> std::io::Result<StopSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let received = tokio::select! {
        _ = interrupt.recv() => StopSignal::Interrupt,
        _ = terminate.recv() => StopSignal::Terminate,
        _ = quit.recv() => StopSignal::Quit,
    };
    Ok(received)
}

/// Resolves on Ctrl+C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> std::io::Result<StopSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(StopSignal::Interrupt)
}
