//! Signal handling for the manager
//!
//! The daemon reacts to three signals: SIGTERM and SIGINT trigger the orderly
//! shutdown of every started service, SIGHUP triggers a definitions reload.
//! Orphaned grandchildren are reaped by the parent init (PID 1), not here.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signals the daemon acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Shutdown request (SIGTERM)
    Term,
    /// Interrupt (SIGINT)
    Int,
    /// Reload service definitions (SIGHUP)
    Hup,
}

pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal of interest.
    pub async fn wait(&mut self) -> DaemonSignal {
        tokio::select! {
            _ = self.sigterm.recv() => DaemonSignal::Term,
            _ = self.sigint.recv() => DaemonSignal::Int,
            _ = self.sighup.recv() => DaemonSignal::Hup,
        }
    }
}

/// Whether this process is a direct child of PID 1.
pub fn parent_is_init() -> bool {
    nix::unistd::getppid().as_raw() == 1
}
