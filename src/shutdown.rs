//! Unix signal handling for graceful shutdown.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Listens for the termination signals. Installing the handlers can fail, so
/// construction is separated from waiting: the server sets this up before it
/// starts serving.
pub struct Shutdown {
    term: Signal,
    int: Signal,
    hup: Signal,
    quit: Signal,
}

impl Shutdown {
    pub fn new() -> std::io::Result<Self> {
        Ok(Shutdown {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Completes when any of SIGTERM, SIGINT, SIGHUP or SIGQUIT arrives,
    /// returning the signal's name.
    pub async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}
