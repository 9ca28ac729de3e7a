//! Process lifecycle driven by termination signals
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Error, Result};

/// Owner of the cancellation token every long running component listens to
///
/// Create one in `main` and hand out [`Lifecycle::token`] clones. The first SIGINT or SIGTERM
/// cancels the token, a second one exits the process with status 1.
#[derive(Debug, Default)]
pub struct Lifecycle {
    token: CancellationToken,
    handler_installed: AtomicBool,
}

impl Lifecycle {
    /// Lifecycle that is not yet listening for signals
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start listening for termination signals
    ///
    /// Must be called from within a tokio runtime, and only once.
    pub fn install_signal_handler(&self) -> Result<()> {
        if self.handler_installed.swap(true, Ordering::SeqCst) {
            return Err(Error::SignalHandlerInstalled);
        }
        let mut signals = ShutdownSignals::new().map_err(Error::SignalHandler)?;
        let token = self.token.clone();
        tokio::spawn(async move {
            signals.recv().await;
            info!("Received shutdown signal, shutting down gracefully");
            token.cancel();
            signals.recv().await;
            warn!("Received second shutdown signal, exiting");
            std::process::exit(1);
        });
        Ok(())
    }
}

struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = self.terminate.recv() => {},
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_handler_installs_once() {
        let lifecycle = Lifecycle::new();
        lifecycle.install_signal_handler().unwrap();
        assert!(matches!(
            lifecycle.install_signal_handler(),
            Err(Error::SignalHandlerInstalled)
        ));
        assert!(!lifecycle.token().is_cancelled());
    }

    #[test]
    fn tokens_share_cancellation() {
        let lifecycle = Lifecycle::new();
        let token = lifecycle.token();
        lifecycle.token().cancel();
        assert!(token.is_cancelled());
    }
}
