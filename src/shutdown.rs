use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

/// Cloneable handle used to begin and observe a graceful shutdown.
///
/// `shutdown()` flips a watch channel; background tasks either abort
/// immediately or are given until `timeout` to finish, and the process
/// waits at least `delay` after the signal so cancelled tasks can reach an
/// await point.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    timeout: Duration,
    delay: Duration,
}

impl Shutdown {
    #[must_use]
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        let (sender, _receiver) = watch::channel(false);

        Self {
            sender: Arc::new(sender),
            timeout,
            delay,
        }
    }

    /// Creates the handle and installs the OS signal watcher.
    #[must_use]
    pub fn spawn(timeout: Duration, delay: Duration) -> Self {
        let shutdown = Self::new(timeout, delay);

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(err) = await_signal().await {
                    error!(?err, "Error listening for shutdown signals");
                }
                shutdown.shutdown();
            }
        });

        shutdown
    }

    pub fn shutdown(&self) {
        // Never fails - the sender owns at least one receiver via subscribe.
        let _ = self.sender.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.sender.borrow()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolves as soon as shutdown has been requested.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.sender.subscribe();
        if *watch.borrow_and_update() {
            return;
        }
        let _ = watch.changed().await;
    }

    /// Resolves `delay` after shutdown has been requested. Used by the
    /// outermost waiters (HTTP server, main) so that aborted tasks get a
    /// chance to run their cancellation paths first.
    pub async fn await_shutdown(&self) {
        self.await_shutdown_begin().await;
        tokio::time::sleep(self.delay).await;
    }
}

#[cfg(unix)]
async fn await_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn await_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, Duration};

    use super::*;

    #[tokio::test]
    async fn shutdown_signal_resolves_waiters() {
        let shutdown = Shutdown::new(Duration::from_secs(30), Duration::from_millis(0));
        let start = tokio::time::Instant::now();

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                sleep(Duration::from_millis(100)).await;
                shutdown.shutdown();
            }
        });

        shutdown.await_shutdown_begin().await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500));
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn await_resolves_immediately_when_already_down() {
        let shutdown = Shutdown::new(Duration::from_secs(30), Duration::from_millis(0));
        shutdown.shutdown();
        shutdown.await_shutdown_begin().await;
        shutdown.await_shutdown().await;
    }
}
