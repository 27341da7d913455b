//! Cooperative shutdown for the accept loop and every session.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::registry::Registry;

#[derive(Clone)]
pub struct ShutdownCoordinator {
    stop: Arc<watch::Sender<bool>>,
    registry: Arc<Registry>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<Registry>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop: Arc::new(stop),
            registry,
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.stop.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Stops the accept loop and closes every registered connection.
    /// Each session then runs its own cleanup. Repeat calls do nothing.
    pub fn shutdown(&self) {
        if self.stop.send_replace(true) {
            return;
        }

        let peers = self.registry.snapshot();
        info!(connections = peers.len(), "shutting down relay");

        for (id, _) in peers {
            self.registry.disconnect(id);
        }
    }

    /// Runs [`ShutdownCoordinator::shutdown`] on Ctrl-C.
    pub async fn on_ctrl_c(self) {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            self.shutdown();
        }
    }
}

/// Resolves once shutdown has been requested, including when it was
/// requested before this was first polled. Never resolves if the sending
/// side goes away without asking.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    let requested = rx.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}
