use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::broadcast::BroadcastEngine;
use crate::call::CallRouter;
use crate::config::RelayConfig;
use crate::registry::{ConnId, Registry};
use crate::shutdown::ShutdownCoordinator;

/// Everything a session needs, cheap to clone into each task.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<Registry>,
    pub calls: Arc<CallRouter>,
    pub engine: BroadcastEngine,
    pub shutdown: ShutdownCoordinator,
    next_conn: Arc<AtomicU64>,
}

impl ServerState {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(Registry::new(config.max_clients));
        let calls = Arc::new(CallRouter::new(Arc::clone(&registry)));
        let engine = BroadcastEngine::new(Arc::clone(&registry), Arc::clone(&calls));
        let shutdown = ShutdownCoordinator::new(Arc::clone(&registry));

        Self {
            config: Arc::new(config),
            registry,
            calls,
            engine,
            shutdown,
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        ConnId::new(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
