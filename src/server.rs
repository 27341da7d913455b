use anyhow::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::shutdown;
use crate::state::ServerState;

pub struct Server {
    listener: TcpListener,
    state: ServerState,
}

impl Server {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;

        Ok(Self {
            listener,
            state: ServerState::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> ServerState {
        self.state.clone()
    }

    /// Accepts until shutdown is requested or the listener fails, then
    /// waits for every session to finish its cleanup.
    pub async fn run(self) -> Result<()> {
        let Server { listener, state } = self;

        info!(
            addr = %listener.local_addr()?,
            max_clients = state.config.max_clients,
            "listening"
        );

        let mut stop = state.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        let outcome = loop {
            // Reap finished sessions so the set does not grow unbounded.
            while sessions.try_join_next().is_some() {}

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown::stopped(&mut stop) => break Ok(()),
            };

            match accepted {
                Ok((socket, peer)) => {
                    let state = state.clone();

                    sessions.spawn(async move {
                        if let Err(err) = crate::conn::handle(state, socket, peer).await {
                            warn!(%peer, "connection error: {err:#}");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "listener failed");
                    state.shutdown.shutdown();
                    break Err(e.into());
                }
            }
        };

        drop(listener);

        while sessions.join_next().await.is_some() {}

        info!("relay stopped");

        outcome
    }
}
