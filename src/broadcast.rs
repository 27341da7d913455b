//! Per-frame routing: private call partner, or everyone else in the lobby.

use std::sync::Arc;

use tracing::debug;

use crate::call::CallRouter;
use crate::protocol::Outbound;
use crate::registry::{ConnId, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Sent only to the active call partner.
    Partner { to: ConnId, delivered: bool },
    /// Fanned out to every other registered connection.
    Lobby { delivered: usize },
}

#[derive(Clone)]
pub struct BroadcastEngine {
    registry: Arc<Registry>,
    calls: Arc<CallRouter>,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<Registry>, calls: Arc<CallRouter>) -> Self {
        Self { registry, calls }
    }

    /// Delivery is best-effort. A recipient whose queue is full or closed
    /// misses this frame; its own session notices the broken socket.
    pub fn route(&self, frame: &[u8], sender: ConnId) -> Route {
        let frame: Arc<[u8]> = Arc::from(frame);

        let route = match self.calls.active_partner(sender) {
            Some(partner) => Route::Partner {
                to: partner,
                delivered: self.registry.send(partner, Outbound::Audio(frame)),
            },
            None => Route::Lobby {
                delivered: self.registry.broadcast(Outbound::Audio(frame), Some(sender)),
            },
        };

        debug!(conn = %sender, ?route, "frame routed");
        route
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{Notify, mpsc};

    fn setup() -> (Arc<Registry>, Arc<CallRouter>, BroadcastEngine) {
        let registry = Arc::new(Registry::new(10));
        let calls = Arc::new(CallRouter::new(Arc::clone(&registry)));
        let engine = BroadcastEngine::new(Arc::clone(&registry), Arc::clone(&calls));
        (registry, calls, engine)
    }

    fn join(registry: &Registry, id: u64, name: &str) -> (ConnId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = ConnId::new(id);
        registry
            .register(conn, name.to_string(), tx, Arc::new(Notify::new()))
            .unwrap();
        (conn, rx)
    }

    fn audio(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Audio(frame) = msg {
                frames.push(frame.to_vec());
            }
        }
        frames
    }

    #[test]
    fn lobby_fans_out_to_everyone_else() {
        let (registry, _calls, engine) = setup();
        let (alice, mut a_rx) = join(&registry, 1, "alice");
        let (_bob, mut b_rx) = join(&registry, 2, "bob");
        let (_carol, mut c_rx) = join(&registry, 3, "carol");

        let route = engine.route(b"pcm", alice);

        assert_eq!(route, Route::Lobby { delivered: 2 });
        assert!(audio(&mut a_rx).is_empty());
        assert_eq!(audio(&mut b_rx), [b"pcm".to_vec()]);
        assert_eq!(audio(&mut c_rx), [b"pcm".to_vec()]);
    }

    #[test]
    fn active_call_is_point_to_point() {
        let (registry, calls, engine) = setup();
        let (alice, mut a_rx) = join(&registry, 1, "alice");
        let (bob, mut b_rx) = join(&registry, 2, "bob");
        let (_carol, mut c_rx) = join(&registry, 3, "carol");

        calls.call(alice, "bob");
        calls.accept(bob);

        assert_eq!(
            engine.route(b"X", alice),
            Route::Partner {
                to: bob,
                delivered: true
            }
        );
        engine.route(b"Y", bob);

        assert_eq!(audio(&mut b_rx), [b"X".to_vec()]);
        assert_eq!(audio(&mut a_rx), [b"Y".to_vec()]);
        assert!(audio(&mut c_rx).is_empty());
    }

    #[test]
    fn pending_call_still_uses_lobby() {
        let (registry, calls, engine) = setup();
        let (alice, _a_rx) = join(&registry, 1, "alice");
        let (_bob, mut b_rx) = join(&registry, 2, "bob");
        let (_carol, mut c_rx) = join(&registry, 3, "carol");

        calls.call(alice, "bob");

        assert_eq!(engine.route(b"Z", alice), Route::Lobby { delivered: 2 });
        assert_eq!(audio(&mut b_rx), [b"Z".to_vec()]);
        assert_eq!(audio(&mut c_rx), [b"Z".to_vec()]);
    }

    #[test]
    fn rejected_caller_falls_back_to_lobby() {
        let (registry, calls, engine) = setup();
        let (alice, _a_rx) = join(&registry, 1, "alice");
        let (bob, mut b_rx) = join(&registry, 2, "bob");
        let (_carol, mut c_rx) = join(&registry, 3, "carol");

        calls.call(alice, "bob");
        calls.reject(bob);

        assert_eq!(engine.route(b"W", alice), Route::Lobby { delivered: 2 });
        assert_eq!(audio(&mut b_rx), [b"W".to_vec()]);
        assert_eq!(audio(&mut c_rx), [b"W".to_vec()]);
    }

    #[test]
    fn dead_partner_does_not_disturb_state() {
        let (registry, calls, engine) = setup();
        let (alice, _a_rx) = join(&registry, 1, "alice");
        let (bob, b_rx) = join(&registry, 2, "bob");

        calls.call(alice, "bob");
        calls.accept(bob);
        drop(b_rx);

        assert_eq!(
            engine.route(b"X", alice),
            Route::Partner {
                to: bob,
                delivered: false
            }
        );
        assert_eq!(calls.active_partner(alice), Some(bob));
        assert!(registry.contains(bob));
    }
}
