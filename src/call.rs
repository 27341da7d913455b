//! Pairwise call signaling: Idle → Pending → Active.
//!
//! A call is stored once, in `calls`, and both participants point at it
//! through `by_conn`. Notices are collected while the table is locked and
//! enqueued after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::protocol::{Command, Notice};
use crate::registry::{ConnId, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Pending,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSession {
    pub caller: ConnId,
    pub callee: ConnId,
    pub status: CallStatus,
}

impl CallSession {
    pub fn partner_of(&self, conn: ConnId) -> Option<ConnId> {
        if conn == self.caller {
            Some(self.callee)
        } else if conn == self.callee {
            Some(self.caller)
        } else {
            None
        }
    }
}

type CallId = u64;

#[derive(Default)]
struct CallTable {
    calls: HashMap<CallId, CallSession>,
    by_conn: HashMap<ConnId, CallId>,
    next_id: CallId,
}

impl CallTable {
    fn session_of(&self, conn: ConnId) -> Option<(CallId, CallSession)> {
        let id = *self.by_conn.get(&conn)?;
        self.calls.get(&id).map(|call| (id, *call))
    }

    fn is_engaged(&self, conn: ConnId) -> bool {
        self.by_conn.contains_key(&conn)
    }

    fn open(&mut self, caller: ConnId, callee: ConnId) {
        let id = self.next_id;
        self.next_id += 1;
        self.calls.insert(
            id,
            CallSession {
                caller,
                callee,
                status: CallStatus::Pending,
            },
        );
        self.by_conn.insert(caller, id);
        self.by_conn.insert(callee, id);
    }

    fn close(&mut self, id: CallId) -> Option<CallSession> {
        let call = self.calls.remove(&id)?;
        self.by_conn.remove(&call.caller);
        self.by_conn.remove(&call.callee);
        Some(call)
    }
}

pub struct CallRouter {
    registry: Arc<Registry>,
    table: Mutex<CallTable>,
}

impl CallRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            table: Mutex::new(CallTable::default()),
        }
    }

    // Every statement leaves the table consistent, so a poisoned lock is
    // still safe to use.
    fn table(&self) -> MutexGuard<'_, CallTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notices: Vec<(ConnId, Notice)>) {
        for (conn, notice) in notices {
            self.registry.send(conn, notice);
        }
    }

    pub fn dispatch(&self, conn: ConnId, cmd: Command) {
        match cmd {
            Command::Call(target) => self.call(conn, &target),
            Command::Accept => self.accept(conn),
            Command::Reject => self.reject(conn),
            Command::End => self.end(conn),
        }
    }

    /// Offers a call from `caller` to the connection named `target`.
    ///
    /// Self-calls, unknown names and busy parties on either side all get
    /// `User not found`.
    pub fn call(&self, caller: ConnId, target: &str) {
        let mut notices = Vec::with_capacity(2);
        {
            let mut table = self.table();

            // Looked up under the table lock. Sessions unregister before
            // `on_disconnect`, so a target found here is torn down after
            // this insert, and one already gone is never found.
            let callee = if table.is_engaged(caller) {
                None
            } else {
                self.registry
                    .lookup_by_name(target)
                    .filter(|callee| *callee != caller && !table.is_engaged(*callee))
            };

            match callee {
                Some(callee) => {
                    table.open(caller, callee);
                    let caller_name = self.registry.name_of(caller).unwrap_or_default();
                    info!(caller = %caller, callee = %callee, "call offered");
                    notices.push((callee, Notice::IncomingCall(caller_name)));
                    notices.push((caller, Notice::Calling));
                }
                None => {
                    debug!(caller = %caller, name = target, "call target unavailable");
                    notices.push((caller, Notice::UserNotFound));
                }
            }
        }
        self.notify(notices);
    }

    pub fn accept(&self, callee: ConnId) {
        let mut notices = Vec::with_capacity(2);
        {
            let mut table = self.table();

            let pending = table
                .session_of(callee)
                .filter(|(_, call)| call.status == CallStatus::Pending && call.callee == callee);

            match pending {
                Some((id, call)) => {
                    if let Some(entry) = table.calls.get_mut(&id) {
                        entry.status = CallStatus::Active;
                    }
                    info!(caller = %call.caller, callee = %callee, "call accepted");
                    notices.push((call.caller, Notice::CallAccepted));
                    notices.push((callee, Notice::CallAccepted));
                }
                None => notices.push((callee, Notice::NoCallToAccept)),
            }
        }
        self.notify(notices);
    }

    pub fn reject(&self, callee: ConnId) {
        let mut notices = Vec::with_capacity(2);
        {
            let mut table = self.table();

            let pending = table
                .session_of(callee)
                .filter(|(_, call)| call.status == CallStatus::Pending && call.callee == callee);

            match pending {
                Some((id, call)) => {
                    table.close(id);
                    info!(caller = %call.caller, callee = %callee, "call rejected");
                    notices.push((call.caller, Notice::CallRejected));
                    notices.push((callee, Notice::CallRejected));
                }
                None => notices.push((callee, Notice::NoCallToReject)),
            }
        }
        self.notify(notices);
    }

    /// Hangs up. Either participant may end an active call, and a pending
    /// one can be withdrawn the same way.
    pub fn end(&self, participant: ConnId) {
        let mut notices = Vec::with_capacity(2);
        {
            let mut table = self.table();

            match table.session_of(participant) {
                Some((id, call)) => {
                    table.close(id);
                    info!(caller = %call.caller, callee = %call.callee, "call ended");
                    notices.push((participant, Notice::CallEnded));
                    if let Some(partner) = call.partner_of(participant) {
                        notices.push((partner, Notice::CallEnded));
                    }
                }
                None => notices.push((participant, Notice::NoActiveCall)),
            }
        }
        self.notify(notices);
    }

    /// Drops whatever call `conn` was part of and tells the other side.
    /// A second call for the same connection does nothing.
    pub fn on_disconnect(&self, conn: ConnId) {
        let mut notices = Vec::with_capacity(1);
        {
            let mut table = self.table();

            if let Some((id, call)) = table.session_of(conn) {
                table.close(id);
                debug!(conn = %conn, "call torn down by disconnect");
                if let Some(partner) = call.partner_of(conn) {
                    notices.push((partner, Notice::CallEnded));
                }
            }
        }
        self.notify(notices);
    }

    /// Partner of `conn` if, and only if, their call is active.
    pub fn active_partner(&self, conn: ConnId) -> Option<ConnId> {
        self.table()
            .session_of(conn)
            .filter(|(_, call)| call.status == CallStatus::Active)
            .and_then(|(_, call)| call.partner_of(conn))
    }

    pub fn session_of(&self, conn: ConnId) -> Option<CallSession> {
        self.table().session_of(conn).map(|(_, call)| call)
    }

    pub fn len(&self) -> usize {
        self.table().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Outbound;
    use tokio::sync::{Notify, mpsc};

    struct Harness {
        registry: Arc<Registry>,
        router: CallRouter,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(Registry::new(10));
            let router = CallRouter::new(Arc::clone(&registry));
            Self { registry, router }
        }

        fn join(&self, id: u64, name: &str) -> (ConnId, mpsc::Receiver<Outbound>) {
            let (tx, rx) = mpsc::channel(16);
            let conn = ConnId::new(id);
            self.registry
                .register(conn, name.to_string(), tx, Arc::new(Notify::new()))
                .unwrap();
            (conn, rx)
        }

        fn assert_single_membership(&self) {
            let table = self.router.table();
            assert_eq!(table.by_conn.len(), table.calls.len() * 2);
            for (conn, id) in &table.by_conn {
                let call = table.calls[id];
                assert!(call.caller == *conn || call.callee == *conn);
                assert_ne!(call.caller, call.callee);
            }
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Notice(notice) = msg {
                out.push(notice);
            }
        }
        out
    }

    #[test]
    fn call_then_accept_goes_active() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (bob, mut b_rx) = h.join(2, "bob");

        h.router.call(alice, "bob");
        assert_eq!(drain(&mut b_rx), [Notice::IncomingCall("alice".into())]);
        assert_eq!(drain(&mut a_rx), [Notice::Calling]);
        assert_eq!(h.router.session_of(alice).unwrap().status, CallStatus::Pending);
        assert_eq!(h.router.active_partner(alice), None);

        h.router.accept(bob);
        assert_eq!(drain(&mut a_rx), [Notice::CallAccepted]);
        assert_eq!(drain(&mut b_rx), [Notice::CallAccepted]);
        assert_eq!(h.router.active_partner(alice), Some(bob));
        assert_eq!(h.router.active_partner(bob), Some(alice));
        h.assert_single_membership();
    }

    #[test]
    fn unknown_target_leaves_state_idle() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");

        h.router.call(alice, "carol");

        assert_eq!(drain(&mut a_rx), [Notice::UserNotFound]);
        assert!(h.router.is_empty());
    }

    #[test]
    fn self_call_is_rejected() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");

        h.router.call(alice, "alice");

        assert_eq!(drain(&mut a_rx), [Notice::UserNotFound]);
        assert!(h.router.is_empty());
    }

    #[test]
    fn busy_target_and_busy_caller_are_rejected() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (_bob, _b_rx) = h.join(2, "bob");
        let (carol, mut c_rx) = h.join(3, "carol");

        h.router.call(alice, "bob");
        drain(&mut a_rx);

        h.router.call(carol, "bob");
        assert_eq!(drain(&mut c_rx), [Notice::UserNotFound]);

        h.router.call(alice, "carol");
        assert_eq!(drain(&mut a_rx), [Notice::UserNotFound]);

        assert_eq!(h.router.len(), 1);
        h.assert_single_membership();
    }

    #[test]
    fn caller_cannot_accept_own_call() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (_bob, _b_rx) = h.join(2, "bob");

        h.router.call(alice, "bob");
        drain(&mut a_rx);

        h.router.accept(alice);
        assert_eq!(drain(&mut a_rx), [Notice::NoCallToAccept]);
        h.router.reject(alice);
        assert_eq!(drain(&mut a_rx), [Notice::NoCallToReject]);
        assert_eq!(h.router.session_of(alice).unwrap().status, CallStatus::Pending);
    }

    #[test]
    fn reject_destroys_pending_call() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (bob, mut b_rx) = h.join(2, "bob");

        h.router.call(alice, "bob");
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.router.reject(bob);
        assert_eq!(drain(&mut a_rx), [Notice::CallRejected]);
        assert_eq!(drain(&mut b_rx), [Notice::CallRejected]);
        assert!(h.router.is_empty());

        h.router.reject(bob);
        assert_eq!(drain(&mut b_rx), [Notice::NoCallToReject]);
    }

    #[test]
    fn accept_without_offer() {
        let h = Harness::new();
        let (bob, mut b_rx) = h.join(2, "bob");

        h.router.accept(bob);
        assert_eq!(drain(&mut b_rx), [Notice::NoCallToAccept]);
    }

    #[test]
    fn end_notifies_both_and_is_not_repeatable() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (bob, mut b_rx) = h.join(2, "bob");

        h.router.call(alice, "bob");
        h.router.accept(bob);
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.router.end(bob);
        assert_eq!(drain(&mut a_rx), [Notice::CallEnded]);
        assert_eq!(drain(&mut b_rx), [Notice::CallEnded]);

        h.router.end(alice);
        assert_eq!(drain(&mut a_rx), [Notice::NoActiveCall]);
    }

    #[test]
    fn end_withdraws_pending_call() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (_bob, mut b_rx) = h.join(2, "bob");

        h.router.call(alice, "bob");
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.router.end(alice);
        assert_eq!(drain(&mut a_rx), [Notice::CallEnded]);
        assert_eq!(drain(&mut b_rx), [Notice::CallEnded]);
        assert!(h.router.is_empty());
    }

    #[test]
    fn disconnect_ends_call_once() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (bob, mut b_rx) = h.join(2, "bob");

        h.router.call(alice, "bob");
        h.router.accept(bob);
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.router.on_disconnect(alice);
        h.router.on_disconnect(alice);

        assert_eq!(drain(&mut b_rx), [Notice::CallEnded]);
        assert!(h.router.is_empty());

        h.router.end(bob);
        assert_eq!(drain(&mut b_rx), [Notice::NoActiveCall]);
    }

    #[test]
    fn disconnect_of_pending_callee_frees_caller() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (bob, _b_rx) = h.join(2, "bob");
        let (_carol, _c_rx) = h.join(3, "carol");

        h.router.call(alice, "bob");
        drain(&mut a_rx);

        h.router.on_disconnect(bob);
        assert_eq!(drain(&mut a_rx), [Notice::CallEnded]);

        h.router.call(alice, "carol");
        assert_eq!(drain(&mut a_rx), [Notice::Calling]);
        h.assert_single_membership();
    }

    #[test]
    fn call_racing_a_departure_is_torn_down() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (bob, _b_rx) = h.join(2, "bob");

        // Call lands before bob's cleanup starts.
        h.router.call(alice, "bob");
        h.registry.unregister(bob).unwrap();
        h.router.on_disconnect(bob);
        assert_eq!(drain(&mut a_rx), [Notice::Calling, Notice::CallEnded]);
        assert_eq!(h.router.session_of(alice), None);

        // Call lands between unregister and teardown.
        let (bob, _b_rx) = h.join(3, "bob");
        h.registry.unregister(bob).unwrap();
        h.router.call(alice, "bob");
        h.router.on_disconnect(bob);
        assert_eq!(drain(&mut a_rx), [Notice::UserNotFound]);
        assert_eq!(h.router.session_of(alice), None);
        assert!(h.router.is_empty());
    }

    #[test]
    fn dispatch_routes_commands() {
        let h = Harness::new();
        let (alice, mut a_rx) = h.join(1, "alice");
        let (bob, mut b_rx) = h.join(2, "bob");

        h.router.dispatch(alice, Command::Call("bob".into()));
        h.router.dispatch(bob, Command::Accept);
        h.router.dispatch(alice, Command::End);

        assert_eq!(
            drain(&mut a_rx),
            [Notice::Calling, Notice::CallAccepted, Notice::CallEnded]
        );
        assert_eq!(
            drain(&mut b_rx),
            [
                Notice::IncomingCall("alice".into()),
                Notice::CallAccepted,
                Notice::CallEnded
            ]
        );
    }
}
