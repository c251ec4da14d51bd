//! Delivery fan-out for one call.
//!
//! A promise delivers to its primary connection (the caller) and to any
//! number of hooked watchers. Each target is written independently; a
//! closed or failing target is skipped without affecting the others.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::CallReturn;
use crate::connection::{Conn, ConnEvent, ListenerToken, same_connection};
use crate::error::CallError;

/// Payload handed to every target of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Result(CallReturn),
    Raw(Vec<u8>),
}

#[derive(Default)]
struct PromiseState {
    /// Cleared when the caller's connection closes, and on settlement.
    primary: Option<Conn>,
    hooked: Vec<Conn>,
    settled: bool,
}

pub struct Promise {
    call_id: i32,
    token: ListenerToken,
    state: Mutex<PromiseState>,
    this: Weak<Promise>,
}

impl Promise {
    pub fn new(call_id: i32, serial: u64) -> Arc<Self> {
        Arc::new_cyclic(|this| Promise {
            call_id,
            token: ListenerToken::Promise(serial),
            state: Mutex::new(PromiseState::default()),
            this: this.clone(),
        })
    }

    /// Bind the caller's connection. Its closure clears the primary so a
    /// dead connection is never written to.
    pub fn bind(&self, conn: Conn) {
        self.state.lock().primary = Some(conn.clone());
        let weak = self.this.clone();
        let subscribed = conn.subscribe(
            ConnEvent::Close,
            self.token.clone(),
            Box::new(move || {
                if let Some(promise) = weak.upgrade() {
                    promise.state.lock().primary = None;
                }
            }),
        );
        if !subscribed {
            tracing::debug!(call_id = self.call_id, "bound to a closed connection");
        }
    }

    pub fn has_primary(&self) -> bool {
        self.state.lock().primary.is_some()
    }

    pub fn is_settled(&self) -> bool {
        self.state.lock().settled
    }

    pub fn watcher_count(&self) -> usize {
        self.state.lock().hooked.len()
    }

    /// Add `conn` as a watcher. It detaches itself when it closes.
    pub fn attach(&self, conn: Conn) -> Result<(), CallError> {
        if conn.is_closed() {
            return Err(CallError::ConnectionClosed);
        }
        {
            let mut state = self.state.lock();
            if state.settled {
                return Err(CallError::NotFound(format!("call {}", self.call_id)));
            }
            let is_primary = state
                .primary
                .as_ref()
                .is_some_and(|p| same_connection(p, &conn));
            if is_primary || state.hooked.iter().any(|h| same_connection(h, &conn)) {
                return Err(CallError::AlreadyAttached);
            }
            state.hooked.push(conn.clone());
        }

        let weak = self.this.clone();
        let watcher = Arc::downgrade(&conn);
        let subscribed = conn.subscribe(
            ConnEvent::Close,
            self.token.clone(),
            Box::new(move || {
                if let (Some(promise), Some(conn)) = (weak.upgrade(), watcher.upgrade()) {
                    let _ = promise.detach(&conn);
                }
            }),
        );
        if !subscribed {
            // closed between the check above and the subscription
            self.state.lock().hooked.retain(|h| !same_connection(h, &conn));
            return Err(CallError::ConnectionClosed);
        }
        tracing::debug!(call_id = self.call_id, session_id = conn.session_id(), "watcher attached");
        Ok(())
    }

    /// Remove the watcher `conn`.
    pub fn detach(&self, conn: &Conn) -> Result<(), CallError> {
        let removed = {
            let mut state = self.state.lock();
            let idx = state.hooked.iter().position(|h| same_connection(h, conn));
            idx.map(|i| state.hooked.remove(i))
        };
        let Some(removed) = removed else {
            return Err(CallError::NotFound("watcher".into()));
        };
        removed.unsubscribe(ConnEvent::Close, &self.token);
        tracing::debug!(call_id = self.call_id, session_id = removed.session_id(), "watcher detached");
        Ok(())
    }

    /// Send `delivery` to the primary and every watcher. A terminal delivery
    /// settles the promise and releases all subscriptions. Returns false if
    /// the promise had already settled.
    pub fn deliver(&self, delivery: &Delivery, terminal: bool) -> bool {
        let released = {
            let mut state = self.state.lock();
            if state.settled {
                return false;
            }
            if let Some(primary) = &state.primary {
                self.send_to(primary, delivery);
            }
            for watcher in &state.hooked {
                self.send_to(watcher, delivery);
            }
            if terminal {
                state.settled = true;
                Some(take_targets(&mut state))
            } else {
                None
            }
        };
        if let Some(targets) = released {
            self.release(targets);
        }
        true
    }

    /// Drop every subscription this promise holds. Safe to repeat.
    pub fn clean(&self) {
        let targets = take_targets(&mut self.state.lock());
        self.release(targets);
    }

    fn release(&self, targets: Vec<Conn>) {
        for conn in targets {
            conn.unsubscribe(ConnEvent::Close, &self.token);
        }
    }

    fn send_to(&self, conn: &Conn, delivery: &Delivery) {
        if conn.is_closed() {
            tracing::debug!(call_id = self.call_id, session_id = conn.session_id(), "skipping closed connection");
            return;
        }
        let sent = match delivery {
            Delivery::Result(ret) => conn.send_result(ret),
            Delivery::Raw(bytes) => conn.send_raw(bytes),
        };
        if let Err(e) = sent {
            tracing::warn!(call_id = self.call_id, session_id = conn.session_id(), "delivery failed: {e}");
        }
    }
}

fn take_targets(state: &mut PromiseState) -> Vec<Conn> {
    let mut targets: Vec<Conn> = state.primary.take().into_iter().collect();
    targets.append(&mut state.hooked);
    targets
}
