//! In-process connection.
//!
//! Used for calls that originate inside the server (one branch calling
//! another) and by tests. Deliveries land on an unbounded channel instead
//! of a socket.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{CloseCallback, CloseListeners, ConnEvent, ConnectionHandle, ListenerToken, User};
use crate::call::CallReturn;
use crate::error::CallError;

/// A delivery made to a [`LocalConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Result(CallReturn),
    Raw(Vec<u8>),
}

impl Outbound {
    pub fn as_result(&self) -> Option<&CallReturn> {
        match self {
            Outbound::Result(ret) => Some(ret),
            Outbound::Raw(_) => None,
        }
    }
}

pub struct LocalConnection {
    session_id: String,
    user: Option<User>,
    listeners: CloseListeners,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl LocalConnection {
    pub fn new(
        session_id: impl Into<String>,
        user: Option<User>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            session_id: session_id.into(),
            user,
            listeners: CloseListeners::new(),
            tx,
        });
        (conn, rx)
    }

    /// Close the connection, firing its close listeners.
    pub fn close(&self) {
        if self.listeners.close() {
            tracing::debug!(session_id = %self.session_id, "local connection closed");
        }
    }

    /// Number of live close subscriptions, for leak checks.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn push(&self, out: Outbound) -> Result<usize, CallError> {
        if self.is_closed() {
            return Err(CallError::ConnectionClosed);
        }
        self.tx.send(out).map_err(|_| CallError::ConnectionClosed)?;
        Ok(0)
    }
}

impl ConnectionHandle for LocalConnection {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn identity(&self) -> Option<User> {
        self.user.clone()
    }

    fn is_closed(&self) -> bool {
        self.listeners.is_closed()
    }

    fn subscribe(&self, event: ConnEvent, token: ListenerToken, callback: CloseCallback) -> bool {
        match event {
            ConnEvent::Close => self.listeners.subscribe(token, callback),
        }
    }

    fn unsubscribe(&self, event: ConnEvent, token: &ListenerToken) -> bool {
        match event {
            ConnEvent::Close => self.listeners.unsubscribe(token),
        }
    }

    fn member_id(&self) -> String {
        self.session_id.clone()
    }

    fn send_result(&self, ret: &CallReturn) -> Result<usize, CallError> {
        self.push(Outbound::Result(ret.clone()))
    }

    fn send_raw(&self, bytes: &[u8]) -> Result<usize, CallError> {
        self.push(Outbound::Raw(bytes.to_vec()))
    }
}
