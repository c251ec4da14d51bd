//! The connection capability consumed by the call core.
//!
//! A connection is owned by its transport. The core only ever sees it as an
//! [`Arc<dyn ConnectionHandle>`](Conn) and talks to it through this trait:
//! - identity of the user behind it (if any)
//! - a typed `Close` subscription table keyed by [`ListenerToken`]
//! - result delivery (structured results, progress, pre-encoded bytes)
//!
//! Implementations:
//! - [`ws`]: a WebSocket client connection
//! - [`local`]: an in-process connection for internal calls and tests

pub mod local;
pub mod ws;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::call::CallReturn;
use crate::error::CallError;

pub use local::{LocalConnection, Outbound};
pub use ws::WsConnection;

/// Shared handle to any connection.
pub type Conn = Arc<dyn ConnectionHandle>;

/// Callback fired once when a connection closes.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// The identity attached to a connection. Used only as a grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
    username: String,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Events a connection surfaces to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Close,
}

/// Identifies one subscription in a connection's listener table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerToken {
    /// A promise watching the connection (as primary or hook).
    Promise(u64),
    /// The auto-kill of a foreground call.
    AutoKill(u64),
    /// A branch-defined subscription.
    Named(String),
}

impl fmt::Display for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerToken::Promise(serial) => write!(f, "_ps{serial}"),
            ListenerToken::AutoKill(serial) => write!(f, "cc{serial}"),
            ListenerToken::Named(name) => f.write_str(name),
        }
    }
}

/// What the core needs from a connection.
pub trait ConnectionHandle: Send + Sync {
    /// Transport-assigned session id, for logging.
    fn session_id(&self) -> &str;

    /// The user behind this connection, `None` when anonymous.
    fn identity(&self) -> Option<User>;

    fn is_closed(&self) -> bool;

    /// Register `callback` under `token`. Returns false when the connection
    /// is already closed or the token is taken.
    fn subscribe(&self, event: ConnEvent, token: ListenerToken, callback: CloseCallback) -> bool;

    /// Remove the subscription under `token`. Returns false when nothing
    /// was removed.
    fn unsubscribe(&self, event: ConnEvent, token: &ListenerToken) -> bool;

    /// A stable id for this connection, e.g. its identity inside a chat room.
    fn member_id(&self) -> String;

    /// Deliver a final result or a progress notification.
    fn send_result(&self, ret: &CallReturn) -> Result<usize, CallError>;

    /// Deliver bytes that are already encoded for the wire.
    fn send_raw(&self, bytes: &[u8]) -> Result<usize, CallError>;
}

/// Identity comparison for connection handles.
pub fn same_connection(a: &Conn, b: &Conn) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Close-listener table shared by connection implementations.
///
/// Callbacks run after the table lock is released, so a callback may
/// freely unsubscribe (its own or other) tokens.
#[derive(Default)]
pub struct CloseListeners {
    inner: Mutex<ListenerTable>,
}

#[derive(Default)]
struct ListenerTable {
    closed: bool,
    listeners: Vec<(ListenerToken, CloseCallback)>,
}

impl CloseListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn subscribe(&self, token: ListenerToken, callback: CloseCallback) -> bool {
        let mut table = self.inner.lock();
        if table.closed {
            tracing::debug!(%token, "subscribe on closed connection ignored");
            return false;
        }
        if table.listeners.iter().any(|(t, _)| *t == token) {
            tracing::debug!(%token, "close listener already registered");
            return false;
        }
        table.listeners.push((token, callback));
        true
    }

    pub fn unsubscribe(&self, token: &ListenerToken) -> bool {
        let mut table = self.inner.lock();
        if table.closed {
            return false;
        }
        match table.listeners.iter().position(|(t, _)| t == token) {
            Some(idx) => {
                table.listeners.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark closed and fire every listener once. Returns false if the table
    /// was already closed.
    pub fn close(&self) -> bool {
        let listeners = {
            let mut table = self.inner.lock();
            if table.closed {
                return false;
            }
            table.closed = true;
            std::mem::take(&mut table.listeners)
        };
        for (token, callback) in listeners {
            tracing::trace!(%token, "firing close listener");
            callback();
        }
        true
    }
}
