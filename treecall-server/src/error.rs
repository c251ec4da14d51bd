//! Error kinds surfaced by call bookkeeping.

/// Failures returned by the call core to its immediate caller.
///
/// Handler-level failures never use this type on the wire directly: they
/// reach the client through [`Call::reject`](crate::call::Call::reject)
/// with a numeric code and this error's message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Unknown path, branch, operation, or call id.
    #[error("{0} not found")]
    NotFound(String),
    /// The connection is already watching this call.
    #[error("connection already attached")]
    AlreadyAttached,
    /// Attempted delivery or attach to a connection that has closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// A call only surfaces the `Kill` event.
    #[error("call has no event named {0:?}")]
    UnsupportedEvent(String),
    /// The user has no live calls in the bank.
    #[error("no live calls for user {0:?}")]
    NoSuchUser(String),
    /// Another live call in the same scope holds this id.
    #[error("call id {0} is already in use")]
    IdInUse(i32),
}
