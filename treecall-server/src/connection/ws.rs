//! WebSocket client connection.
//!
//! One task per socket owns the `WebSocket`: it reads command frames and
//! drains the outbound queue. Deliveries from call tasks never touch the
//! socket; they go through a bounded channel with `try_send`, so a slow
//! reader can only ever cost its own connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, mpsc};

use super::{CloseCallback, CloseListeners, Conn, ConnEvent, ConnectionHandle, ListenerToken, User};
use crate::call::{CallReturn, RETCODE_KILLED};
use crate::error::CallError;
use crate::tree::Dispatcher;
use crate::wire::{CommandFrame, RETCODE_BAD_KILL, RETCODE_FOREIGN_ROOT, encode_result};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

pub struct WsConnection {
    session_id: String,
    member_id: String,
    user: Option<User>,
    listeners: CloseListeners,
    tx: mpsc::Sender<WsMessage>,
    /// Fired when the outbound queue overflows; the socket task exits on it.
    shutdown: Notify,
}

impl WsConnection {
    fn new(remote: SocketAddr, user: Option<User>, tx: mpsc::Sender<WsMessage>) -> Self {
        let session_id = format!("ws-{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        Self {
            member_id: member_digest(remote, &session_id),
            session_id,
            user,
            listeners: CloseListeners::new(),
            tx,
            shutdown: Notify::new(),
        }
    }

    /// Mark the connection closed and fire its close listeners.
    pub fn close(&self) {
        if self.listeners.close() {
            tracing::info!(session_id = %self.session_id, "connection closed");
        }
    }

    fn enqueue(&self, msg: WsMessage, len: usize) -> Result<usize, CallError> {
        if self.is_closed() {
            return Err(CallError::ConnectionClosed);
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(len),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id = %self.session_id, "send queue full, dropping connection");
                // closing here would re-enter the caller's locks; let the socket task do it
                self.shutdown.notify_one();
                Err(CallError::ConnectionClosed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CallError::ConnectionClosed),
        }
    }
}

impl ConnectionHandle for WsConnection {
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
        self.member_id.clone()
    }

    fn send_result(&self, ret: &CallReturn) -> Result<usize, CallError> {
        let text = encode_result(ret).map_err(|e| {
            tracing::error!(session_id = %self.session_id, call_id = ret.id, "encode failed: {e}");
            CallError::ConnectionClosed
        })?;
        let len = text.len();
        self.enqueue(WsMessage::Text(text.into()), len)
    }

    fn send_raw(&self, bytes: &[u8]) -> Result<usize, CallError> {
        let msg = match std::str::from_utf8(bytes) {
            Ok(text) => WsMessage::Text(text.to_string().into()),
            Err(_) => WsMessage::Binary(bytes.to_vec().into()),
        };
        self.enqueue(msg, bytes.len())
    }
}

/// Stable member id for a connection: hex SHA-256 of its remote address
/// and session id.
fn member_digest(remote: SocketAddr, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(remote.to_string().as_bytes());
    hasher.update(b"/");
    hasher.update(session_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serve one upgraded socket until either side goes away.
pub async fn serve(
    mut socket: WebSocket,
    remote: SocketAddr,
    user: Option<User>,
    root: Arc<Dispatcher>,
    send_queue: usize,
    send_timeout: Duration,
) {
    let (tx, mut rx) = mpsc::channel::<WsMessage>(send_queue.max(1));
    let conn = Arc::new(WsConnection::new(remote, user, tx));
    tracing::info!(
        session_id = %conn.session_id,
        %remote,
        user = ?conn.user.as_ref().map(User::username),
        "connection opened"
    );

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => handle_frame(&conn, &root, text.as_bytes()),
                    Some(Ok(WsMessage::Binary(data))) => handle_frame(&conn, &root, &data),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %conn.session_id, "read failed: {e}");
                        break;
                    }
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match tokio::time::timeout(send_timeout, socket.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!(session_id = %conn.session_id, "send failed or timed out");
                        break;
                    }
                }
            }
            _ = conn.shutdown.notified() => break,
        }
    }

    conn.close();
    let _ = socket.send(WsMessage::Close(None)).await;
}

fn handle_frame(conn: &Arc<WsConnection>, root: &Arc<Dispatcher>, bytes: &[u8]) {
    let frame = match CommandFrame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(session_id = %conn.session_id, "dropping unparsable frame: {e}");
            return;
        }
    };
    let handle: Conn = conn.clone();

    if frame.kill {
        let reply = match frame.name.trim().parse::<i32>() {
            Ok(target) => match root.kill_by_id(&handle, target) {
                Ok(()) => CallReturn::resolved(frame.id, serde_json::json!("job killing completed")),
                Err(e) => CallReturn::failed(frame.id, RETCODE_KILLED, e),
            },
            Err(e) => CallReturn::failed(
                frame.id,
                RETCODE_BAD_KILL,
                format!("invalid call id {:?}: {e}", frame.name),
            ),
        };
        reply_to(&handle, &reply);
        return;
    }

    if frame.root() != root.name() {
        tracing::debug!(session_id = %conn.session_id, path = %frame.name, "call for a foreign root");
        let reply = CallReturn::failed(frame.id, RETCODE_FOREIGN_ROOT, format!("{} not found", frame.name));
        reply_to(&handle, &reply);
        return;
    }

    root.dispatch(frame.into_request(), handle);
}

fn reply_to(conn: &Conn, ret: &CallReturn) {
    if let Err(e) = conn.send_result(ret) {
        tracing::debug!(session_id = conn.session_id(), call_id = ret.id, "reply dropped: {e}");
    }
}
