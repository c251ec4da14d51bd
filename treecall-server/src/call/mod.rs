//! Call lifecycle: one [`Call`] per request, from dispatch to its single
//! terminal outcome.
//!
//! State machine: `Running → Resolved | Rejected | Killed`. `notify` is a
//! self-loop on `Running`. Every terminal transition runs `clean()`, which
//! takes the call out of the [`Bank`] and drops its auto-kill subscription.
//!
//! Lock order: call state, then promise, then bank. Nothing here calls back
//! into a call while holding the bank lock.

pub mod bank;
pub mod promise;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::{Conn, ConnEvent, ListenerToken};
use crate::error::CallError;
use crate::tree::Dispatcher;

pub use bank::{Bank, Scope};
pub use promise::{Delivery, Promise};

/// Retcode of a resolved call.
pub const RETCODE_OK: i32 = 0;
/// Retcode of a progress notification from a foreground call.
pub const RETCODE_NOTIFY: i32 = -1;
/// Retcode of a progress notification from a background call.
pub const RETCODE_NOTIFY_BACKGROUND: i32 = -2;
/// Retcode of a rejection caused by [`Call::kill`].
pub const RETCODE_KILLED: i32 = 500;
/// Retcode of a rejection for an unknown path, branch or operation.
pub const RETCODE_NOT_FOUND: i32 = 1;
/// Retcode of a handler-level failure (bad arguments, refused request).
pub const RETCODE_ERROR: i32 = 304;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// One delivery to a listener: a result, a progress notification or a
/// failure, told apart by `retcode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReturn {
    pub id: i32,
    pub retcode: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl CallReturn {
    pub fn resolved(id: i32, stdout: Value) -> Self {
        Self::progress(id, RETCODE_OK, stdout)
    }

    pub fn progress(id: i32, retcode: i32, stdout: Value) -> Self {
        Self {
            id,
            retcode,
            stdout: Some(stdout),
            stderr: None,
        }
    }

    pub fn failed(id: i32, retcode: i32, err: impl fmt::Display) -> Self {
        Self {
            id,
            retcode,
            stdout: None,
            stderr: Some(err.to_string()),
        }
    }

    /// Whether this delivery ends the call.
    pub fn is_terminal(&self) -> bool {
        self.retcode >= 0
    }
}

/// What a transport decoded from one call request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallRequest {
    pub id: i32,
    pub path: String,
    pub args: Vec<String>,
    pub kw: BTreeMap<String, String>,
    pub message: Option<Value>,
}

impl CallRequest {
    pub fn new(id: i32, path: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kw(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kw.insert(key.into(), value.into());
        self
    }

    pub fn with_message(mut self, message: Value) -> Self {
        self.message = Some(message);
        self
    }
}

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Running,
    Resolved,
    Rejected,
    Killed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallStatus::Running)
    }
}

/// Events a call surfaces. `Kill` is the only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Kill,
}

impl FromStr for CallEvent {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Kill" => Ok(CallEvent::Kill),
            other => Err(CallError::UnsupportedEvent(other.to_string())),
        }
    }
}

type KillCallback = Box<dyn FnOnce() + Send>;

struct CallState {
    status: CallStatus,
    background: bool,
    kill_listeners: Vec<KillCallback>,
}

/// A single in-flight request.
pub struct Call {
    id: i32,
    /// Process-unique; keys this call's subscriptions so equal ids coming
    /// from different connections never collide.
    serial: u64,
    path: String,
    owner: Option<String>,
    /// Where `id` is unique: the owner, or the session for anonymous callers.
    scope: Scope,
    args: Vec<String>,
    kw: BTreeMap<String, String>,
    message: Option<Value>,
    created_at: DateTime<Utc>,
    conn: Conn,
    bank: Arc<Bank>,
    root: Weak<Dispatcher>,
    promise: Arc<Promise>,
    state: Mutex<CallState>,
    this: Weak<Call>,
}

impl Call {
    /// Create a foreground call bound to `conn`.
    ///
    /// The owner is captured from the connection's identity now, so a
    /// background call keeps its username after the connection is gone.
    pub fn new(request: CallRequest, conn: Conn, bank: Arc<Bank>, root: Weak<Dispatcher>) -> Arc<Self> {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let owner = conn.identity().map(|u| u.username().to_string());
        let scope = Scope::of(&conn);
        let promise = Promise::new(request.id, serial);
        promise.bind(conn.clone());

        let call = Arc::new_cyclic(|this| Call {
            id: request.id,
            serial,
            path: request.path,
            owner,
            scope,
            args: request.args,
            kw: request.kw,
            message: request.message,
            created_at: Utc::now(),
            conn,
            bank,
            root,
            promise,
            state: Mutex::new(CallState {
                status: CallStatus::Running,
                // flipped by set_background(false) below so the auto-kill gets attached
                background: true,
                kill_listeners: Vec::new(),
            }),
            this: this.clone(),
        });
        call.set_background(false);
        call
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Username of the caller at creation time.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).map(String::as_str)
    }

    pub fn kw(&self) -> &BTreeMap<String, String> {
        &self.kw
    }

    pub fn message(&self) -> Option<&Value> {
        self.message.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The connection that issued this call.
    pub fn connection(&self) -> &Conn {
        &self.conn
    }

    pub fn bank(&self) -> &Arc<Bank> {
        &self.bank
    }

    /// The dispatcher this call was routed through, if it is still alive.
    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.root.upgrade()
    }

    pub fn promise(&self) -> &Arc<Promise> {
        &self.promise
    }

    pub fn status(&self) -> CallStatus {
        self.state.lock().status
    }

    pub fn is_background(&self) -> bool {
        self.state.lock().background
    }

    /// Retcode used by [`notify`](Self::notify): -1 in the foreground, -2 in
    /// the background.
    pub fn retcode_of_notify(&self) -> i32 {
        if self.is_background() {
            RETCODE_NOTIFY_BACKGROUND
        } else {
            RETCODE_NOTIFY
        }
    }

    pub fn kill_listener_count(&self) -> usize {
        self.state.lock().kill_listeners.len()
    }

    /// Terminal success.
    pub fn resolve<T: Serialize>(&self, value: T) {
        let stdout = self.to_json(value);
        self.finish(CallStatus::Resolved, Delivery::Result(CallReturn::resolved(self.id, stdout)));
    }

    /// Terminal failure.
    pub fn reject(&self, code: i32, err: impl fmt::Display) {
        self.finish(
            CallStatus::Rejected,
            Delivery::Result(CallReturn::failed(self.id, code, err)),
        );
    }

    /// Progress output. Does not change state.
    pub fn notify<T: Serialize>(&self, value: T) {
        let stdout = self.to_json(value);
        let ret = CallReturn::progress(self.id, self.retcode_of_notify(), stdout);
        if !self.promise.deliver(&Delivery::Result(ret), false) {
            tracing::debug!(call_id = self.id, "notify after settlement dropped");
        }
    }

    /// Deliver bytes that are already encoded for the wire. A terminal
    /// direct result settles the call like `resolve`.
    pub fn direct_result(&self, bytes: Vec<u8>, terminal: bool) {
        if terminal {
            self.finish(CallStatus::Resolved, Delivery::Raw(bytes));
        } else if !self.promise.deliver(&Delivery::Raw(bytes), false) {
            tracing::debug!(call_id = self.id, "direct result after settlement dropped");
        }
    }

    /// Toggle whether losing the primary connection kills this call.
    pub fn set_background(&self, yes: bool) {
        let mut state = self.state.lock();
        if state.background == yes || !self.promise.has_primary() {
            return;
        }
        state.background = yes;
        let token = ListenerToken::AutoKill(self.serial);
        if yes {
            self.conn.unsubscribe(ConnEvent::Close, &token);
            tracing::debug!(call_id = self.id, "call moved to background");
        } else {
            let weak = self.this.clone();
            let subscribed = self.conn.subscribe(
                ConnEvent::Close,
                token,
                Box::new(move || {
                    if let Some(call) = weak.upgrade() {
                        tracing::debug!(call_id = call.id, "connection lost, killing foreground call");
                        call.kill();
                    }
                }),
            );
            if !subscribed {
                drop(state);
                tracing::debug!(call_id = self.id, "connection already closed, killing foreground call");
                self.kill();
            }
        }
    }

    /// Subscribe to a call event by name. Only `"Kill"` exists.
    pub fn on(&self, event: &str, callback: impl FnOnce() + Send + 'static) -> Result<bool, CallError> {
        match event.parse::<CallEvent>()? {
            CallEvent::Kill => Ok(self.on_kill(callback)),
        }
    }

    /// Register a cleanup callback fired once by [`kill`](Self::kill).
    ///
    /// The first listener on a running call registers it into the bank,
    /// which is what makes it findable by id and listable by user. If the
    /// id is taken by another live call in the same scope, the call is
    /// rejected instead.
    ///
    /// Returns `false` when the call has already ended (or just got
    /// rejected). The callback has then run before this returns.
    pub fn on_kill(&self, callback: impl FnOnce() + Send + 'static) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            drop(state);
            tracing::debug!(call_id = self.id, "call already settled, running kill listener now");
            callback();
            return false;
        }
        if state.kill_listeners.is_empty() {
            if let Some(this) = self.this.upgrade() {
                if let Err(e) = self.bank.register(this) {
                    drop(state);
                    self.reject(RETCODE_ERROR, &e);
                    callback();
                    return false;
                }
            }
        }
        state.kill_listeners.push(Box::new(callback));
        true
    }

    /// Cancel this call. Safe to repeat: listeners fire once in total.
    pub fn kill(&self) {
        let (listeners, was_running) = {
            let mut state = self.state.lock();
            let running = !state.status.is_terminal();
            if running {
                state.status = CallStatus::Killed;
            }
            (std::mem::take(&mut state.kill_listeners), running)
        };
        if was_running {
            self.settle(
                CallStatus::Killed,
                Delivery::Result(CallReturn::failed(self.id, RETCODE_KILLED, "job killed")),
            );
        } else {
            self.bank.unregister_call(self);
        }
        if !listeners.is_empty() {
            tracing::debug!(call_id = self.id, count = listeners.len(), "firing kill listeners");
        }
        for listener in listeners {
            listener();
        }
    }

    /// Kill another live call by id in this call's scope, e.g. a background
    /// call started from an earlier connection.
    pub fn kill_peer(&self, other: i32) -> Result<(), CallError> {
        let target = self
            .bank
            .get(&self.scope, other)
            .ok_or_else(|| CallError::NotFound(format!("call {other}")))?;
        tracing::info!(call_id = self.id, target = other, "killing peer call");
        target.kill();
        Ok(())
    }

    /// Watch the output of the live call `owner_id` from this call's
    /// connection.
    pub fn hook(&self, owner_id: i32) -> Result<(), CallError> {
        let target = self
            .bank
            .get(&self.scope, owner_id)
            .ok_or_else(|| CallError::NotFound(format!("call {owner_id}")))?;
        self.hook_to(&target)
    }

    /// Stop watching the live call `owner_id`.
    pub fn unhook(&self, owner_id: i32) -> Result<(), CallError> {
        let target = self
            .bank
            .get(&self.scope, owner_id)
            .ok_or_else(|| CallError::NotFound(format!("call {owner_id}")))?;
        self.unhook_from(&target)
    }

    pub fn hook_to(&self, target: &Call) -> Result<(), CallError> {
        target.promise.attach(self.conn.clone())
    }

    pub fn unhook_from(&self, target: &Call) -> Result<(), CallError> {
        target.promise.detach(&self.conn)
    }

    fn finish(&self, status: CallStatus, delivery: Delivery) {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                tracing::debug!(call_id = self.id, ?status, was = ?state.status, "call already settled");
                return;
            }
            state.status = status;
        }
        self.settle(status, delivery);
    }

    fn settle(&self, status: CallStatus, delivery: Delivery) {
        tracing::debug!(call_id = self.id, ?status, path = %self.path, "call settled");
        // out of the bank before anyone sees the outcome
        self.clean();
        self.promise.deliver(&delivery, true);
    }

    fn clean(&self) {
        self.bank.unregister_call(self);
        self.conn
            .unsubscribe(ConnEvent::Close, &ListenerToken::AutoKill(self.serial));
    }

    fn to_json<T: Serialize>(&self, value: T) -> Value {
        serde_json::to_value(value).unwrap_or_else(|e| {
            tracing::warn!(call_id = self.id, "result not serializable: {e}");
            Value::Null
        })
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
