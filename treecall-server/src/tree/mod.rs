//! Path dispatch: `<root>.<branch>.<operation>` to a [`Branch`] handler.
//!
//! The [`Dispatcher`] is assembled once at startup, waits for every
//! branch to finish its own initialization, and is frozen behind an `Arc`
//! from then on. It owns the [`Bank`] shared by every call it creates.

pub mod chat;
pub mod exec;
pub mod system;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Notify, mpsc};

use crate::call::{Bank, Call, CallRequest, RETCODE_KILLED, RETCODE_NOT_FOUND, Scope};
use crate::connection::{Conn, LocalConnection, Outbound, User};
use crate::error::CallError;

pub use chat::ChatBranch;
pub use exec::ExecBranch;
pub use system::SystemBranch;

/// The future a handler runs on its own task.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A named group of callable operations.
pub trait Branch: Send + Sync {
    /// Key under the root, e.g. `$exec`. May itself contain dots.
    fn name(&self) -> &str;

    /// Called once before the dispatcher starts serving. Implementations
    /// that need asynchronous setup spawn it and fire `signal` when done.
    fn ready(self: Arc<Self>, signal: ReadySignal) {
        signal.ready();
    }

    fn exported_names(&self) -> Vec<String>;

    /// Resolve `name` to a handler running against `call`.
    fn invoke(self: Arc<Self>, name: &str, call: Arc<Call>) -> Result<HandlerFuture, CallError>;
}

type Handler = Arc<dyn Fn(Arc<Call>) -> HandlerFuture + Send + Sync>;

/// A branch assembled from closures.
pub struct FnBranch {
    name: String,
    handlers: BTreeMap<String, Handler>,
}

impl FnBranch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Export `handler` under `name`.
    pub fn export<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<Call>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |call: Arc<Call>| -> HandlerFuture { Box::pin(handler(call)) });
        self.handlers.insert(name.into(), handler);
        self
    }
}

impl Branch for FnBranch {
    fn name(&self) -> &str {
        &self.name
    }

    fn exported_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    fn invoke(self: Arc<Self>, name: &str, call: Arc<Call>) -> Result<HandlerFuture, CallError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| CallError::NotFound(name.to_string()))?;
        Ok(handler(call))
    }
}

struct ReadyBarrier {
    remaining: AtomicUsize,
    notify: Notify,
}

impl ReadyBarrier {
    fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_one();
        }
    }

    async fn wait(&self) {
        while self.remaining.load(Ordering::Acquire) > 0 {
            self.notify.notified().await;
        }
    }
}

/// Handed to each branch's [`Branch::ready`]; firing it counts the branch
/// as initialized. Dropping it unfired also counts, with a warning, so one
/// failed initializer cannot hang startup.
pub struct ReadySignal {
    branch: String,
    root: String,
    barrier: Arc<ReadyBarrier>,
    fired: bool,
}

impl ReadySignal {
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Name of the tree root the branch is mounted under.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn ready(mut self) {
        tracing::info!(root = %self.root, branch = %self.branch, "branch ready");
        self.fire();
    }

    fn fire(&mut self) {
        if !self.fired {
            self.fired = true;
            self.barrier.arrive();
        }
    }
}

impl Drop for ReadySignal {
    fn drop(&mut self) {
        if !self.fired {
            tracing::warn!(branch = %self.branch, "branch dropped its ready signal without firing it");
            self.fire();
        }
    }
}

/// Routes call paths to branches and owns the bank of live calls.
pub struct Dispatcher {
    name: String,
    branches: HashMap<String, Arc<dyn Branch>>,
    bank: Arc<Bank>,
    internal_ids: AtomicI32,
    internal_sessions: AtomicU64,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: HashMap::new(),
            bank: Arc::new(Bank::new()),
            // internal calls count down so they never meet client ids
            internal_ids: AtomicI32::new(-1),
            internal_sessions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bank(&self) -> &Arc<Bank> {
        &self.bank
    }

    pub fn add_branch(&mut self, branch: Arc<dyn Branch>) {
        let name = branch.name().to_string();
        self.add_branch_as(name, branch);
    }

    /// Mount `branch` under a key other than its own name.
    pub fn add_branch_as(&mut self, name: impl Into<String>, branch: Arc<dyn Branch>) {
        let name = name.into();
        if self.branches.insert(name.clone(), branch).is_some() {
            tracing::warn!(root = %self.name, branch = %name, "branch replaced");
        }
    }

    /// Run every branch's initialization, wait until all have signalled,
    /// and freeze the tree.
    pub async fn ready(self) -> Arc<Self> {
        let this = Arc::new(self);
        let barrier = Arc::new(ReadyBarrier::new(this.branches.len()));
        tracing::info!(root = %this.name, count = this.branches.len(), "waiting for branches to be ready");
        for (name, branch) in &this.branches {
            let signal = ReadySignal {
                branch: name.clone(),
                root: this.name.clone(),
                barrier: barrier.clone(),
                fired: false,
            };
            branch.clone().ready(signal);
        }
        barrier.wait().await;
        tracing::info!(root = %this.name, "tree ready");
        this
    }

    /// Branch key to its exported operation names.
    pub fn layout(&self) -> BTreeMap<String, Vec<String>> {
        self.branches
            .iter()
            .map(|(name, branch)| {
                let mut ops = branch.exported_names();
                ops.sort();
                (name.clone(), ops)
            })
            .collect()
    }

    /// Create a call for `request` on `conn` and run it on its own task.
    pub fn dispatch(self: &Arc<Self>, request: CallRequest, conn: Conn) -> Arc<Call> {
        let path = request.path.clone();
        let call = Call::new(request, conn, self.bank.clone(), Arc::downgrade(self));
        tracing::debug!(call_id = call.id(), %path, session_id = call.connection().session_id(), "dispatching call");

        let root = self.clone();
        let task_call = call.clone();
        let watch_call = call.clone();
        tokio::spawn(async move {
            let handler = tokio::spawn(async move { root.call(&path, task_call).await });
            if let Err(e) = handler.await {
                if e.is_panic() {
                    tracing::error!(call_id = watch_call.id(), "handler panicked");
                    watch_call.reject(RETCODE_KILLED, "handler panicked");
                }
            }
        });
        call
    }

    /// Route `call` to its branch and run the handler to completion.
    pub async fn call(&self, path: &str, call: Arc<Call>) {
        match self.route(path, call.clone()) {
            Ok(handler) => handler.await,
            Err(e) => {
                tracing::debug!(call_id = call.id(), %path, "route failed: {e}");
                call.reject(RETCODE_NOT_FOUND, e);
            }
        }
    }

    fn route(&self, path: &str, call: Arc<Call>) -> Result<HandlerFuture, CallError> {
        let segments: Vec<&str> = path.split('.').collect();
        let not_found = || CallError::NotFound(path.to_string());
        if segments.len() < 3 || segments[0] != self.name {
            return Err(not_found());
        }
        let operation = segments[segments.len() - 1];
        let key = segments[1..segments.len() - 1].join(".");
        let branch = self.branches.get(&key).ok_or_else(not_found)?;
        branch.clone().invoke(operation, call)
    }

    /// Cancel the live call `id` in `conn`'s scope on behalf of `conn`.
    pub fn kill_by_id(&self, conn: &Conn, id: i32) -> Result<(), CallError> {
        let target = self
            .bank
            .get(&Scope::of(conn), id)
            .ok_or_else(|| CallError::NotFound(format!("call {id}")))?;
        tracing::info!(call_id = id, session_id = conn.session_id(), "kill requested");
        target.kill();
        Ok(())
    }

    /// Run a call from inside the server. Deliveries arrive on the returned
    /// receiver, the same way a client connection would see them.
    pub fn call_internal(
        self: &Arc<Self>,
        path: impl Into<String>,
        user: Option<User>,
        args: Vec<String>,
        kw: BTreeMap<String, String>,
    ) -> (Arc<Call>, mpsc::UnboundedReceiver<Outbound>) {
        let session = self.internal_sessions.fetch_add(1, Ordering::Relaxed);
        let (conn, rx) = LocalConnection::new(format!("internal-{session}"), user);
        let request = CallRequest {
            id: self.internal_ids.fetch_sub(1, Ordering::Relaxed),
            path: path.into(),
            args,
            kw,
            message: None,
        };
        let call = self.dispatch(request, conn);
        (call, rx)
    }
}
