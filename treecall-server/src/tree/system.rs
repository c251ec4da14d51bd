//! The `$` branch: introspection and cross-call control.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Branch, HandlerFuture};
use crate::call::{Call, RETCODE_ERROR, RETCODE_KILLED};
use crate::error::CallError;

const OPERATIONS: [&str; 5] = ["Hook", "Kill", "Layout", "ListUserTasks", "Unhook"];

/// One live call as listed by `ListUserTasks`.
#[derive(Debug, Serialize)]
pub struct TaskEntry {
    pub id: i32,
    pub path: String,
    pub args: Vec<String>,
    pub kw: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub background: bool,
}

impl TaskEntry {
    fn of(call: &Call) -> Self {
        Self {
            id: call.id(),
            path: call.path().to_string(),
            args: call.args().to_vec(),
            kw: call.kw().clone(),
            created_at: call.created_at(),
            background: call.is_background(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SystemBranch;

impl SystemBranch {
    pub fn new() -> Self {
        Self
    }

    fn layout(call: &Call) {
        let Some(root) = call.dispatcher() else {
            call.reject(RETCODE_ERROR, "tree is gone");
            return;
        };
        let layout: BTreeMap<String, Vec<String>> = root
            .layout()
            .into_iter()
            .map(|(branch, ops)| (format!("{}.{}", root.name(), branch), ops))
            .collect();
        call.resolve(layout);
    }

    fn list_user_tasks(call: &Call) {
        let tasks: Vec<TaskEntry> = match call.owner() {
            Some(user) => call
                .bank()
                .list_by_user(user)
                .map(|calls| calls.iter().map(|c| TaskEntry::of(c)).collect())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        call.resolve(tasks);
    }

    /// Run `op` against the call id in the first argument.
    fn with_target(call: &Call, failure_code: i32, op: impl FnOnce(&Call, i32) -> Result<(), CallError>) {
        let target = match call.arg(0) {
            None => {
                call.reject(RETCODE_ERROR, "missing call id");
                return;
            }
            Some(raw) => match raw.trim().parse::<i32>() {
                Ok(id) => id,
                Err(e) => {
                    call.reject(RETCODE_ERROR, format!("invalid call id {raw:?}: {e}"));
                    return;
                }
            },
        };
        match op(call, target) {
            Ok(()) => call.resolve(1),
            Err(e) => call.reject(failure_code, e),
        }
    }
}

impl Branch for SystemBranch {
    fn name(&self) -> &str {
        "$"
    }

    fn exported_names(&self) -> Vec<String> {
        OPERATIONS.iter().map(|s| s.to_string()).collect()
    }

    fn invoke(self: Arc<Self>, name: &str, call: Arc<Call>) -> Result<HandlerFuture, CallError> {
        let fut: HandlerFuture = match name {
            "Layout" => Box::pin(async move { Self::layout(&call) }),
            "ListUserTasks" => Box::pin(async move { Self::list_user_tasks(&call) }),
            "Hook" => Box::pin(async move { Self::with_target(&call, RETCODE_ERROR, Call::hook) }),
            "Unhook" => Box::pin(async move { Self::with_target(&call, RETCODE_ERROR, Call::unhook) }),
            "Kill" => Box::pin(async move { Self::with_target(&call, RETCODE_KILLED, Call::kill_peer) }),
            other => return Err(CallError::NotFound(other.to_string())),
        };
        Ok(fut)
    }
}
