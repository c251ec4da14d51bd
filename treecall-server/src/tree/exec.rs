//! The `$exec` branch: run allow-listed programs.
//!
//! `Command` runs a program to completion and resolves with its stdout.
//! `BackgroundCommand` detaches from the caller's connection and streams
//! stdout as progress notifications until the program exits. Both are
//! killable by id; killing one kills its child process.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;

use super::{Branch, HandlerFuture};
use crate::call::{Call, RETCODE_ERROR};
use crate::config::ServerConfig;
use crate::error::CallError;

pub struct ExecBranch {
    allow: Vec<String>,
    chunk_bytes: usize,
}

impl ExecBranch {
    pub fn new(allow: Vec<String>, chunk_bytes: usize) -> Self {
        Self {
            allow,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.exec_allow.clone(), config.exec_chunk_bytes)
    }

    /// Build the command named by the call's arguments, or reject the call.
    fn command(&self, call: &Call) -> Option<Command> {
        let Some(program) = call.arg(0) else {
            call.reject(RETCODE_ERROR, "missing command name");
            return None;
        };
        if !self.allow.iter().any(|allowed| allowed == program) {
            tracing::warn!(call_id = call.id(), program, "command not allowed");
            call.reject(RETCODE_ERROR, format!("command {program:?} is not allowed"));
            return None;
        }
        let mut cmd = Command::new(program);
        cmd.args(&call.args()[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Some(cmd)
    }

    async fn run(self: Arc<Self>, call: Arc<Call>) {
        let Some(mut cmd) = self.command(&call) else {
            return;
        };
        let Some(kill_rx) = kill_signal(&call) else {
            return;
        };
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                call.reject(RETCODE_ERROR, format!("spawn failed: {e}"));
                return;
            }
        };
        tracing::debug!(call_id = call.id(), pid = ?child.id(), "command started");

        tokio::select! {
            output = child.wait_with_output() => match output {
                Ok(out) if out.status.success() => {
                    call.resolve(String::from_utf8_lossy(&out.stdout).into_owned());
                }
                Ok(out) => {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    let reason = if stderr.trim().is_empty() {
                        out.status.to_string()
                    } else {
                        stderr.trim().to_string()
                    };
                    call.reject(RETCODE_ERROR, reason);
                }
                Err(e) => call.reject(RETCODE_ERROR, e),
            },
            // dropping the output future kills the child
            _ = kill_rx => tracing::debug!(call_id = call.id(), "command killed"),
        }
    }

    async fn run_background(self: Arc<Self>, call: Arc<Call>) {
        let Some(mut cmd) = self.command(&call) else {
            return;
        };
        call.set_background(true);
        let Some(kill_rx) = kill_signal(&call) else {
            return;
        };
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                call.reject(RETCODE_ERROR, format!("spawn failed: {e}"));
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            call.reject(RETCODE_ERROR, "no stdout");
            return;
        };
        tracing::info!(call_id = call.id(), pid = ?child.id(), path = %call.path(), "background command started");

        let finished = tokio::select! {
            res = async {
                pump_output(&call, stdout, self.chunk_bytes).await?;
                child.wait().await
            } => Some(res),
            _ = kill_rx => None,
        };
        match finished {
            Some(Ok(status)) => {
                tracing::info!(call_id = call.id(), %status, "background command exited");
                call.resolve(1);
            }
            Some(Err(e)) => call.reject(RETCODE_ERROR, e),
            None => {
                tracing::info!(call_id = call.id(), "background command killed");
                if let Err(e) = child.start_kill() {
                    tracing::debug!(call_id = call.id(), "kill failed: {e}");
                }
            }
        }
    }
}

/// Register a kill listener on `call` and return the receiving end, or
/// `None` if the call ended before anything was started.
fn kill_signal(call: &Call) -> Option<oneshot::Receiver<()>> {
    let (tx, rx) = oneshot::channel();
    let live = call.on_kill(move || {
        let _ = tx.send(());
    });
    if !live {
        tracing::debug!(call_id = call.id(), "call ended before the command started");
    }
    live.then_some(rx)
}

/// Forward stdout as notifications of at least `chunk` bytes; whatever is
/// left at EOF goes out as one final notification.
async fn pump_output(call: &Call, mut stdout: ChildStdout, chunk: usize) -> std::io::Result<()> {
    let mut buf = [0u8; 4096];
    let mut pending = Vec::with_capacity(chunk);
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        if pending.len() >= chunk {
            call.notify(String::from_utf8_lossy(&pending).into_owned());
            pending.clear();
        }
    }
    if !pending.is_empty() {
        call.notify(String::from_utf8_lossy(&pending).into_owned());
    }
    Ok(())
}

impl Branch for ExecBranch {
    fn name(&self) -> &str {
        "$exec"
    }

    fn exported_names(&self) -> Vec<String> {
        vec!["BackgroundCommand".to_string(), "Command".to_string()]
    }

    fn invoke(self: Arc<Self>, name: &str, call: Arc<Call>) -> Result<HandlerFuture, CallError> {
        match name {
            "Command" => Ok(Box::pin(self.run(call))),
            "BackgroundCommand" => Ok(Box::pin(self.run_background(call))),
            other => Err(CallError::NotFound(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallRequest, CallReturn, CallStatus, Scope};
    use crate::connection::{Conn, LocalConnection, Outbound, User};
    use crate::tree::Dispatcher;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn tree(chunk: usize) -> Arc<Dispatcher> {
        let mut root = Dispatcher::new("Tree");
        root.add_branch(Arc::new(ExecBranch::new(
            vec!["echo".into(), "sh".into(), "no-such-program-here".into()],
            chunk,
        )));
        root.ready().await
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> CallReturn {
        let out = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        out.as_result().cloned().expect("expected a result")
    }

    fn run(root: &Arc<Dispatcher>, conn: &Arc<LocalConnection>, id: i32, path: &str, args: &[&str]) -> Arc<Call> {
        let conn: Conn = conn.clone();
        root.dispatch(CallRequest::new(id, path).with_args(args.iter().copied()), conn)
    }

    #[tokio::test]
    async fn command_resolves_stdout() {
        let root = tree(1024).await;
        let (conn, mut rx) = LocalConnection::new("s", None);
        run(&root, &conn, 1, "Tree.$exec.Command", &["echo", "hello"]);
        let ret = next(&mut rx).await;
        assert_eq!(ret.retcode, 0);
        assert_eq!(ret.stdout, Some(serde_json::json!("hello\n")));
        assert!(root.bank().is_empty());
    }

    #[tokio::test]
    async fn command_outside_allow_list() {
        let root = tree(1024).await;
        let (conn, mut rx) = LocalConnection::new("s", None);
        run(&root, &conn, 1, "Tree.$exec.Command", &["rm", "-rf", "/tmp/x"]);
        let ret = next(&mut rx).await;
        assert_eq!(ret.retcode, 304);
        assert_eq!(ret.stderr.as_deref(), Some("command \"rm\" is not allowed"));

        run(&root, &conn, 2, "Tree.$exec.Command", &[]);
        assert_eq!(next(&mut rx).await.stderr.as_deref(), Some("missing command name"));

        run(&root, &conn, 3, "Tree.$exec.Command", &["no-such-program-here"]);
        let ret = next(&mut rx).await;
        assert_eq!(ret.retcode, 304);
        assert!(ret.stderr.unwrap().starts_with("spawn failed"));
    }

    #[tokio::test]
    async fn failing_command_rejects_with_stderr() {
        let root = tree(1024).await;
        let (conn, mut rx) = LocalConnection::new("s", None);
        run(&root, &conn, 1, "Tree.$exec.Command", &["sh", "-c", "echo broken >&2; exit 3"]);
        let ret = next(&mut rx).await;
        assert_eq!((ret.retcode, ret.stderr.as_deref()), (304, Some("broken")));
    }

    #[tokio::test]
    async fn background_command_streams_then_resolves() {
        let root = tree(1).await;
        let (conn, mut rx) = LocalConnection::new("s", Some(User::new("alice")));
        let call = run(&root, &conn, 5, "Tree.$exec.BackgroundCommand", &["sh", "-c", "echo a; echo b"]);

        let mut output = String::new();
        let last = loop {
            let ret = next(&mut rx).await;
            if ret.is_terminal() {
                break ret;
            }
            assert_eq!(ret.retcode, -2);
            output.push_str(ret.stdout.as_ref().and_then(|v| v.as_str()).unwrap_or_default());
        };
        assert_eq!(output, "a\nb\n");
        assert_eq!((last.retcode, last.stdout), (0, Some(serde_json::json!(1))));
        assert!(call.is_background());
        assert!(!root.bank().contains(&Scope::user("alice"), 5));
    }

    #[tokio::test]
    async fn killing_background_command_stops_it() {
        let root = tree(1024).await;
        let (conn, mut rx) = LocalConnection::new("s", Some(User::new("alice")));
        let call = run(&root, &conn, 6, "Tree.$exec.BackgroundCommand", &["sh", "-c", "sleep 30"]);
        for _ in 0..200 {
            if root.bank().contains(&Scope::user("alice"), 6) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // closing the caller does not touch a background call
        conn.close();
        assert_eq!(call.status(), CallStatus::Running);
        assert_eq!(root.bank().list_by_user("alice").unwrap().len(), 1);

        let (killer, _krx) = LocalConnection::new("k", Some(User::new("alice")));
        let killer: Conn = killer;
        root.kill_by_id(&killer, 6).unwrap();
        assert_eq!(call.status(), CallStatus::Killed);
        assert!(root.bank().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn command_on_a_closed_connection_never_starts() {
        let root = tree(1024).await;
        let (conn, _rx) = LocalConnection::new("s", Some(User::new("alice")));
        conn.close();
        let marker = std::env::temp_dir().join(format!("treecall-exec-{}", std::process::id()));
        let script = format!("touch {}", marker.display());
        let fg = run(&root, &conn, 1, "Tree.$exec.Command", &["sh", "-c", &script]);
        let bg = run(&root, &conn, 2, "Tree.$exec.BackgroundCommand", &["sh", "-c", &script]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fg.status(), CallStatus::Killed);
        assert_eq!(bg.status(), CallStatus::Killed);
        assert!(!marker.exists());
        assert!(root.bank().is_empty());
    }
}
