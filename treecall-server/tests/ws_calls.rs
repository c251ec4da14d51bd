//! End-to-end tests over a real WebSocket.
//!
//! Each test starts an in-process server on 127.0.0.1:0 and talks to it
//! with tokio-tungstenite, the way a client would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use treecall_server::call::{Call, CallReturn, Scope};
use treecall_server::config::ServerConfig;
use treecall_server::server::{Server, SharedState};
use treecall_server::tree::FnBranch;

const TIMEOUT_MS: u64 = 5000;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_branch() -> Arc<FnBranch> {
    Arc::new(
        FnBranch::new("$test")
            .export("Steps", |call: Arc<Call>| async move {
                call.notify("step1");
                call.resolve("done");
            })
            .export("Wait", |call: Arc<Call>| async move {
                call.on_kill(|| {});
            }),
    )
}

async fn start_server() -> (SocketAddr, Arc<SharedState>) {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        exec_allow: vec!["echo".to_string(), "sh".to_string()],
        ..Default::default()
    };
    let (addr, state, _handle) = Server::new(config)
        .add_branch(test_branch())
        .start()
        .await
        .unwrap();
    (addr, state)
}

async fn connect(addr: SocketAddr, user: Option<&str>) -> Ws {
    let url = match user {
        Some(user) => format!("ws://{addr}/tree?user={user}"),
        None => format!("ws://{addr}/tree"),
    };
    let (ws, _resp) = tokio_tungstenite::connect_async(url).await.expect("handshake ok");
    ws
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> CallReturn {
    loop {
        let msg = timeout(Duration::from_millis(TIMEOUT_MS), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("result frame");
        }
    }
}

async fn wait_live(state: &SharedState, user: &str, id: i32) {
    let start = tokio::time::Instant::now();
    while !state.dispatcher.bank().contains(&Scope::user(user), id) {
        assert!(start.elapsed() < Duration::from_millis(TIMEOUT_MS), "call {id} never became live");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn notify_then_resolve_over_websocket() {
    let (addr, _state) = start_server().await;
    let mut ws = connect(addr, Some("alice")).await;

    send(&mut ws, json!({"id": 42, "name": "Tree.$test.Steps"})).await;
    let progress = recv(&mut ws).await;
    assert_eq!((progress.id, progress.retcode), (42, -1));
    assert_eq!(progress.stdout, Some(json!("step1")));
    let done = recv(&mut ws).await;
    assert_eq!((done.id, done.retcode), (42, 0));
    assert_eq!(done.stdout, Some(json!("done")));
    assert_eq!(done.stderr, None);
}

#[tokio::test]
async fn routing_failures() {
    let (addr, state) = start_server().await;
    let mut ws = connect(addr, None).await;

    // garbage is dropped without a reply
    ws.send(Message::Text("not json".into())).await.unwrap();

    send(&mut ws, json!({"id": 1, "name": "Other.$.Layout"})).await;
    let foreign = recv(&mut ws).await;
    assert_eq!((foreign.id, foreign.retcode), (1, -404));
    assert_eq!(foreign.stderr.as_deref(), Some("Other.$.Layout not found"));

    send(&mut ws, json!({"id": 2, "name": "Tree.unknown.Op"})).await;
    let unknown = recv(&mut ws).await;
    assert_eq!((unknown.id, unknown.retcode), (2, 1));
    assert!(state.dispatcher.bank().is_empty());
}

#[tokio::test]
async fn kill_frames() {
    let (addr, state) = start_server().await;
    let mut ws = connect(addr, Some("alice")).await;

    send(&mut ws, json!({"id": 3, "name": "Tree.$test.Wait"})).await;
    wait_live(&state, "alice", 3).await;

    send(&mut ws, json!({"id": 4, "name": "3", "kill": true})).await;
    let killed = recv(&mut ws).await;
    assert_eq!((killed.id, killed.retcode), (3, 500));
    assert_eq!(killed.stderr.as_deref(), Some("job killed"));
    let ack = recv(&mut ws).await;
    assert_eq!((ack.id, ack.retcode), (4, 0));
    assert_eq!(ack.stdout, Some(json!("job killing completed")));

    send(&mut ws, json!({"id": 5, "name": "3", "kill": true})).await;
    let gone = recv(&mut ws).await;
    assert_eq!((gone.id, gone.retcode), (5, 500));

    send(&mut ws, json!({"id": 6, "name": "three", "kill": true})).await;
    assert_eq!(recv(&mut ws).await.retcode, 400);
}

#[tokio::test]
async fn closing_socket_kills_foreground_calls() {
    let (addr, state) = start_server().await;
    let mut ws = connect(addr, Some("alice")).await;
    send(&mut ws, json!({"id": 9, "name": "Tree.$test.Wait"})).await;
    wait_live(&state, "alice", 9).await;

    ws.close(None).await.unwrap();
    let start = tokio::time::Instant::now();
    while state.dispatcher.bank().contains(&Scope::user("alice"), 9) {
        assert!(start.elapsed() < Duration::from_millis(TIMEOUT_MS), "call 9 outlived its connection");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn background_call_outlives_its_connection() {
    let (addr, state) = start_server().await;

    let mut first = connect(addr, Some("alice")).await;
    send(
        &mut first,
        json!({"id": 7, "name": "Tree.$exec.BackgroundCommand", "args": ["sh", "-c", "sleep 30"]}),
    )
    .await;
    wait_live(&state, "alice", 7).await;
    first.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.dispatcher.bank().contains(&Scope::user("alice"), 7));

    let mut second = connect(addr, Some("alice")).await;
    send(&mut second, json!({"id": 1, "name": "Tree.$.ListUserTasks"})).await;
    let listed = recv(&mut second).await;
    let tasks = listed.stdout.unwrap();
    assert_eq!(tasks.as_array().map(Vec::len), Some(1));
    assert_eq!(tasks[0]["id"], 7);
    assert_eq!(tasks[0]["background"], true);

    send(&mut second, json!({"id": 2, "name": "Tree.$.Hook", "args": ["7"]})).await;
    assert_eq!(recv(&mut second).await.stdout, Some(json!(1)));

    send(&mut second, json!({"id": 3, "name": "Tree.$.Kill", "args": ["7"]})).await;
    let killed = recv(&mut second).await;
    assert_eq!((killed.id, killed.retcode), (7, 500));
    let ack = recv(&mut second).await;
    assert_eq!((ack.id, ack.retcode), (3, 0));
    assert!(state.dispatcher.bank().is_empty());
}

#[tokio::test]
async fn other_users_tasks_are_not_listed() {
    let (addr, state) = start_server().await;
    let mut alice = connect(addr, Some("alice")).await;
    send(&mut alice, json!({"id": 1, "name": "Tree.$test.Wait"})).await;
    wait_live(&state, "alice", 1).await;

    let mut bob = connect(addr, Some("bob")).await;
    send(&mut bob, json!({"id": 1, "name": "Tree.$.ListUserTasks"})).await;
    assert_eq!(recv(&mut bob).await.stdout, Some(json!([])));

    let mut anon = connect(addr, None).await;
    send(&mut anon, json!({"id": 1, "name": "Tree.$.ListUserTasks"})).await;
    assert_eq!(recv(&mut anon).await.stdout, Some(json!([])));
}

#[tokio::test]
async fn chat_broadcast_between_sockets() {
    let (addr, _state) = start_server().await;
    let mut alice = connect(addr, Some("alice")).await;
    let mut bob = connect(addr, Some("bob")).await;

    send(&mut alice, json!({"id": 1, "name": "Tree.$chat.Join", "args": ["lobby", "alice"]})).await;
    let list = recv(&mut alice).await;
    assert_eq!(list.stdout.unwrap()["Kind"], "List");

    send(&mut bob, json!({"id": 10, "name": "Tree.$chat.Join", "args": ["lobby", "bob"]})).await;
    let list = recv(&mut bob).await;
    assert_eq!(list.stdout.unwrap()["Payload"], json!(["alice", "bob"]));
    let joined = recv(&mut alice).await;
    assert_eq!(joined.id, 1);
    assert_eq!(joined.stdout.unwrap(), json!({"Kind": "Join", "Payload": "bob", "From": "bob"}));

    send(&mut alice, json!({"id": 2, "name": "Tree.$chat.Talk", "args": ["lobby", "hello"]})).await;
    let heard = recv(&mut bob).await;
    assert_eq!((heard.id, heard.retcode), (10, -1));
    assert_eq!(heard.stdout.unwrap(), json!({"Kind": "Talk", "Payload": "hello", "From": "alice"}));
    assert_eq!(recv(&mut alice).await.id, 2);

    bob.close(None).await.unwrap();
    let exited = recv(&mut alice).await;
    assert_eq!(exited.stdout.unwrap()["Kind"], "Exit");
}

#[tokio::test]
async fn layout_and_health() {
    let (addr, _state) = start_server().await;
    let mut ws = connect(addr, None).await;
    send(&mut ws, json!({"id": 1, "name": "Tree.$.Layout"})).await;
    let layout = recv(&mut ws).await.stdout.unwrap();
    assert_eq!(layout["Tree.$exec"], json!(["BackgroundCommand", "Command"]));
    assert_eq!(layout["Tree.$chat"], json!(["Exit", "Join", "Talk"]));
    assert_eq!(layout["Tree.$test"], json!(["Steps", "Wait"]));

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"status": "ok", "live_calls": 0}));
}

#[tokio::test]
async fn same_call_id_on_two_sockets() {
    let (addr, state) = start_server().await;
    let mut alice = connect(addr, Some("alice")).await;
    let mut bob = connect(addr, Some("bob")).await;
    send(&mut alice, json!({"id": 1, "name": "Tree.$test.Wait"})).await;
    send(&mut bob, json!({"id": 1, "name": "Tree.$test.Wait"})).await;
    wait_live(&state, "alice", 1).await;
    wait_live(&state, "bob", 1).await;

    send(&mut alice, json!({"id": 2, "name": "1", "kill": true})).await;
    assert_eq!(recv(&mut alice).await.retcode, 500);
    assert_eq!(recv(&mut alice).await.id, 2);
    assert!(state.dispatcher.bank().contains(&Scope::user("bob"), 1));

    // a second socket of the same user cannot take over a live id
    let mut again = connect(addr, Some("bob")).await;
    send(&mut again, json!({"id": 1, "name": "Tree.$test.Wait"})).await;
    let refused = recv(&mut again).await;
    assert_eq!((refused.id, refused.retcode), (1, 304));
    assert_eq!(refused.stderr.as_deref(), Some("call id 1 is already in use"));
    assert_eq!(state.dispatcher.bank().len(), 1);
}
