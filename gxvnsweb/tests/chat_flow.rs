//! End-to-end chat flows over a live server socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gxvnsproto::Frame;
use gxvnsweb::{AppState, UserStore, router};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Serve `state` on an ephemeral port.
async fn spawn_state_hub(state: Arc<AppState>) -> SocketAddr {
    let app = router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Serve the router on an ephemeral port with a throwaway registry.
async fn spawn_hub() -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = UserStore::open(dir.path()).unwrap();
    let state = Arc::new(AppState::new(store, CancellationToken::new()));
    (spawn_state_hub(state).await, dir)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame, skipping transport pings and pongs.
async fn recv_frame(ws: &mut WsClient) -> Frame {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Read frames until one matches `want`, skipping presence chatter.
async fn recv_until(ws: &mut WsClient, mut want: impl FnMut(&Frame) -> bool) -> Frame {
    for _ in 0..10 {
        let frame = recv_frame(ws).await;
        if want(&frame) {
            return frame;
        }
    }
    panic!("expected frame never arrived");
}

/// Read until the server closes the connection.
async fn recv_close(ws: &mut WsClient) {
    loop {
        match timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Ok(Message::Close(_))) => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    }
}

/// Register (tolerating an existing account) and log in as `username`.
async fn login(addr: SocketAddr, username: &str) -> WsClient {
    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        json!({"type": "register", "username": username, "password": "pw"}),
    )
    .await;
    let frame = recv_frame(&mut ws).await;
    assert!(matches!(frame, Frame::RegisterResponse { .. }));

    send_json(
        &mut ws,
        json!({"type": "login", "username": username, "password": "pw"}),
    )
    .await;
    let frame = recv_frame(&mut ws).await;
    let Frame::LoginResponse { success: true, .. } = frame else {
        panic!("login failed: {frame:?}");
    };
    ws
}

#[tokio::test]
async fn health_endpoint_reports_running() {
    let (addr, _dir) = spawn_hub().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf);

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("GxvnsChatApp server is running"));
}

#[tokio::test]
async fn preflight_reflects_origin() {
    let (addr, _dir) = spawn_hub().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"OPTIONS / HTTP/1.1\r\nHost: localhost\r\nOrigin: http://example.test\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf).to_lowercase();

    assert!(response.starts_with("http/1.1 204"), "{response}");
    assert!(response.contains("access-control-allow-origin: http://example.test"));
    assert!(response.contains("access-control-allow-credentials: true"));
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let (addr, _dir) = spawn_hub().await;
    let mut alice = login(addr, "alice").await;
    let mut bob = login(addr, "bob").await;

    // Alice was online first, so she sees Bob arrive.
    let Frame::UserOnline { username } = recv_frame(&mut alice).await else {
        panic!("expected user_online");
    };
    assert_eq!(username, "bob");

    send_json(
        &mut bob,
        json!({"type": "message", "username": "bob", "content": "hello room", "mood": "amused"}),
    )
    .await;
    let Frame::Message {
        username,
        content,
        extra,
        ..
    } = recv_frame(&mut alice).await
    else {
        panic!("expected message");
    };
    assert_eq!(username.as_deref(), Some("bob"));
    assert_eq!(content, Some(Value::String("hello room".to_string())));
    assert_eq!(extra.get("mood"), Some(&Value::String("amused".to_string())));

    // Bob must not get his own broadcast back: the next frame he sees is
    // the direct message sent after it.
    send_json(
        &mut alice,
        json!({"type": "message", "username": "alice", "to": "bob", "content": "just you"}),
    )
    .await;
    let Frame::Message { content, .. } = recv_frame(&mut bob).await else {
        panic!("expected message");
    };
    assert_eq!(content, Some(Value::String("just you".to_string())));
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let (addr, _dir) = spawn_hub().await;
    let _alice = login(addr, "alice").await;

    let mut ws = connect(addr).await;
    for (user, pass) in [("alice", "wrong"), ("nobody", "pw")] {
        send_json(
            &mut ws,
            json!({"type": "login", "username": user, "password": pass}),
        )
        .await;
        let Frame::LoginResponse {
            success, message, ..
        } = recv_frame(&mut ws).await
        else {
            panic!("expected login_response");
        };
        assert!(!success);
        assert_eq!(message.as_deref(), Some("Invalid username or password"));
    }
}

#[tokio::test]
async fn duplicate_login_kicks_old_session() {
    let (addr, _dir) = spawn_hub().await;
    let mut first = login(addr, "alice").await;
    let mut second = login(addr, "alice").await;

    recv_close(&mut first).await;

    // The replacement session now owns the name: a direct message to
    // "alice" lands on it, with no stray presence frame ahead of it.
    send_json(
        &mut second,
        json!({"type": "message", "username": "alice", "to": "alice", "content": "mine"}),
    )
    .await;
    let Frame::Message { content, .. } = recv_frame(&mut second).await else {
        panic!("expected message");
    };
    assert_eq!(content, Some(Value::String("mine".to_string())));
}

#[tokio::test]
async fn friend_links_survive_relogin() {
    let (addr, _dir) = spawn_hub().await;
    let mut alice = login(addr, "alice").await;
    let mut bob = login(addr, "bob").await;

    send_json(&mut alice, json!({"type": "add_friend", "friend": "bob"})).await;

    let frame = recv_until(&mut alice, |f| matches!(f, Frame::FriendAdded { .. })).await;
    let Frame::FriendAdded { friend } = frame else {
        unreachable!()
    };
    assert_eq!(friend, "bob");

    let frame = recv_until(&mut bob, |f| matches!(f, Frame::FriendRequest { .. })).await;
    let Frame::FriendRequest { from_user } = frame else {
        unreachable!()
    };
    assert_eq!(from_user, "alice");

    // The link is persisted: a fresh login reports it.
    bob.close(None).await.unwrap();
    let mut bob = connect(addr).await;
    send_json(
        &mut bob,
        json!({"type": "login", "username": "bob", "password": "pw"}),
    )
    .await;
    let Frame::LoginResponse {
        success: true,
        friends: Some(friends),
        ..
    } = recv_frame(&mut bob).await
    else {
        panic!("expected successful login_response");
    };
    assert_eq!(friends, vec!["alice".to_string()]);
}

#[tokio::test]
async fn group_messages_reach_members_only() {
    let (addr, _dir) = spawn_hub().await;
    let mut alice = login(addr, "alice").await;
    let mut bob = login(addr, "bob").await;
    let mut carol = login(addr, "carol").await;

    send_json(
        &mut alice,
        json!({"type": "create_group", "group_name": "ops", "members": ["alice", "bob"]}),
    )
    .await;
    for ws in [&mut alice, &mut bob] {
        let frame = recv_until(ws, |f| matches!(f, Frame::GroupCreated { .. })).await;
        let Frame::GroupCreated {
            group_name,
            creator,
            ..
        } = frame
        else {
            unreachable!()
        };
        assert_eq!(group_name, "ops");
        assert_eq!(creator.as_deref(), Some("alice"));
    }

    send_json(
        &mut alice,
        json!({"type": "message", "username": "alice", "group": "ops", "content": "standup"}),
    )
    .await;
    let frame = recv_until(&mut bob, |f| matches!(f, Frame::Message { .. })).await;
    let Frame::Message { group, content, .. } = frame else {
        unreachable!()
    };
    assert_eq!(group.as_deref(), Some("ops"));
    assert_eq!(content, Some(Value::String("standup".to_string())));

    // Carol is outside the group; the first message she sees is the
    // direct one sent afterwards.
    send_json(
        &mut alice,
        json!({"type": "message", "username": "alice", "to": "carol", "content": "psst"}),
    )
    .await;
    let frame = recv_until(&mut carol, |f| matches!(f, Frame::Message { .. })).await;
    let Frame::Message { content, .. } = frame else {
        unreachable!()
    };
    assert_eq!(content, Some(Value::String("psst".to_string())));
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_session() {
    let (addr, _dir) = spawn_hub().await;
    let mut alice = login(addr, "alice").await;
    let mut bob = login(addr, "bob").await;

    for garbage in [
        "this is not json",
        r#"{"type":"teleport","to":"mars"}"#,
        r#"{"type":"message","content":"hi","group":7}"#,
    ] {
        alice
            .send(Message::Text(garbage.to_string()))
            .await
            .unwrap();
    }

    // The session shrugs the garbage off and still routes chat.
    send_json(
        &mut alice,
        json!({"type": "message", "username": "alice", "content": "still here"}),
    )
    .await;
    let frame = recv_until(&mut bob, |f| matches!(f, Frame::Message { .. })).await;
    let Frame::Message { content, .. } = frame else {
        unreachable!()
    };
    assert_eq!(content, Some(Value::String("still here".to_string())));
}

#[tokio::test]
async fn server_pings_idle_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = UserStore::open(dir.path()).unwrap();
    let mut state = AppState::new(store, CancellationToken::new());
    state.ping_interval = Duration::from_millis(100);
    let addr = spawn_state_hub(Arc::new(state)).await;

    let mut ws = connect(addr).await;
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_))) => break,
                Some(Ok(_)) => continue,
                other => panic!("connection ended before a ping: {other:?}"),
            }
        }
    })
    .await
    .expect("no keep-alive ping arrived");
}

#[tokio::test]
async fn silent_sessions_are_closed() {
    let dir = tempfile::tempdir().unwrap();
    let store = UserStore::open(dir.path()).unwrap();
    let mut state = AppState::new(store, CancellationToken::new());
    // No pings inside the window, so a quiet peer trips the cutoff.
    state.ping_interval = Duration::from_secs(60);
    state.liveness_timeout = Duration::from_millis(300);
    let addr = spawn_state_hub(Arc::new(state)).await;

    let mut ws = connect(addr).await;
    recv_close(&mut ws).await;
}

#[tokio::test]
async fn disconnect_broadcasts_user_offline() {
    let (addr, _dir) = spawn_hub().await;
    let mut alice = login(addr, "alice").await;
    let mut bob = login(addr, "bob").await;

    bob.close(None).await.unwrap();

    let frame = recv_until(&mut alice, |f| matches!(f, Frame::UserOffline { .. })).await;
    let Frame::UserOffline { username } = frame else {
        unreachable!()
    };
    assert_eq!(username, "bob");
}

#[tokio::test]
async fn join_is_ignored_and_anonymous_broadcasts_deliver() {
    let (addr, _dir) = spawn_hub().await;
    let mut alice = login(addr, "alice").await;
    let mut anon = connect(addr).await;

    send_json(&mut anon, json!({"type": "join", "username": "ghost"})).await;
    send_json(
        &mut anon,
        json!({"type": "message", "username": "ghost", "content": "anyone there?"}),
    )
    .await;

    let frame = recv_until(&mut alice, |f| matches!(f, Frame::Message { .. })).await;
    let Frame::Message {
        username, content, ..
    } = frame
    else {
        unreachable!()
    };
    assert_eq!(username.as_deref(), Some("ghost"));
    assert_eq!(content, Some(Value::String("anyone there?".to_string())));

    // Traffic only flows back to logged-in sessions.
    send_json(
        &mut alice,
        json!({"type": "message", "username": "alice", "content": "hello ghost"}),
    )
    .await;
    assert!(
        timeout(Duration::from_millis(300), anon.next()).await.is_err(),
        "anonymous session must not receive broadcasts"
    );
}

#[tokio::test]
async fn call_request_is_relayed_verbatim() {
    let (addr, _dir) = spawn_hub().await;
    let mut alice = login(addr, "alice").await;
    let mut bob = login(addr, "bob").await;

    send_json(
        &mut alice,
        json!({
            "type": "call_request",
            "to": "bob",
            "username": "alice",
            "offer": {"sdp": "v=0", "kind": "offer"},
        }),
    )
    .await;

    let frame = recv_until(&mut bob, |f| matches!(f, Frame::CallRequest { .. })).await;
    let Frame::CallRequest { to, extra } = frame else {
        unreachable!()
    };
    assert_eq!(to, "bob");
    assert_eq!(
        extra.get("username"),
        Some(&Value::String("alice".to_string()))
    );
    assert_eq!(extra.get("offer").and_then(|o| o.get("sdp")), Some(&json!("v=0")));
}

#[tokio::test]
async fn shutdown_closes_active_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = scratch.local_addr().unwrap();
    drop(scratch);

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(gxvnsweb::serve(
        addr,
        dir.path().to_path_buf(),
        shutdown.clone(),
    ));

    let mut ws = None;
    for _ in 0..50 {
        match connect_async(format!("ws://{addr}/ws")).await {
            Ok((stream, _)) => {
                ws = Some(stream);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let mut ws = ws.expect("server never came up");

    send_json(
        &mut ws,
        json!({"type": "register", "username": "alice", "password": "pw"}),
    )
    .await;
    let _ = recv_frame(&mut ws).await;
    send_json(
        &mut ws,
        json!({"type": "login", "username": "alice", "password": "pw"}),
    )
    .await;
    let _ = recv_frame(&mut ws).await;

    shutdown.cancel();
    recv_close(&mut ws).await;
    let result = timeout(WAIT, task).await.expect("server did not stop").unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn bind_conflict_fails_fast() {
    let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = holder.local_addr().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let result = gxvnsweb::serve(addr, dir.path().to_path_buf(), CancellationToken::new()).await;

    let err = match result {
        Ok(()) => panic!("bind on an occupied port must fail"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("failed to bind"));
}
