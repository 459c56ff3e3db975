//! One WebSocket chat session: connect, authenticate, pump messages.

use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use gxvnsproto::Frame;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{self, Message, protocol::WebSocketConfig},
};

pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Matches the hub's keep-alive cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_MESSAGE_BYTES: usize = 10_000_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        source: tungstenite::Error,
    },
    #[error("session error: {0}")]
    Session(#[from] tungstenite::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server closed the connection during login")]
    Closed,
    #[error("login rejected: {0}")]
    Login(String),
}

/// How a finished session ended.
pub enum SessionEnd {
    /// The user asked to leave; do not reconnect.
    Quit,
    /// The server went away; reconnect.
    Dropped,
}

/// Doubling backoff, capped.
pub fn next_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RECONNECT_DELAY)
}

/// Connect to `url`, sign in, then bridge stdin lines out and chat
/// frames in until the user quits or the connection drops.
pub async fn run(
    username: &str,
    password: &str,
    url: &str,
    input: &mut mpsc::UnboundedReceiver<String>,
) -> Result<SessionEnd, ChatError> {
    let (ws, _) = connect_async_with_config(url, Some(session_config()), false)
        .await
        .map_err(|source| ChatError::Connect {
            url: url.to_string(),
            source,
        })?;
    let (mut sink, mut stream) = ws.split();

    // Create the account if it does not exist yet; a taken name is fine,
    // login decides whether the password matches.
    send_frame(
        &mut sink,
        &Frame::Register {
            username: username.to_string(),
            password: password.to_string(),
        },
    )
    .await?;
    loop {
        match next_frame(&mut stream).await? {
            Some(Frame::RegisterResponse { .. }) => break,
            Some(_) => continue,
            None => return Err(ChatError::Closed),
        }
    }

    send_frame(
        &mut sink,
        &Frame::Login {
            username: username.to_string(),
            password: password.to_string(),
        },
    )
    .await?;
    let friends = loop {
        match next_frame(&mut stream).await? {
            Some(Frame::LoginResponse {
                success: true,
                friends,
                ..
            }) => break friends.unwrap_or_default(),
            Some(Frame::LoginResponse { message, .. }) => {
                return Err(ChatError::Login(
                    message.unwrap_or_else(|| "login failed".to_string()),
                ));
            }
            Some(_) => continue,
            None => return Err(ChatError::Closed),
        }
    };

    println!("✅ Logged in as {username}");
    if !friends.is_empty() {
        println!("👥 Friends: {}", friends.join(", "));
    }

    let mut ping = interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            line = input.recv() => {
                let Some(line) = line else {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Quit);
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Quit);
                }
                send_frame(&mut sink, &outgoing_message(username, line)).await?;
            }
            incoming = stream.next() => {
                match incoming {
                    None => return Ok(SessionEnd::Dropped),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                            if let Some(line) = render_frame(&frame) {
                                println!("{line}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Dropped),
                    Some(Ok(_)) => {}
                }
            }
            _ = ping.tick() => {
                sink.send(Message::Ping(Vec::new())).await?;
            }
        }
    }
}

/// Socket options for a chat session; inbound frames are capped at the
/// service's 10 MB message limit.
fn session_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_BYTES);
    config
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), ChatError> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Next parsed frame; unparseable text and transport pings are skipped.
/// `Ok(None)` means the server closed the stream.
async fn next_frame(stream: &mut WsSource) -> Result<Option<Frame>, ChatError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => {
                if let Ok(frame) = serde_json::from_str(&text) {
                    return Ok(Some(frame));
                }
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

fn outgoing_message(username: &str, content: &str) -> Frame {
    Frame::Message {
        username: Some(username.to_string()),
        content: Some(Value::String(content.to_string())),
        timestamp: Some(now_timestamp()),
        to: None,
        group: None,
        extra: Map::new(),
    }
}

/// Local time in ISO-8601 shape with microseconds.
fn now_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// One printable line for an incoming frame, or `None` for frames the
/// terminal does not surface.
fn render_frame(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Message {
            username: Some(username),
            content: Some(content),
            timestamp,
            ..
        } => {
            let text = render_content(content);
            Some(match timestamp.as_deref().and_then(clock_time) {
                Some(clock) => format!("[{clock}] {username}: {text}"),
                None => format!("{username}: {text}"),
            })
        }
        Frame::System { content } => Some(format!("System: {content}")),
        Frame::UserOnline { username } => Some(format!("🟢 {username} is online")),
        Frame::UserOffline { username } => Some(format!("🔴 {username} went offline")),
        Frame::FriendRequest { from_user } => {
            Some(format!("🤝 {from_user} added you as a friend"))
        }
        Frame::FriendAdded { friend } => Some(format!("🤝 {friend} is now your friend")),
        Frame::GroupCreated {
            group_name,
            members,
            ..
        } => Some(format!(
            "👥 Group {group_name} created with {}",
            members.join(", ")
        )),
        _ => None,
    }
}

fn render_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Extract `HH:MM:SS` from an ISO-8601 timestamp.
fn clock_time(timestamp: &str) -> Option<String> {
    let parsed = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Some(parsed.format("%H:%M:%S").to_string())
}
