//! HTTP surface and per-connection WebSocket session loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use gxvnsproto::Frame;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::CONFIG;
use crate::state::{AppState, ConnectionHandle};
use crate::store::UserStore;

/// Run the hub with settings from [`CONFIG`] until a shutdown signal.
pub async fn run() -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], CONFIG.port));
    serve(addr, CONFIG.data_dir.clone(), CancellationToken::new()).await
}

/// Bind `addr` and serve until `shutdown` fires or a signal arrives.
pub async fn serve(
    addr: SocketAddr,
    data_dir: PathBuf,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let store = UserStore::open(&data_dir)
        .with_context(|| format!("failed to open user registry in {}", data_dir.display()))?;
    info!("loaded {} registered users", store.len());

    let state = Arc::new(AppState::new(store, shutdown.clone()));
    let app = router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("chat hub listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
        .context("server error")?;
    info!("server stopped");
    Ok(())
}

/// Build the hub router: health check at the root, chat WebSocket at
/// `/ws`, allow-all CORS over both.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(middleware::from_fn(cors_middleware))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "GxvnsChatApp server is running",
    }))
}

/// Reflect the caller's origin and answer preflights directly.
async fn cors_middleware(request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    if request.method() == Method::OPTIONS {
        return (
            StatusCode::NO_CONTENT,
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, origin),
                (
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("*"),
                ),
                (
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static("*"),
                ),
                (
                    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                ),
            ],
        )
            .into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    response
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one WebSocket connection: read frames, dispatch them, and tear
/// the session down when the peer goes away or the hub stops.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("new WebSocket connection established");

    let connection_id = state.next_connection_id();
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let (ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(write_loop(ws_sender, rx, state.ping_interval));

    let mut session = Session {
        state: state.clone(),
        connection_id,
        tx: tx.clone(),
        cancel: cancel.clone(),
        username: None,
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(Message::Close(None));
                break;
            }
            _ = state.shutdown.cancelled() => {
                let _ = tx.send(Message::Close(None));
                break;
            }
            incoming = tokio::time::timeout(state.liveness_timeout, ws_receiver.next()) => {
                match incoming {
                    Err(_) => {
                        info!("closing silent connection {connection_id}");
                        let _ = tx.send(Message::Close(None));
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        error!("WebSocket receive error: {e}");
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => session.dispatch(text.as_str()).await,
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    // Detach before dropping the queue handles so the writer can drain
    // and exit; the registry holds a sender clone while logged in.
    if let Some(username) = session.username.take() {
        if state.disconnect(&username, connection_id).await {
            state
                .broadcast(
                    &Frame::UserOffline {
                        username: username.clone(),
                    },
                    None,
                )
                .await;
        }
        info!("WebSocket disconnected for user: {username}");
    }
    drop(session);
    drop(tx);
    let _ = writer.await;
}

/// Drain the session queue into the socket, interleaving keep-alive
/// pings. Exits once the queue closes or a close frame goes out.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    ping_interval: Duration,
) {
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ping = tokio::time::interval_at(start, ping_interval);
    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(msg) = queued else { break };
                let closing = matches!(msg, Message::Close(_));
                if ws_sender.send(msg).await.is_err() || closing {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Per-connection context threaded through frame dispatch.
struct Session {
    state: Arc<AppState>,
    connection_id: u64,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    username: Option<String>,
}

impl Session {
    /// Reply on this connection only.
    fn send(&self, frame: &Frame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = self.tx.send(Message::Text(text.into()));
            }
            Err(e) => error!("failed to encode {} frame: {e}", frame.kind()),
        }
    }

    async fn dispatch(&mut self, text: &str) {
        info!("received message: {text}");
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                error!("invalid message frame: {e}");
                return;
            }
        };

        match frame {
            Frame::Register { username, password } => {
                match self.state.register(&username, &password).await {
                    Ok(resp) => self.send(&resp),
                    Err(e) => error!("error processing message: {e}"),
                }
            }
            Frame::Login { username, password } => {
                let handle = ConnectionHandle {
                    id: self.connection_id,
                    tx: self.tx.clone(),
                    cancel: self.cancel.clone(),
                };
                let resp = self.state.login(&username, &password, handle).await;
                let logged_in = matches!(resp, Frame::LoginResponse { success: true, .. });
                self.send(&resp);
                if logged_in {
                    self.username = Some(username.clone());
                    self.state
                        .broadcast(&Frame::UserOnline { username }, self.username.as_deref())
                        .await;
                }
            }
            frame @ Frame::Message { .. } => {
                self.state
                    .route_message(frame, self.username.as_deref())
                    .await;
            }
            Frame::CallRequest { to, extra } => {
                let frame = Frame::CallRequest {
                    to: to.clone(),
                    extra,
                };
                self.state.send_to(&to, &frame).await;
            }
            Frame::ScreenShare { to, extra } => {
                let frame = Frame::ScreenShare {
                    to: to.clone(),
                    extra,
                };
                self.state.send_to(&to, &frame).await;
            }
            Frame::CreateGroup {
                group_name,
                members,
            } => {
                self.state
                    .create_group(group_name, members, self.username.clone())
                    .await;
            }
            Frame::AddFriend { friend } => {
                if let Err(e) = self.state.add_friend(self.username.as_deref(), &friend).await {
                    error!("error processing message: {e}");
                }
            }
            Frame::Join { .. } => {}
            other => {
                debug!("ignoring unexpected {} frame", other.kind());
            }
        }
    }
}

/// Resolve on SIGTERM/SIGINT (ctrl-c elsewhere) or programmatic cancel;
/// either way the token ends up cancelled so every session closes.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = os_signal() => {}
        _ = shutdown.cancelled() => info!("shutdown requested, draining sessions"),
    }
    shutdown.cancel();
}

async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
    }
}
