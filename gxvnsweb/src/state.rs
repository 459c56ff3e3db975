//! Shared hub state and chat operations.
//!
//! `AppState` owns the persisted user registry, the map of logged-in
//! sessions, and the in-memory group table. Sessions enqueue frames for
//! each other through per-connection channels; the WebSocket writer task
//! on the other end drains the queue into the socket, so no lock is held
//! across a socket write.
//!
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use gxvnsproto::{Frame, hash_password, verify_password};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::store::{StoreError, UserRecord, UserStore};

/// Failure message shared by unknown-user and wrong-password logins.
const LOGIN_FAILED: &str = "Invalid username or password";

/// Keep-alive ping cadence for held sessions.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
/// A session silent for this long is assumed dead and closed.
const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(40);

/// Session endpoint for one logged-in WebSocket connection.
pub struct ConnectionHandle {
    /// Generation id; cleanup only removes the registry entry it owns
    pub id: u64,
    /// Outbound frame queue drained by the connection's writer task
    pub tx: mpsc::UnboundedSender<Message>,
    /// Cancelled to force-close the session (superseded login)
    pub cancel: CancellationToken,
}

/// Application state shared by every connection task.
pub struct AppState {
    users: RwLock<UserStore>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    groups: RwLock<HashMap<String, Vec<String>>>,
    /// Root token; cancelled when the process is asked to stop
    pub shutdown: CancellationToken,
    /// Keep-alive ping cadence for held sessions
    pub ping_interval: Duration,
    /// Sessions silent for this long are assumed dead and closed
    pub liveness_timeout: Duration,
    conn_seed: AtomicU64,
}

impl AppState {
    pub fn new(store: UserStore, shutdown: CancellationToken) -> Self {
        Self {
            users: RwLock::new(store),
            connections: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            shutdown,
            ping_interval: DEFAULT_PING_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            conn_seed: AtomicU64::new(1),
        }
    }

    /// Unique id for a new connection.
    pub fn next_connection_id(&self) -> u64 {
        self.conn_seed.fetch_add(1, Ordering::Relaxed)
    }

    /// Create an account. The session stays detached; `login` follows.
    pub async fn register(&self, username: &str, password: &str) -> Result<Frame, StoreError> {
        let mut users = self.users.write().await;
        if users.contains(username) {
            return Ok(Frame::RegisterResponse {
                success: false,
                message: Some("Username already exists".to_string()),
            });
        }
        users.insert(
            username.to_string(),
            UserRecord {
                password: hash_password(password),
                friends: Vec::new(),
            },
        );
        users.save()?;
        Ok(Frame::RegisterResponse {
            success: true,
            message: None,
        })
    }

    /// Authenticate and attach `handle` as the session for `username`.
    ///
    /// A previous session for the same user is cancelled; its own cleanup
    /// is generation-guarded so it cannot evict this replacement.
    pub async fn login(&self, username: &str, password: &str, handle: ConnectionHandle) -> Frame {
        let friends = {
            let users = self.users.read().await;
            match users.get(username) {
                Some(record) if verify_password(password, &record.password) => {
                    record.friends.clone()
                }
                _ => {
                    return Frame::LoginResponse {
                        success: false,
                        message: Some(LOGIN_FAILED.to_string()),
                        username: None,
                        friends: None,
                    };
                }
            }
        };

        let mut connections = self.connections.write().await;
        let new_id = handle.id;
        if let Some(old) = connections.insert(username.to_string(), handle) {
            // A repeat login on the same socket just refreshes the entry.
            if old.id != new_id {
                old.cancel.cancel();
            }
        }

        Frame::LoginResponse {
            success: true,
            message: None,
            username: Some(username.to_string()),
            friends: Some(friends),
        }
    }

    /// Detach `username` if `connection_id` still owns the registry entry.
    ///
    /// Returns true when the session was removed; the caller then fans out
    /// the `user_offline` event. A superseded session returns false here.
    pub async fn disconnect(&self, username: &str, connection_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(username) {
            Some(handle) if handle.id == connection_id => {
                connections.remove(username);
                true
            }
            _ => false,
        }
    }

    pub async fn is_online(&self, username: &str) -> bool {
        self.connections.read().await.contains_key(username)
    }

    /// Enqueue `frame` for every logged-in session except `exclude`.
    pub async fn broadcast(&self, frame: &Frame, exclude: Option<&str>) {
        let Some(msg) = encode(frame) else { return };
        let connections = self.connections.read().await;
        for (name, handle) in connections.iter() {
            if exclude == Some(name.as_str()) {
                continue;
            }
            deliver(name, handle, msg.clone(), frame.kind());
        }
    }

    /// Enqueue `frame` for `recipient`; silently dropped when offline.
    pub async fn send_to(&self, recipient: &str, frame: &Frame) {
        let Some(msg) = encode(frame) else { return };
        let connections = self.connections.read().await;
        if let Some(handle) = connections.get(recipient) {
            deliver(recipient, handle, msg, frame.kind());
        }
    }

    /// Enqueue `frame` for the connected members of `group` except
    /// `exclude`. An unknown group delivers to nobody.
    pub async fn group_broadcast(&self, group: &str, frame: &Frame, exclude: Option<&str>) {
        let members = {
            let groups = self.groups.read().await;
            groups.get(group).cloned().unwrap_or_default()
        };
        let Some(msg) = encode(frame) else { return };
        let connections = self.connections.read().await;
        for member in &members {
            if exclude == Some(member.as_str()) {
                continue;
            }
            if let Some(handle) = connections.get(member) {
                deliver(member, handle, msg.clone(), frame.kind());
            }
        }
    }

    /// Route a chat message: group first, then direct, then broadcast.
    ///
    /// Empty `group`/`to` strings count as absent, so a frame with
    /// `"group": ""` still falls through to the next rule.
    pub async fn route_message(&self, frame: Frame, sender: Option<&str>) {
        let (group, to) = match &frame {
            Frame::Message { group, to, .. } => (non_empty(group), non_empty(to)),
            _ => (None, None),
        };
        if let Some(group) = group {
            self.group_broadcast(&group, &frame, sender).await;
        } else if let Some(to) = to {
            self.send_to(&to, &frame).await;
        } else {
            self.broadcast(&frame, sender).await;
        }
    }

    /// Record a group and announce it to every connected member, creator
    /// included. `creator` is the sender's login name, if any.
    pub async fn create_group(
        &self,
        group_name: String,
        members: Vec<String>,
        creator: Option<String>,
    ) {
        {
            let mut groups = self.groups.write().await;
            groups.insert(group_name.clone(), members.clone());
        }
        let frame = Frame::GroupCreated {
            group_name,
            members: members.clone(),
            creator,
        };
        let Some(msg) = encode(&frame) else { return };
        let connections = self.connections.read().await;
        for member in &members {
            if let Some(handle) = connections.get(member) {
                deliver(member, handle, msg.clone(), frame.kind());
            }
        }
    }

    /// Link `friend` with the logged-in `requester`, both ways, then
    /// notify both ends. Skipped (with a log line) when the session never
    /// logged in or the friend does not exist.
    pub async fn add_friend(
        &self,
        requester: Option<&str>,
        friend: &str,
    ) -> Result<(), StoreError> {
        let Some(requester) = requester else {
            warn!("ignoring add_friend from a session that never logged in");
            return Ok(());
        };
        {
            let mut users = self.users.write().await;
            if !users.contains(friend) {
                debug!("ignoring add_friend for unknown user {friend}");
                return Ok(());
            }
            if let Some(friends) = users.friends_mut(requester) {
                friends.push(friend.to_string());
            }
            if let Some(friends) = users.friends_mut(friend) {
                friends.push(requester.to_string());
            }
            users.save()?;
        }
        self.send_to(
            requester,
            &Frame::FriendAdded {
                friend: friend.to_string(),
            },
        )
        .await;
        self.send_to(
            friend,
            &Frame::FriendRequest {
                from_user: requester.to_string(),
            },
        )
        .await;
        Ok(())
    }
}

/// Serialize a frame into a queued text message.
fn encode(frame: &Frame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            error!("failed to encode {} frame: {e}", frame.kind());
            None
        }
    }
}

/// Enqueue on a session channel; a closing session just drops the frame.
fn deliver(recipient: &str, handle: &ConnectionHandle, msg: Message, kind: &str) {
    if handle.tx.send(msg).is_err() {
        debug!("dropped {kind} frame for closing session {recipient}");
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}
