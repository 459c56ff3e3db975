//! Wire frames for the GxvnsChat protocol.
//!
//! Every frame is a JSON object discriminated by a `"type"` field. The hub
//! forwards chat payloads verbatim, so the relayed variants (`message`,
//! `call_request`, `screen_share`) keep any fields they do not model in a
//! flattened map and reproduce them when re-serialized.
//!
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single protocol frame, client- or server-originated.
///
/// Variant names map to the wire `type` tag in snake_case, e.g.
/// `RegisterResponse` is `{"type": "register_response", ...}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Create an account. Never attaches the session; `login` still follows.
    Register { username: String, password: String },
    /// Reply to `register`.
    RegisterResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Authenticate and attach this session to `username`.
    Login { username: String, password: String },
    /// Reply to `login`. On success carries the username and friend list.
    LoginResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        friends: Option<Vec<String>>,
    },
    /// A chat message. Routed by `group`, then `to`, then broadcast.
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Call signalling, forwarded verbatim to `to`.
    CallRequest {
        to: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Screen-share signalling, forwarded verbatim to `to`.
    ScreenShare {
        to: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Declare a named group with a member list.
    CreateGroup {
        group_name: String,
        members: Vec<String>,
    },
    /// Sent to every connected member when a group is created.
    /// `creator` is null when the creating session never logged in.
    GroupCreated {
        group_name: String,
        members: Vec<String>,
        creator: Option<String>,
    },
    /// Link `friend` with the sender's account (mutual).
    AddFriend { friend: String },
    /// Confirmation to the requester of `add_friend`.
    FriendAdded { friend: String },
    /// Notification to the newly linked friend.
    FriendRequest {
        #[serde(rename = "from")]
        from_user: String,
    },
    /// Presence events for other logged-in users.
    UserOnline { username: String },
    UserOffline { username: String },
    /// Legacy hello from older clients; accepted and ignored by the hub.
    Join {
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    /// Server notice line; rendered by clients, currently never emitted.
    System { content: String },
}

impl Frame {
    /// Wire `type` tag for this frame, mainly for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::RegisterResponse { .. } => "register_response",
            Frame::Login { .. } => "login",
            Frame::LoginResponse { .. } => "login_response",
            Frame::Message { .. } => "message",
            Frame::CallRequest { .. } => "call_request",
            Frame::ScreenShare { .. } => "screen_share",
            Frame::CreateGroup { .. } => "create_group",
            Frame::GroupCreated { .. } => "group_created",
            Frame::AddFriend { .. } => "add_friend",
            Frame::FriendAdded { .. } => "friend_added",
            Frame::FriendRequest { .. } => "friend_request",
            Frame::UserOnline { .. } => "user_online",
            Frame::UserOffline { .. } => "user_offline",
            Frame::Join { .. } => "join",
            Frame::System { .. } => "system",
        }
    }
}
