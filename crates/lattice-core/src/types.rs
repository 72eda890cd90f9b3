use serde::{Deserialize, Serialize};

use crate::{
    error::ClientError,
    event::{JoinState, RoomEvent},
    room::RoomChange,
};

/// Coarse connection status reported to observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No session token is held and no sync is running.
    #[default]
    Disconnected,
    /// A login job is in flight.
    Connecting,
    /// A session token is held and the sync loop is running.
    Connected,
}

/// Matrix message type used when sending room messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MessageType {
    /// Standard text message (`m.text`).
    #[default]
    Text,
    /// Notice message (`m.notice`), usually non-intrusive/system-like.
    Notice,
    /// Emote message (`m.emote`).
    Emote,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "m.text",
            Self::Notice => "m.notice",
            Self::Emote => "m.emote",
        }
    }
}

/// Direction of a room-messages request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaginationDirection {
    /// Towards older events (`b`).
    Backward,
    /// Towards newer events (`f`).
    Forward,
}

impl PaginationDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

/// Command channel input accepted by the connection runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientCommand {
    /// Log in with a password and start syncing.
    Connect {
        /// Matrix user ID or localpart.
        user: String,
        password: String,
    },
    /// Adopt an existing session token without a login round trip.
    ConnectWithToken {
        user_id: String,
        access_token: String,
    },
    /// Replay the stored credentials through the login path.
    Reconnect,
    /// Stop syncing, cancel outstanding jobs and discard the token.
    Disconnect,
    /// Join a room by alias or ID.
    JoinRoom { room_alias_or_id: String },
    LeaveRoom { room_id: String },
    /// Send a room message.
    SendMessage {
        room_id: String,
        /// Caller-chosen transaction ID echoed in `MessageSent`.
        txn_id: String,
        body: String,
        msgtype: MessageType,
    },
    /// Move the own read marker and post a read receipt.
    MarkAsRead { room_id: String, event_id: String },
    /// Reset local unread counters without touching the server.
    ResetCounters {
        room_id: String,
        notifications: bool,
        highlights: bool,
    },
    /// Load older timeline events from the room's pagination cursor.
    PaginateBack { room_id: String, limit: u16 },
    /// Fetch the full member list of a room.
    FetchMembers { room_id: String },
    /// Emit the current room list.
    ListRooms,
    /// Emit a snapshot of one room.
    OpenRoom { room_id: String },
}

impl ClientCommand {
    /// Short action name used in logs and error messages.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::ConnectWithToken { .. } => "connect_with_token",
            Self::Reconnect => "reconnect",
            Self::Disconnect => "disconnect",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::SendMessage { .. } => "send_message",
            Self::MarkAsRead { .. } => "mark_as_read",
            Self::ResetCounters { .. } => "reset_counters",
            Self::PaginateBack { .. } => "paginate_back",
            Self::FetchMembers { .. } => "fetch_members",
            Self::ListRooms => "list_rooms",
            Self::OpenRoom { .. } => "open_room",
        }
    }
}

/// One room member as shown to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl MemberInfo {
    /// Display name when set, otherwise the user ID.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

/// Lightweight room metadata for room lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSummary {
    /// Matrix room ID.
    pub room_id: String,
    /// Computed display name.
    pub display_name: String,
    pub topic: Option<String>,
    pub join_state: JoinState,
    pub member_count: u64,
    /// Notification count, from sync or counted locally.
    pub notification_count: u64,
    /// Highlight/mention count, from sync or counted locally.
    pub highlight_count: u64,
    pub last_event_id: Option<String>,
}

/// Full view of one room at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub summary: RoomSummary,
    pub canonical_alias: Option<String>,
    pub aliases: Vec<String>,
    /// Timeline events in server order.
    pub timeline: Vec<RoomEvent>,
    pub members: Vec<MemberInfo>,
    /// Users currently typing, sorted.
    pub typing: Vec<String>,
    /// Own last-read event, if any.
    pub last_read_event_id: Option<String>,
    /// Cursor for loading older history.
    pub prev_batch: Option<String>,
}

/// Event channel output emitted by the connection runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection status transition.
    StatusChanged { status: ConnectionStatus },
    /// Session established and sync started.
    Connected { user_id: String },
    /// Login job failed; the status is back to `Disconnected`.
    LoginFailed { error: ClientError },
    /// One sync round failed.
    SyncFailed {
        error: ClientError,
        /// `false` when the runtime disconnects because of this failure.
        recoverable: bool,
        /// Consecutive failed rounds including this one.
        attempt: u32,
        /// Backoff before the next round when recoverable.
        retry_in_ms: Option<u64>,
    },
    /// A room entered the joined state.
    RoomJoined { room_id: String },
    /// A room changed as a result of sync or a direct action.
    RoomChanged { room_id: String, change: RoomChange },
    /// Malformed events were dropped while applying sync data.
    EventsSkipped { room_id: String, count: u64 },
    /// A room message was accepted by the homeserver.
    MessageSent {
        room_id: String,
        txn_id: String,
        event_id: String,
    },
    /// A room-level operation job failed.
    OperationFailed {
        operation: String,
        room_id: Option<String>,
        error: ClientError,
    },
    /// Full room list replacement.
    RoomListUpdated { rooms: Vec<RoomSummary> },
    /// Response to `OpenRoom`.
    RoomSnapshot(Box<RoomSnapshot>),
    /// Older history was prepended to a room timeline.
    HistoryLoaded {
        room_id: String,
        added: u64,
        /// New pagination cursor.
        end: Option<String>,
    },
    /// Response to `FetchMembers`.
    MembersLoaded {
        room_id: String,
        members: Vec<MemberInfo>,
    },
    /// A command was rejected or a runtime error occurred.
    Error {
        error: ClientError,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}
