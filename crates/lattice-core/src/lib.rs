//! Transport-free client contract for a Matrix homeserver session.
//!
//! This crate defines the command/event protocol, typed JSON binding, the
//! connection state machine, and the in-memory room model that sync
//! increments are folded into.

/// Typed binding of JSON payloads onto declared records.
pub mod binding;
/// Async command/event channel primitives.
pub mod channel;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Room events as delivered by the homeserver.
pub mod event;
/// Event normalization helpers (for example send acknowledgements).
pub mod normalization;
/// Room registry keyed by room ID.
pub mod registry;
/// Backoff policy used by retry loops.
pub mod retry;
/// Room model and sync application rules.
pub mod room;
/// Session token and credential ownership.
pub mod session;
/// Connection state machine.
pub mod state_machine;
/// Sync response parsing.
pub mod sync;
/// Deduplicating timeline buffer.
pub mod timeline;
/// Protocol types (commands, events, payloads).
pub mod types;

pub use binding::{BindReport, Bound, FailureReason, Field, FieldFailure, FromJson, bind, field, nested};
pub use channel::{ChannelError, ClientChannels, EventStream};
pub use error::{ClientError, ErrorCategory, JobError, classify_http_status};
pub use event::{EphemeralEvent, JoinState, RoomEvent};
pub use normalization::{SendOutcome, normalize_error, normalize_operation_failure, normalize_send_outcome};
pub use registry::{AppliedRoom, RoomRegistry};
pub use retry::RetryPolicy;
pub use room::{Room, RoomChange};
pub use session::{Credentials, Session};
pub use state_machine::ConnectionStateMachine;
pub use sync::{SyncIncrement, SyncRoom, UnreadCounts};
pub use timeline::Timeline;
pub use types::{
    ClientCommand, ClientEvent, ConnectionStatus, MemberInfo, MessageType, PaginationDirection,
    RoomSnapshot, RoomSummary,
};
