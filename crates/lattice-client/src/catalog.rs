//! Declarative descriptors for every client-server operation.
//!
//! Each operation is a value of [`Operation<T>`] that a generic
//! [`Job`](crate::job::Job) executes; `T` declares how the response binds.

use std::{fmt, marker::PhantomData};

use lattice_core::{Bound, JobError, MessageType, PaginationDirection, RoomEvent, bind, field};
use serde_json::{Value, json};
use tracing::warn;
use url::Url;

use crate::transport::{HttpRequest, Method};

/// Path prefix shared by all client-server endpoints.
pub const API_PREFIX: [&str; 3] = ["_matrix", "client", "r0"];

/// A result record bound from a response payload.
///
/// Implementations declare their fields and decide validity.
pub trait ResultShape: Sized + Send + 'static {
    fn bind(payload: &Value) -> Bound<Self>;
}

/// One request shape plus the type its response binds to.
pub struct Operation<T> {
    name: &'static str,
    method: Method,
    path: Vec<String>,
    query: Vec<(String, String)>,
    body: Option<Value>,
    needs_token: bool,
    _result: PhantomData<fn() -> T>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            method: self.method,
            path: self.path.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
            needs_token: self.needs_token,
            _result: PhantomData,
        }
    }
}

// Bodies may carry passwords; only report whether one is present.
impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("body", &self.body.is_some())
            .field("needs_token", &self.needs_token)
            .finish()
    }
}

impl<T> Operation<T> {
    /// An authenticated operation on `path` (segments below the API prefix).
    pub fn new<S: Into<String>>(
        name: &'static str,
        method: Method,
        path: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name,
            method,
            path: path.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            body: None,
            needs_token: true,
            _result: PhantomData,
        }
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_owned(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn without_token(mut self) -> Self {
        self.needs_token = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn needs_token(&self) -> bool {
        self.needs_token
    }

    /// Resolve against `homeserver`, attaching `token` when required.
    ///
    /// Path segments are percent-encoded individually.
    pub fn build_request(&self, homeserver: &Url, token: Option<&str>) -> Result<HttpRequest, JobError> {
        let bearer_token = match token.filter(|token| !token.is_empty()) {
            Some(token) if self.needs_token => Some(token.to_owned()),
            None if self.needs_token => return Err(JobError::Unauthenticated),
            _ => None,
        };

        let mut url = homeserver.clone();
        url.path_segments_mut()
            .map_err(|()| JobError::Network {
                status: None,
                message: format!("homeserver URL '{homeserver}' cannot carry a path"),
                retry_after_ms: None,
            })?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(&self.path);
        url.set_query(None);
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }

        Ok(HttpRequest {
            method: self.method,
            url,
            bearer_token,
            body: self.body.clone(),
        })
    }
}

/// `POST login` result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginResult {
    pub access_token: String,
    pub user_id: String,
    pub home_server: String,
    pub device_id: Option<String>,
}

impl ResultShape for LoginResult {
    fn bind(payload: &Value) -> Bound<Self> {
        let mut result = Self::default();
        let report = bind(
            payload,
            vec![
                field("access_token", &mut result.access_token),
                field("user_id", &mut result.user_id),
                field("home_server", &mut result.home_server),
                field("device_id", &mut result.device_id),
            ],
        );
        let empty_token = !report.has_failed("access_token") && result.access_token.is_empty();
        let mut bound = report.into_bound(result, &["access_token", "user_id", "home_server"]);
        if empty_token {
            bound.valid = false;
            bound.failed.push("access_token".to_owned());
        }
        bound
    }
}

/// `GET rooms/{id}/messages` result. `chunk` is in request direction order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagesResult {
    pub chunk: Vec<RoomEvent>,
    pub start: Option<String>,
    pub end: Option<String>,
    /// Malformed events dropped from `chunk`.
    pub skipped: usize,
}

impl ResultShape for MessagesResult {
    fn bind(payload: &Value) -> Bound<Self> {
        let mut chunk: Vec<Value> = Vec::new();
        let mut result = Self::default();
        let report = bind(
            payload,
            vec![
                field("chunk", &mut chunk),
                field("start", &mut result.start),
                field("end", &mut result.end),
            ],
        );
        (result.chunk, result.skipped) = bind_events(&chunk, RoomEvent::from_timeline);
        report.into_bound(result, &["chunk"])
    }
}

/// `GET sync` result. `rooms` stays raw until stamped into an increment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub next_batch: String,
    pub rooms: Value,
}

impl ResultShape for SyncResult {
    fn bind(payload: &Value) -> Bound<Self> {
        let mut result = Self::default();
        let report = bind(
            payload,
            vec![
                field("next_batch", &mut result.next_batch),
                field("rooms", &mut result.rooms),
            ],
        );
        report.into_bound(result, &["next_batch"])
    }
}

/// `POST join/{alias_or_id}` result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinRoomResult {
    pub room_id: String,
}

impl ResultShape for JoinRoomResult {
    fn bind(payload: &Value) -> Bound<Self> {
        let mut result = Self::default();
        bind(payload, vec![field("room_id", &mut result.room_id)]).into_bound(result, &["room_id"])
    }
}

/// Result of operations that return a single `event_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventIdResult {
    pub event_id: String,
}

impl ResultShape for EventIdResult {
    fn bind(payload: &Value) -> Bound<Self> {
        let mut result = Self::default();
        bind(payload, vec![field("event_id", &mut result.event_id)]).into_bound(result, &["event_id"])
    }
}

/// `GET rooms/{id}/members` result: membership state events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembersResult {
    pub chunk: Vec<RoomEvent>,
    pub skipped: usize,
}

impl ResultShape for MembersResult {
    fn bind(payload: &Value) -> Bound<Self> {
        let mut chunk: Vec<Value> = Vec::new();
        let report = bind(payload, vec![field("chunk", &mut chunk)]);
        let (chunk, skipped) = bind_events(&chunk, RoomEvent::from_state);
        report.into_bound(Self { chunk, skipped }, &["chunk"])
    }
}

/// Any JSON object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmptyResult;

impl ResultShape for EmptyResult {
    fn bind(payload: &Value) -> Bound<Self> {
        let valid = payload.is_object();
        Bound {
            value: Self,
            failed: Vec::new(),
            valid,
        }
    }
}

fn bind_events(raw: &[Value], parse: impl Fn(&Value) -> Bound<RoomEvent>) -> (Vec<RoomEvent>, usize) {
    let mut skipped = 0;
    let events = raw
        .iter()
        .filter_map(|value| {
            let bound = parse(value);
            if !bound.valid {
                skipped += 1;
                warn!(failed = ?bound.failed, "skipping malformed event in response chunk");
            }
            bound.into_result().ok()
        })
        .collect();
    (events, skipped)
}

pub fn password_login(user: &str, password: &str) -> Operation<LoginResult> {
    Operation::new("login", Method::Post, ["login"])
        .without_token()
        .with_body(json!({
            "type": "m.login.password",
            "user": user,
            "password": password,
        }))
}

pub fn room_messages(
    room_id: &str,
    from: &str,
    limit: u16,
    direction: PaginationDirection,
) -> Operation<MessagesResult> {
    Operation::new("room_messages", Method::Get, ["rooms", room_id, "messages"])
        .with_query("from", from)
        .with_query("limit", limit.to_string())
        .with_query("dir", direction.as_str())
}

/// Long-poll for changes. The server may hold the request for `timeout_ms`.
pub fn sync(filter: &str, timeout_ms: u64, since: Option<&str>) -> Operation<SyncResult> {
    let operation = Operation::new("sync", Method::Get, ["sync"])
        .with_query("filter", filter)
        .with_query("timeout", timeout_ms.to_string());
    match since {
        Some(since) => operation.with_query("since", since),
        None => operation,
    }
}

pub fn join_room(room_alias_or_id: &str) -> Operation<JoinRoomResult> {
    Operation::new("join_room", Method::Post, ["join", room_alias_or_id]).with_body(json!({}))
}

pub fn leave_room(room_id: &str) -> Operation<EmptyResult> {
    Operation::new("leave_room", Method::Post, ["rooms", room_id, "leave"]).with_body(json!({}))
}

pub fn send_message(
    room_id: &str,
    txn_id: &str,
    msgtype: MessageType,
    body: &str,
) -> Operation<EventIdResult> {
    Operation::new(
        "send_message",
        Method::Put,
        ["rooms", room_id, "send", "m.room.message", txn_id],
    )
    .with_body(json!({ "msgtype": msgtype.as_str(), "body": body }))
}

pub fn post_receipt(room_id: &str, event_id: &str) -> Operation<EmptyResult> {
    Operation::new(
        "post_receipt",
        Method::Post,
        ["rooms", room_id, "receipt", "m.read", event_id],
    )
    .with_body(json!({}))
}

pub fn room_members(room_id: &str) -> Operation<MembersResult> {
    Operation::new("room_members", Method::Get, ["rooms", room_id, "members"])
}
