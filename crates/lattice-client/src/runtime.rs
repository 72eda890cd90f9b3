//! The connection actor: one task that owns the session, the sync loop and
//! the room registry, driven by commands and job completions.

use std::{collections::HashMap, sync::Arc};

use lattice_core::{
    ChannelError, ClientChannels, ClientCommand, ClientError, ClientEvent, Credentials,
    ErrorCategory, EventStream, JobError, JoinState, PaginationDirection, RoomChange,
    RoomRegistry, SendOutcome, Session, SyncIncrement, Timeline, normalize_error,
    normalize_operation_failure, normalize_send_outcome,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    catalog::{
        self, EmptyResult, EventIdResult, JoinRoomResult, LoginResult, MembersResult,
        MessagesResult, Operation, ResultShape,
    },
    config::{ClientConfig, ConfigError},
    job::{Job, JobContext, JobHandle, JobId, KillMode},
    sync_engine::{SyncEngine, SyncProgress},
    transport::Transport,
};

/// Caller side of a running client.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    channels: ClientChannels,
}

impl ClientHandle {
    pub async fn send(&self, command: ClientCommand) -> Result<(), ChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Validate `config` and spawn the connection actor.
///
/// The actor runs until every `ClientHandle` is dropped.
pub fn spawn_client(
    config: ClientConfig,
    transport: Arc<dyn Transport>,
) -> Result<ClientHandle, ConfigError> {
    let homeserver = config.validate()?;
    let (channels, command_rx) = ClientChannels::new(config.command_buffer, config.event_buffer);
    let runtime = ConnectionRuntime::new(channels.clone(), command_rx, config, homeserver, transport);
    tokio::spawn(runtime.run());
    Ok(ClientHandle { channels })
}

#[derive(Debug)]
enum SideOutcome {
    Joined {
        requested: String,
        result: Result<JoinRoomResult, JobError>,
    },
    Left {
        room_id: String,
        result: Result<EmptyResult, JobError>,
    },
    Sent {
        room_id: String,
        txn_id: String,
        result: Result<EventIdResult, JobError>,
    },
    Receipt {
        room_id: String,
        result: Result<EmptyResult, JobError>,
    },
    History {
        room_id: String,
        result: Result<MessagesResult, JobError>,
    },
    Members {
        room_id: String,
        result: Result<MembersResult, JobError>,
    },
}

#[derive(Debug)]
struct SideCompletion {
    job: JobId,
    outcome: SideOutcome,
}

struct ConnectionRuntime {
    channels: ClientChannels,
    command_rx: mpsc::Receiver<ClientCommand>,
    config: ClientConfig,
    homeserver: Url,
    transport: Arc<dyn Transport>,
    session: Session,
    registry: RoomRegistry,
    /// User whose rooms the registry holds.
    registry_owner: Option<String>,
    sync: SyncEngine,
    login: Option<Job<LoginResult>>,
    side_jobs: HashMap<JobId, JobHandle>,
    side_tx: mpsc::UnboundedSender<SideCompletion>,
    side_rx: mpsc::UnboundedReceiver<SideCompletion>,
}

impl ConnectionRuntime {
    fn new(
        channels: ClientChannels,
        command_rx: mpsc::Receiver<ClientCommand>,
        config: ClientConfig,
        homeserver: Url,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (side_tx, side_rx) = mpsc::unbounded_channel();
        let sync = SyncEngine::new(
            config.sync_filter.clone(),
            config.sync_timeout,
            config.retry_policy,
        );
        Self {
            channels,
            command_rx,
            session: Session::new(homeserver.as_str()),
            homeserver,
            transport,
            registry: RoomRegistry::new(),
            registry_owner: None,
            sync,
            login: None,
            side_jobs: HashMap::new(),
            side_tx,
            side_rx,
            config,
        }
    }

    async fn run(mut self) {
        info!(homeserver = %self.homeserver, "client runtime started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                outcome = wait_job(&mut self.login) => {
                    self.login = None;
                    self.on_login_finished(outcome);
                }
                progress = self.sync.next() => self.on_sync_progress(progress),
                Some(completion) = self.side_rx.recv() => self.on_side_completion(completion),
            }
        }

        self.disconnect();
        info!("client runtime stopped");
    }

    fn handle_command(&mut self, command: ClientCommand) {
        debug!(action = command.action(), status = ?self.session.status(), "handling command");
        if let Err(err) = self.dispatch(command) {
            self.emit_error(err);
        }
    }

    fn dispatch(&mut self, command: ClientCommand) -> Result<(), ClientError> {
        self.session.check(&command)?;

        match command {
            ClientCommand::Connect { user, password } => {
                let (credentials, events) = self.session.begin_login(Credentials { user, password })?;
                self.channels.emit_all(events);
                self.start_login(credentials);
            }
            ClientCommand::ConnectWithToken {
                user_id,
                access_token,
            } => {
                let events = self.session.resume(user_id.clone(), access_token)?;
                self.channels.emit_all(events);
                self.on_session_ready(user_id);
            }
            ClientCommand::Reconnect => {
                let (credentials, events) = self.session.begin_relogin()?;
                self.sync.stop();
                self.kill_side_jobs();
                self.channels.emit_all(events);
                self.start_login(credentials);
            }
            ClientCommand::Disconnect => self.disconnect(),
            ClientCommand::JoinRoom { room_alias_or_id } => {
                self.spawn_side(catalog::join_room(&room_alias_or_id), move |result| {
                    SideOutcome::Joined {
                        requested: room_alias_or_id,
                        result,
                    }
                });
            }
            ClientCommand::LeaveRoom { room_id } => {
                self.spawn_side(catalog::leave_room(&room_id), move |result| SideOutcome::Left {
                    room_id,
                    result,
                });
            }
            ClientCommand::SendMessage {
                room_id,
                txn_id,
                body,
                msgtype,
            } => {
                let operation = catalog::send_message(&room_id, &txn_id, msgtype, &body);
                self.spawn_side(operation, move |result| SideOutcome::Sent {
                    room_id,
                    txn_id,
                    result,
                });
            }
            ClientCommand::MarkAsRead { room_id, event_id } => {
                let own_user_id = self.own_user_id()?;
                let room = self
                    .registry
                    .get_mut(&room_id)
                    .ok_or_else(|| unknown_room(&room_id))?;
                let changes = room.mark_as_read(&own_user_id, &event_id);
                self.channels.emit_room_changes(&room_id, changes);
                self.spawn_side(catalog::post_receipt(&room_id, &event_id), move |result| {
                    SideOutcome::Receipt { room_id, result }
                });
            }
            ClientCommand::ResetCounters {
                room_id,
                notifications,
                highlights,
            } => {
                let room = self
                    .registry
                    .get_mut(&room_id)
                    .ok_or_else(|| unknown_room(&room_id))?;
                let mut changes = Vec::new();
                if notifications {
                    changes.extend(room.reset_notification_count());
                }
                if highlights {
                    changes.extend(room.reset_highlight_count());
                }
                self.channels.emit_room_changes(&room_id, changes);
            }
            ClientCommand::PaginateBack { room_id, limit } => {
                let room = self
                    .registry
                    .get(&room_id)
                    .ok_or_else(|| unknown_room(&room_id))?;
                let from = room.prev_batch().map(ToOwned::to_owned).ok_or_else(|| {
                    ClientError::new(
                        ErrorCategory::Internal,
                        "pagination_unavailable",
                        format!("room '{room_id}' has no pagination cursor yet"),
                    )
                })?;
                let limit = Timeline::bounded_paginate_limit(limit, self.config.pagination_cap);
                let operation =
                    catalog::room_messages(&room_id, &from, limit, PaginationDirection::Backward);
                self.spawn_side(operation, move |result| SideOutcome::History { room_id, result });
            }
            ClientCommand::FetchMembers { room_id } => {
                if !self.registry.contains(&room_id) {
                    return Err(unknown_room(&room_id));
                }
                self.spawn_side(catalog::room_members(&room_id), move |result| {
                    SideOutcome::Members { room_id, result }
                });
            }
            ClientCommand::ListRooms => self.emit_room_list(),
            ClientCommand::OpenRoom { room_id } => {
                let room = self
                    .registry
                    .get(&room_id)
                    .ok_or_else(|| unknown_room(&room_id))?;
                let snapshot = room.snapshot(self.session.user_id());
                self.channels.emit(ClientEvent::RoomSnapshot(Box::new(snapshot)));
            }
        }
        Ok(())
    }

    fn job_context(&self) -> JobContext {
        JobContext {
            homeserver: self.homeserver.clone(),
            access_token: self.session.access_token().map(ToOwned::to_owned),
            transport: self.transport.clone(),
            timeout: self.config.job_timeout,
        }
    }

    fn start_login(&mut self, credentials: Credentials) {
        let mut job = Job::new(catalog::password_login(&credentials.user, &credentials.password));
        info!(user = %credentials.user, job = %job.id(), "logging in");
        if let Err(err) = job.start(&self.job_context()) {
            self.fail_login(err);
            return;
        }
        self.login = Some(job);
    }

    fn on_login_finished(&mut self, outcome: Result<LoginResult, JobError>) {
        match outcome {
            Ok(login) => {
                let user_id = login.user_id.clone();
                match self.session.complete_login(login.user_id, login.access_token) {
                    Ok(event) => {
                        self.channels.emit(event);
                        self.on_session_ready(user_id);
                    }
                    Err(err) => self.fail_login(err),
                }
            }
            Err(JobError::Cancelled) => debug!("login cancelled"),
            Err(error) => self.fail_login(ClientError::from(error)),
        }
    }

    fn fail_login(&mut self, error: ClientError) {
        warn!(code = %error.code, message = %error.message, "login failed");
        if let Ok(event) = self.session.fail_login() {
            self.channels.emit(event);
        }
        self.channels.emit(ClientEvent::LoginFailed { error });
    }

    fn on_session_ready(&mut self, user_id: String) {
        if self.registry_owner.as_deref() != Some(user_id.as_str()) {
            if self.registry_owner.is_some() {
                info!(user_id = %user_id, "session user changed, dropping room model");
            }
            self.registry.clear();
            self.sync.reset();
            self.registry_owner = Some(user_id.clone());
        }
        self.sync.start(&self.job_context());
        self.channels.emit(ClientEvent::Connected { user_id });
    }

    /// Stop all work and drop to `Disconnected`. Killed jobs stay quiet.
    fn disconnect(&mut self) {
        if let Some(login) = self.login.take() {
            login.kill(KillMode::Quiet);
        }
        self.sync.stop();
        self.kill_side_jobs();
        let events = self.session.end();
        if !events.is_empty() {
            info!("disconnected");
        }
        self.channels.emit_all(events);
    }

    fn kill_side_jobs(&mut self) {
        for (_, handle) in self.side_jobs.drain() {
            handle.kill(KillMode::Quiet);
        }
    }

    fn on_sync_progress(&mut self, progress: SyncProgress) {
        match progress {
            SyncProgress::Increment(increment) => {
                self.apply_increment(&increment);
                self.sync.issue(&self.job_context());
            }
            SyncProgress::Failed {
                error,
                attempt,
                fatal,
                retry_in,
            } => {
                self.channels.emit(ClientEvent::SyncFailed {
                    error: ClientError::from(&error),
                    recoverable: !fatal,
                    attempt,
                    retry_in_ms: retry_in.map(|delay| delay.as_millis() as u64),
                });
                if fatal {
                    self.disconnect();
                }
            }
            SyncProgress::RetryDue => self.sync.issue(&self.job_context()),
            SyncProgress::Stopped => debug!("sync stopped"),
        }
    }

    fn apply_increment(&mut self, increment: &SyncIncrement) {
        let own_user_id = self.session.user_id().map(ToOwned::to_owned);
        let applied = self.registry.apply_increment(increment, own_user_id.as_deref());
        debug!(seq = increment.seq, rooms = applied.len(), "applied sync increment");

        let mut list_changed = false;
        for room in applied {
            if room.skipped > 0 {
                warn!(room_id = %room.room_id, count = room.skipped, "skipped malformed events");
                self.channels.emit(ClientEvent::EventsSkipped {
                    room_id: room.room_id.clone(),
                    count: room.skipped as u64,
                });
            }
            if room.became_joined() {
                self.channels.emit(ClientEvent::RoomJoined {
                    room_id: room.room_id.clone(),
                });
            }
            list_changed |= room.created || room.changes.iter().any(changes_summary);
            self.channels.emit_room_changes(&room.room_id, room.changes);
        }

        if list_changed {
            self.emit_room_list();
        }
    }

    fn spawn_side<T, F>(&mut self, operation: Operation<T>, wrap: F)
    where
        T: ResultShape,
        F: FnOnce(Result<T, JobError>) -> SideOutcome + Send + 'static,
    {
        let mut job = Job::new(operation);
        let id = job.id();
        if let Err(err) = job.start(&self.job_context()) {
            self.emit_error(err);
            return;
        }
        debug!(job = %id, operation = job.name(), "room operation dispatched");
        self.side_jobs.insert(id, job.handle());

        let side_tx = self.side_tx.clone();
        tokio::spawn(async move {
            let outcome = wrap(job.finished().await);
            let _ = side_tx.send(SideCompletion { job: id, outcome });
        });
    }

    fn on_side_completion(&mut self, completion: SideCompletion) {
        if self.side_jobs.remove(&completion.job).is_none() {
            debug!(job = %completion.job, "ignoring completion of abandoned job");
            return;
        }

        match completion.outcome {
            SideOutcome::Joined { requested, result } => match result {
                Ok(joined) => {
                    let created = !self.registry.contains(&joined.room_id);
                    let room = self.registry.provide_room(&joined.room_id);
                    let change = room.set_join_state(JoinState::Joined);
                    let became_joined = created || change.is_some();
                    self.channels.emit_room_changes(&joined.room_id, change);
                    if became_joined {
                        info!(room_id = %joined.room_id, "joined room");
                        self.channels.emit(ClientEvent::RoomJoined {
                            room_id: joined.room_id,
                        });
                        self.emit_room_list();
                    }
                }
                Err(error) => self.emit_operation_failure("join_room", Some(requested), error),
            },
            SideOutcome::Left { room_id, result } => match result {
                Ok(_) => {
                    if let Some(change) = self
                        .registry
                        .get_mut(&room_id)
                        .and_then(|room| room.set_join_state(JoinState::Left))
                    {
                        self.channels.emit_room_changes(&room_id, [change]);
                        self.emit_room_list();
                    }
                }
                Err(error) => self.emit_operation_failure("leave_room", Some(room_id), error),
            },
            SideOutcome::Sent {
                room_id,
                txn_id,
                result,
            } => {
                let outcome = match result {
                    Ok(sent) => SendOutcome::Success {
                        event_id: sent.event_id,
                    },
                    Err(error) => SendOutcome::Failure {
                        error: error.into(),
                    },
                };
                self.channels
                    .emit(normalize_send_outcome(room_id, txn_id, outcome));
            }
            SideOutcome::Receipt { room_id, result } => {
                if let Err(error) = result {
                    self.emit_operation_failure("post_receipt", Some(room_id), error);
                }
            }
            SideOutcome::History { room_id, result } => match result {
                Ok(messages) => {
                    if messages.skipped > 0 {
                        self.channels.emit(ClientEvent::EventsSkipped {
                            room_id: room_id.clone(),
                            count: messages.skipped as u64,
                        });
                    }
                    let room = self.registry.provide_room(&room_id);
                    let added = room.prepend_history(messages.chunk, messages.end.clone());
                    debug!(room_id = %room_id, added, "loaded older history");
                    self.channels.emit(ClientEvent::HistoryLoaded {
                        room_id,
                        added: added as u64,
                        end: messages.end,
                    });
                }
                Err(error) => self.emit_operation_failure("paginate_back", Some(room_id), error),
            },
            SideOutcome::Members { room_id, result } => match result {
                Ok(members) => {
                    if members.skipped > 0 {
                        self.channels.emit(ClientEvent::EventsSkipped {
                            room_id: room_id.clone(),
                            count: members.skipped as u64,
                        });
                    }
                    let seq = self.registry.last_seq();
                    let own_user_id = self.session.user_id().map(ToOwned::to_owned);
                    let room = self.registry.provide_room(&room_id);
                    let changes = room.apply_state_events(&members.chunk, seq, own_user_id.as_deref());
                    let loaded = room.members().cloned().collect();
                    let list_changed = changes.iter().any(changes_summary);
                    self.channels.emit_room_changes(&room_id, changes);
                    self.channels.emit(ClientEvent::MembersLoaded {
                        room_id,
                        members: loaded,
                    });
                    if list_changed {
                        self.emit_room_list();
                    }
                }
                Err(error) => self.emit_operation_failure("fetch_members", Some(room_id), error),
            },
        }
    }

    fn own_user_id(&self) -> Result<String, ClientError> {
        self.session.user_id().map(ToOwned::to_owned).ok_or_else(|| {
            ClientError::new(
                ErrorCategory::Auth,
                "missing_user_id",
                "no user is logged in",
            )
        })
    }

    fn emit_room_list(&self) {
        self.channels.emit(ClientEvent::RoomListUpdated {
            rooms: self.registry.summaries(self.session.user_id()),
        });
    }

    fn emit_operation_failure(&self, operation: &str, room_id: Option<String>, error: JobError) {
        warn!(operation, room_id = ?room_id, error = %error, "room operation failed");
        self.channels
            .emit(normalize_operation_failure(operation, room_id, error));
    }

    fn emit_error(&self, error: ClientError) {
        let recoverable = matches!(
            error.category,
            ErrorCategory::Network | ErrorCategory::RateLimited
        );
        warn!(code = %error.code, message = %error.message, recoverable, "command failed");
        self.channels.emit(normalize_error(error, recoverable));
    }
}

async fn wait_job<T: ResultShape>(job: &mut Option<Job<T>>) -> Result<T, JobError> {
    match job {
        Some(job) => job.wait().await,
        None => std::future::pending().await,
    }
}

/// Whether `change` alters what a room list entry shows.
fn changes_summary(change: &RoomChange) -> bool {
    matches!(
        change,
        RoomChange::JoinStateChanged { .. }
            | RoomChange::NamesChanged
            | RoomChange::DisplayNameChanged(_)
    )
}

fn unknown_room(room_id: &str) -> ClientError {
    ClientError::new(
        ErrorCategory::Internal,
        "unknown_room",
        format!("room '{room_id}' is not known to this session"),
    )
}
