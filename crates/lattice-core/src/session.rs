use std::fmt;

use tracing::info;

use crate::{
    error::{ClientError, ErrorCategory},
    state_machine::ConnectionStateMachine,
    types::{ClientCommand, ClientEvent, ConnectionStatus},
};

/// Password credentials kept for `reconnect`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated session against one homeserver.
///
/// Holds a token exactly while the status is `Connected`.
#[derive(Debug, Clone)]
pub struct Session {
    homeserver: String,
    machine: ConnectionStateMachine,
    user_id: Option<String>,
    access_token: Option<String>,
    credentials: Option<Credentials>,
}

impl Session {
    pub fn new(homeserver: impl Into<String>) -> Self {
        Self {
            homeserver: homeserver.into(),
            machine: ConnectionStateMachine::default(),
            user_id: None,
            access_token: None,
            credentials: None,
        }
    }

    pub fn homeserver(&self) -> &str {
        &self.homeserver
    }

    pub fn status(&self) -> ConnectionStatus {
        self.machine.status()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Store credentials and move to `Connecting`.
    pub fn begin_login(
        &mut self,
        credentials: Credentials,
    ) -> Result<(Credentials, Vec<ClientEvent>), ClientError> {
        let events = self.machine.apply(&ClientCommand::Connect {
            user: credentials.user.clone(),
            password: credentials.password.clone(),
        })?;
        self.credentials = Some(credentials.clone());
        Ok((credentials, events))
    }

    /// Replay stored credentials, dropping any current token.
    pub fn begin_relogin(&mut self) -> Result<(Credentials, Vec<ClientEvent>), ClientError> {
        let credentials = self.credentials.clone().ok_or_else(|| {
            ClientError::new(
                ErrorCategory::Config,
                "missing_credentials",
                "reconnect requires a previous password login",
            )
        })?;
        let events = self.machine.apply(&ClientCommand::Reconnect)?;
        self.access_token = None;
        Ok((credentials, events))
    }

    /// Adopt the token returned by a successful login.
    ///
    /// An empty token is refused without changing status.
    pub fn complete_login(
        &mut self,
        user_id: String,
        access_token: String,
    ) -> Result<ClientEvent, ClientError> {
        ensure_token(&access_token)?;
        let event = self.machine.on_login_result(true)?;
        info!(user_id = %user_id, homeserver = %self.homeserver, "session established");
        self.user_id = Some(user_id);
        self.access_token = Some(access_token);
        Ok(event)
    }

    pub fn fail_login(&mut self) -> Result<ClientEvent, ClientError> {
        let event = self.machine.on_login_result(false)?;
        self.access_token = None;
        Ok(event)
    }

    /// Adopt an existing token without a login round trip.
    pub fn resume(
        &mut self,
        user_id: String,
        access_token: String,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        ensure_token(&access_token)?;
        let events = self.machine.apply(&ClientCommand::ConnectWithToken {
            user_id: user_id.clone(),
            access_token: access_token.clone(),
        })?;
        info!(user_id = %user_id, homeserver = %self.homeserver, "session resumed from token");
        self.user_id = Some(user_id);
        self.access_token = Some(access_token);
        Ok(events)
    }

    /// Discard the token and drop to `Disconnected`.
    pub fn end(&mut self) -> Vec<ClientEvent> {
        self.access_token = None;
        self.machine.on_fatal().into_iter().collect()
    }

    pub fn check(&self, command: &ClientCommand) -> Result<(), ClientError> {
        self.machine.check(command)
    }
}

fn ensure_token(token: &str) -> Result<(), ClientError> {
    if token.is_empty() {
        return Err(ClientError::new(
            ErrorCategory::Auth,
            "empty_access_token",
            "access token must not be empty",
        ));
    }
    Ok(())
}
