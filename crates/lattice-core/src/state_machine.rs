use crate::{
    error::ClientError,
    types::{ClientCommand, ClientEvent, ConnectionStatus},
};

/// Transition rules for the connection status.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    status: ConnectionStatus,
}

impl ConnectionStateMachine {
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Validate `command` against the current status and apply its transition.
    ///
    /// Rejected commands leave the status untouched.
    pub fn apply(&mut self, command: &ClientCommand) -> Result<Vec<ClientEvent>, ClientError> {
        use ClientCommand::*;

        match command {
            Connect { .. } => self.transition_from_state(
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
                command.action(),
            ),
            Reconnect => self.transition_from_any_of(
                &[ConnectionStatus::Disconnected, ConnectionStatus::Connected],
                ConnectionStatus::Connecting,
                command.action(),
            ),
            ConnectWithToken { .. } => self.transition_from_state(
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connected,
                command.action(),
            ),
            Disconnect => Ok(self.force(ConnectionStatus::Disconnected).into_iter().collect()),
            JoinRoom { .. }
            | LeaveRoom { .. }
            | SendMessage { .. }
            | MarkAsRead { .. }
            | PaginateBack { .. }
            | FetchMembers { .. } => self.check(command).map(|()| Vec::new()),
            ListRooms | OpenRoom { .. } | ResetCounters { .. } => Ok(Vec::new()),
        }
    }

    /// Whether `command` is allowed now, without changing status.
    pub fn check(&self, command: &ClientCommand) -> Result<(), ClientError> {
        use ClientCommand::*;

        let allowed = match command {
            Connect { .. } | ConnectWithToken { .. } => {
                self.status == ConnectionStatus::Disconnected
            }
            Reconnect => self.status != ConnectionStatus::Connecting,
            Disconnect | ListRooms | OpenRoom { .. } | ResetCounters { .. } => true,
            JoinRoom { .. }
            | LeaveRoom { .. }
            | SendMessage { .. }
            | MarkAsRead { .. }
            | PaginateBack { .. }
            | FetchMembers { .. } => self.status == ConnectionStatus::Connected,
        };

        if allowed {
            Ok(())
        } else {
            Err(ClientError::invalid_state(self.status, command.action()))
        }
    }

    /// Resolve a pending login.
    pub fn on_login_result(&mut self, success: bool) -> Result<ClientEvent, ClientError> {
        if self.status != ConnectionStatus::Connecting {
            return Err(ClientError::invalid_state(self.status, "on_login_result"));
        }

        let next = if success {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };

        self.status = next;
        Ok(ClientEvent::StatusChanged { status: next })
    }

    /// Drop to `Disconnected` after an unrecoverable failure.
    pub fn on_fatal(&mut self) -> Option<ClientEvent> {
        self.force(ConnectionStatus::Disconnected)
    }

    fn force(&mut self, next: ConnectionStatus) -> Option<ClientEvent> {
        if self.status == next {
            return None;
        }
        self.status = next;
        Some(ClientEvent::StatusChanged { status: next })
    }

    fn transition_from_state(
        &mut self,
        expected: ConnectionStatus,
        next: ConnectionStatus,
        action: &str,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        self.transition_from_any_of(&[expected], next, action)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionStatus],
        next: ConnectionStatus,
        action: &str,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        if !expected.contains(&self.status) {
            return Err(ClientError::invalid_state(self.status, action));
        }
        self.status = next;
        Ok(vec![ClientEvent::StatusChanged { status: next }])
    }
}
