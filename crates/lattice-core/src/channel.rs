use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::{
    room::RoomChange,
    types::{ClientCommand, ClientEvent},
};

/// Receiving side of the client event stream.
pub type EventStream = broadcast::Receiver<ClientEvent>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("client runtime is no longer accepting commands")]
    CommandChannelClosed,
}

/// Commands in, events out. Cloned freely between the runtime and callers.
#[derive(Clone, Debug)]
pub struct ClientChannels {
    commands: mpsc::Sender<ClientCommand>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientChannels {
    /// Both capacities are raised to at least one.
    pub fn new(command_capacity: usize, event_capacity: usize) -> (Self, mpsc::Receiver<ClientCommand>) {
        let (commands, command_rx) = mpsc::channel(command_capacity.max(1));
        let (events, _) = broadcast::channel(event_capacity.max(1));
        (Self { commands, events }, command_rx)
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub async fn send_command(&self, command: ClientCommand) -> Result<(), ChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChannelError::CommandChannelClosed)
    }

    /// Whether the runtime has dropped its command receiver.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Broadcast one event. Events with no subscriber are dropped.
    pub fn emit(&self, event: ClientEvent) {
        if let Err(broadcast::error::SendError(event)) = self.events.send(event) {
            trace!(?event, "no subscribers for client event");
        }
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = ClientEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Emit one `RoomChanged` per change, in order.
    pub fn emit_room_changes(&self, room_id: &str, changes: impl IntoIterator<Item = RoomChange>) {
        for change in changes {
            self.emit(ClientEvent::RoomChanged {
                room_id: room_id.to_owned(),
                change,
            });
        }
    }
}
