use crate::{error::ClientError, types::ClientEvent};

/// Send job outcome before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send succeeded and produced an event ID.
    Success { event_id: String },
    /// Send failed with error details.
    Failure { error: ClientError },
}

/// Convert a send outcome to `MessageSent` or `OperationFailed`.
pub fn normalize_send_outcome(
    room_id: impl Into<String>,
    txn_id: impl Into<String>,
    outcome: SendOutcome,
) -> ClientEvent {
    let room_id = room_id.into();
    match outcome {
        SendOutcome::Success { event_id } => ClientEvent::MessageSent {
            room_id,
            txn_id: txn_id.into(),
            event_id,
        },
        SendOutcome::Failure { error } => ClientEvent::OperationFailed {
            operation: format!("send_message:{}", txn_id.into()),
            room_id: Some(room_id),
            error,
        },
    }
}

/// Convert a failed room operation into an `OperationFailed` event.
pub fn normalize_operation_failure(
    operation: impl Into<String>,
    room_id: Option<String>,
    error: impl Into<ClientError>,
) -> ClientEvent {
    ClientEvent::OperationFailed {
        operation: operation.into(),
        room_id,
        error: error.into(),
    }
}

/// Convert an error into an `Error` client event.
pub fn normalize_error(error: ClientError, recoverable: bool) -> ClientEvent {
    ClientEvent::Error { error, recoverable }
}
