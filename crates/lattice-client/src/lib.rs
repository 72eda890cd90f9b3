//! Homeserver-facing half of the client: transport, jobs, the operation
//! catalog, the sync loop and the connection runtime that ties them together.

pub mod catalog;
pub mod config;
pub mod job;
pub mod runtime;
pub mod sync_engine;
pub mod transport;

#[cfg(test)]
mod testing;

pub use catalog::{Operation, ResultShape};
pub use config::{ClientConfig, ConfigError};
pub use job::{DEFAULT_JOB_TIMEOUT, Job, JobContext, JobHandle, JobId, JobNotification, JobState, KillMode};
pub use runtime::{ClientHandle, spawn_client};
pub use sync_engine::{DEFAULT_SYNC_FILTER, SyncEngine, SyncProgress};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError, TransportErrorKind};
