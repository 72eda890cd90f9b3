//! One request/response exchange as an observable, cancellable unit.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use lattice_core::{ClientError, ErrorCategory, JobError, bind, field};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    catalog::{Operation, ResultShape},
    transport::{HttpResponse, Transport},
};

/// Applied to every job unless configured otherwise.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

const NOTIFICATION_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job lifecycle. Moves forward only; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Dispatched,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// Emit `Finished` then `Failed(Cancelled)`.
    Notify,
    /// Emit only `Finished`.
    Quiet,
}

/// Lifecycle notifications, in emission order per job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobNotification {
    Finished,
    Succeeded,
    Failed(JobError),
}

/// What a job needs to dispatch.
#[derive(Clone)]
pub struct JobContext {
    pub homeserver: Url,
    pub access_token: Option<String>,
    pub transport: Arc<dyn Transport>,
    pub timeout: Duration,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("homeserver", &self.homeserver.as_str())
            .field("has_token", &self.access_token.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

type Outcome<T> = Result<T, JobError>;

struct Lifecycle<T> {
    state: JobState,
    outcome_tx: Option<oneshot::Sender<Outcome<T>>>,
}

struct JobShared<T> {
    id: JobId,
    name: &'static str,
    lifecycle: Mutex<Lifecycle<T>>,
    cancel: CancellationToken,
    notify: broadcast::Sender<JobNotification>,
}

impl<T> JobShared<T> {
    fn lock(&self) -> MutexGuard<'_, Lifecycle<T>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the single terminal transition. Returns `false` if one already happened.
    fn settle(&self, outcome: Outcome<T>, quiet: bool) -> bool {
        let outcome_tx = {
            let mut lifecycle = self.lock();
            if lifecycle.state.is_terminal() {
                return false;
            }
            lifecycle.state = match &outcome {
                Ok(_) => JobState::Succeeded,
                Err(JobError::Cancelled) => JobState::Cancelled,
                Err(_) => JobState::Failed,
            };
            lifecycle.outcome_tx.take()
        };

        match &outcome {
            Ok(_) => debug!(job = %self.id, operation = self.name, "job succeeded"),
            Err(JobError::Cancelled) => debug!(job = %self.id, operation = self.name, "job cancelled"),
            Err(err) => warn!(job = %self.id, operation = self.name, error = %err, "job failed"),
        }

        let _ = self.notify.send(JobNotification::Finished);
        if !quiet {
            let _ = self.notify.send(match &outcome {
                Ok(_) => JobNotification::Succeeded,
                Err(err) => JobNotification::Failed(err.clone()),
            });
        }
        if let Some(tx) = outcome_tx {
            let _ = tx.send(outcome);
        }
        true
    }
}

/// Type-erased control over a running job.
trait JobControl: Send + Sync {
    fn id(&self) -> JobId;
    fn state(&self) -> JobState;
    fn kill(&self, mode: KillMode);
}

impl<T: Send> JobControl for JobShared<T> {
    fn id(&self) -> JobId {
        self.id
    }

    fn state(&self) -> JobState {
        self.lock().state
    }

    fn kill(&self, mode: KillMode) {
        if self.settle(Err(JobError::Cancelled), mode == KillMode::Quiet) {
            self.cancel.cancel();
        }
    }
}

/// Cloneable handle that can observe and kill a job it does not own.
#[derive(Clone)]
pub struct JobHandle {
    control: Arc<dyn JobControl>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.control.id()
    }

    pub fn state(&self) -> JobState {
        self.control.state()
    }

    pub fn kill(&self, mode: KillMode) {
        self.control.kill(mode);
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// A one-shot job executing `Operation<T>`.
///
/// Dropping a job that has not finished kills it quietly.
pub struct Job<T: ResultShape> {
    operation: Operation<T>,
    shared: Arc<JobShared<T>>,
    outcome_rx: Option<oneshot::Receiver<Outcome<T>>>,
}

impl<T: ResultShape> Job<T> {
    pub fn new(operation: Operation<T>) -> Self {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (notify, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let shared = Arc::new(JobShared {
            id: JobId::new(),
            name: operation.name(),
            lifecycle: Mutex::new(Lifecycle {
                state: JobState::Idle,
                outcome_tx: Some(outcome_tx),
            }),
            cancel: CancellationToken::new(),
            notify,
        });
        Self {
            operation,
            shared,
            outcome_rx: Some(outcome_rx),
        }
    }

    pub fn id(&self) -> JobId {
        self.shared.id
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn state(&self) -> JobState {
        self.shared.lock().state
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            control: self.shared.clone(),
        }
    }

    /// Subscribe to lifecycle notifications. Subscribe before `start` to see all.
    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.shared.notify.subscribe()
    }

    /// Build the request and dispatch it on a new task.
    ///
    /// Only an idle job can start. A missing token fails the job rather than
    /// the call.
    pub fn start(&mut self, ctx: &JobContext) -> Result<(), ClientError> {
        let request = {
            let mut lifecycle = self.shared.lock();
            if lifecycle.state != JobState::Idle {
                return Err(ClientError::new(
                    ErrorCategory::Internal,
                    "invalid_state_transition",
                    format!(
                        "job '{}' cannot start while {:?}",
                        self.shared.name, lifecycle.state
                    ),
                ));
            }
            match self
                .operation
                .build_request(&ctx.homeserver, ctx.access_token.as_deref())
            {
                Ok(request) => {
                    lifecycle.state = JobState::Dispatched;
                    request
                }
                Err(err) => {
                    drop(lifecycle);
                    self.shared.settle(Err(err), false);
                    return Ok(());
                }
            }
        };

        debug!(
            job = %self.shared.id,
            operation = self.shared.name,
            method = %request.method,
            path = request.url.path(),
            "dispatching job"
        );

        let shared = self.shared.clone();
        let transport = ctx.transport.clone();
        let timeout = ctx.timeout;
        tokio::spawn(async move {
            let exchange = tokio::time::timeout(timeout, transport.send(request));
            let outcome = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return,
                outcome = exchange => outcome,
            };
            let outcome = match outcome {
                Err(_) => Err(JobError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
                Ok(Err(err)) => Err(JobError::Network {
                    status: None,
                    message: err.to_string(),
                    retry_after_ms: None,
                }),
                Ok(Ok(response)) => interpret::<T>(response),
            };
            shared.settle(outcome, false);
        });
        Ok(())
    }

    pub fn kill(&self, mode: KillMode) {
        self.shared.kill(mode);
    }

    /// Wait for the typed outcome. Cancel-safe.
    ///
    /// A job that was never started is killed quietly. After the outcome has
    /// been taken once, later calls report `Cancelled`.
    pub async fn wait(&mut self) -> Outcome<T> {
        if self.state() == JobState::Idle {
            self.kill(KillMode::Quiet);
        }
        let Some(rx) = self.outcome_rx.as_mut() else {
            return Err(JobError::Cancelled);
        };
        let outcome = rx.await.unwrap_or(Err(JobError::Cancelled));
        self.outcome_rx = None;
        outcome
    }

    /// Consume the job and wait for its typed outcome.
    pub async fn finished(mut self) -> Outcome<T> {
        self.wait().await
    }
}

impl<T: ResultShape> Drop for Job<T> {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            debug!(job = %self.shared.id, operation = self.shared.name, "dropping unfinished job");
            self.kill(KillMode::Quiet);
        }
    }
}

impl<T: ResultShape> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.shared.id)
            .field("operation", &self.operation)
            .field("state", &self.state())
            .finish()
    }
}

fn interpret<T: ResultShape>(response: HttpResponse) -> Outcome<T> {
    let payload = serde_json::from_slice::<Value>(&response.body);
    if !response.is_success() {
        return Err(status_error(response.status, payload.ok()));
    }
    let payload = payload.map_err(|err| JobError::PayloadParse(err.to_string()))?;
    T::bind(&payload)
        .into_result()
        .map_err(JobError::ResultValidation)
}

/// Map a non-success response, reading a Matrix error object when present.
fn status_error(status: u16, payload: Option<Value>) -> JobError {
    let mut errcode: Option<String> = None;
    let mut error: Option<String> = None;
    let mut retry_after_ms: Option<u64> = None;
    if let Some(payload) = &payload {
        bind(
            payload,
            vec![
                field("errcode", &mut errcode),
                field("error", &mut error),
                field("retry_after_ms", &mut retry_after_ms),
            ],
        );
    }

    let message = match (errcode, error) {
        (Some(code), Some(error)) => format!("{code}: {error}"),
        (Some(code), None) => code,
        (None, Some(error)) => error,
        (None, None) => format!("HTTP status {status}"),
    };
    JobError::Network {
        status: Some(status),
        message,
        retry_after_ms,
    }
}
