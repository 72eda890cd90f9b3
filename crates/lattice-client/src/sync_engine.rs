//! Single-flight long-poll loop with bounded retry.

use std::{pin::Pin, time::Duration};

use lattice_core::{JobError, RetryPolicy, SyncIncrement};
use tokio::{
    sync::broadcast,
    time::{Sleep, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    catalog::{self, SyncResult},
    job::{Job, JobContext, JobNotification, KillMode},
};

/// Include up to 100 timeline events per room.
pub const DEFAULT_SYNC_FILTER: &str = r#"{"room":{"timeline":{"limit":100}}}"#;

#[derive(Debug)]
pub enum SyncProgress {
    /// A round succeeded. Apply it, then `issue` the next round.
    Increment(SyncIncrement),
    /// A round failed. When not fatal a backoff is armed.
    Failed {
        error: JobError,
        /// Consecutive failures including this one.
        attempt: u32,
        fatal: bool,
        retry_in: Option<Duration>,
    },
    /// Backoff elapsed. `issue` the next round.
    RetryDue,
    /// The in-flight round was cancelled.
    Stopped,
}

pub struct SyncEngine {
    filter: String,
    hold: Duration,
    policy: RetryPolicy,
    since: Option<String>,
    issued: u64,
    consecutive_failures: u32,
    in_flight: Option<(u64, Job<SyncResult>)>,
    backoff: Option<Pin<Box<Sleep>>>,
    running: bool,
}

impl SyncEngine {
    pub fn new(filter: impl Into<String>, hold: Duration, policy: RetryPolicy) -> Self {
        Self {
            filter: filter.into(),
            hold,
            policy,
            since: None,
            issued: 0,
            consecutive_failures: 0,
            in_flight: None,
            backoff: None,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn since(&self) -> Option<&str> {
        self.since.as_deref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Start the loop from the stored resumption token.
    ///
    /// Failures counted against an earlier session do not carry over.
    pub fn start(&mut self, ctx: &JobContext) {
        info!(since = ?self.since, hold_ms = self.hold.as_millis() as u64, "sync started");
        self.consecutive_failures = 0;
        self.backoff = None;
        self.running = true;
        self.issue(ctx);
    }

    /// Issue the next round unless one is already in flight or backing off.
    pub fn issue(&mut self, ctx: &JobContext) {
        if !self.running || self.in_flight.is_some() || self.backoff.is_some() {
            return;
        }

        self.issued += 1;
        let seq = self.issued;
        let mut job = Job::new(catalog::sync(
            &self.filter,
            self.hold.as_millis() as u64,
            self.since.as_deref(),
        ));
        debug!(seq, job = %job.id(), since = ?self.since, "issuing sync round");
        if let Err(err) = job.start(ctx) {
            // Fresh jobs are always idle.
            warn!(seq, error = %err, "sync job refused to start");
            return;
        }
        self.in_flight = Some((seq, job));
    }

    /// Notifications for the in-flight round, if any.
    pub fn subscribe_in_flight(&self) -> Option<broadcast::Receiver<JobNotification>> {
        self.in_flight.as_ref().map(|(_, job)| job.subscribe())
    }

    /// Wait for the next progress report. Cancel-safe; pending while idle.
    pub async fn next(&mut self) -> SyncProgress {
        if let Some(backoff) = self.backoff.as_mut() {
            backoff.await;
            self.backoff = None;
            return SyncProgress::RetryDue;
        }

        let Some((seq, job)) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };
        let outcome = job.wait().await;
        let seq = *seq;
        self.in_flight = None;
        self.settle(seq, outcome)
    }

    fn settle(&mut self, seq: u64, outcome: Result<SyncResult, JobError>) -> SyncProgress {
        match outcome {
            Ok(result) => {
                self.consecutive_failures = 0;
                self.since = Some(result.next_batch.clone());
                debug!(seq, next_batch = %result.next_batch, "sync round completed");
                SyncProgress::Increment(SyncIncrement::parse(seq, result.next_batch, &result.rooms))
            }
            Err(JobError::Cancelled) => {
                self.running = false;
                SyncProgress::Stopped
            }
            Err(error) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let attempt = self.consecutive_failures;
                let fatal = error.is_auth_failure() || !self.policy.allows_retry_after(attempt);
                if fatal {
                    warn!(seq, attempt, error = %error, "sync failed fatally");
                    self.running = false;
                    return SyncProgress::Failed {
                        error,
                        attempt,
                        fatal,
                        retry_in: None,
                    };
                }

                let delay = self
                    .policy
                    .delay_for_attempt(attempt - 1, error.retry_after_ms());
                warn!(seq, attempt, error = %error, retry_in_ms = delay.as_millis() as u64, "sync failed, backing off");
                self.backoff = Some(Box::pin(sleep(delay)));
                SyncProgress::Failed {
                    error,
                    attempt,
                    fatal,
                    retry_in: Some(delay),
                }
            }
        }
    }

    /// Kill the in-flight round quietly and drop any pending backoff.
    pub fn stop(&mut self) {
        if let Some((seq, job)) = self.in_flight.take() {
            debug!(seq, job = %job.id(), "stopping sync round");
            job.kill(KillMode::Quiet);
        }
        self.backoff = None;
        self.running = false;
    }

    /// Stop and forget the resumption token and failure count.
    pub fn reset(&mut self) {
        self.stop();
        self.since = None;
        self.consecutive_failures = 0;
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("since", &self.since)
            .field("issued", &self.issued)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("in_flight", &self.in_flight.as_ref().map(|(seq, _)| *seq))
            .field("backing_off", &self.backoff.is_some())
            .field("running", &self.running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::time::timeout;
    use url::Url;

    use super::*;
    use crate::{
        job::DEFAULT_JOB_TIMEOUT,
        testing::{Reply, ScriptedTransport},
    };

    fn context(transport: Arc<ScriptedTransport>) -> JobContext {
        JobContext {
            homeserver: Url::parse("https://matrix.example.org").expect("valid homeserver"),
            access_token: Some("abc".into()),
            transport,
            timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(
            DEFAULT_SYNC_FILTER,
            Duration::from_secs(30),
            RetryPolicy::new(100, 1_000).with_max_consecutive_failures(2),
        )
    }

    async fn next(engine: &mut SyncEngine) -> SyncProgress {
        timeout(Duration::from_secs(1), engine.next())
            .await
            .expect("sync progress should arrive")
    }

    fn sync_reply(next_batch: &str) -> Reply {
        Reply::json(
            200,
            json!({
                "next_batch": next_batch,
                "rooms": { "join": { "!r:example.org": {
                    "timeline": { "events": [
                        { "event_id": "$1", "type": "m.room.message", "sender": "@bob:example.org",
                          "content": { "msgtype": "m.text", "body": "hi" } }
                    ] }
                } } }
            }),
        )
    }

    #[tokio::test]
    async fn single_flight_and_resumes_from_next_batch() {
        let transport = ScriptedTransport::new();
        transport.push("/sync", sync_reply("s1"));
        transport.push("/sync", sync_reply("s2"));
        let ctx = context(transport.clone());
        let mut engine = engine();

        engine.start(&ctx);
        engine.issue(&ctx);
        engine.issue(&ctx);

        let first = match next(&mut engine).await {
            SyncProgress::Increment(increment) => increment,
            other => panic!("unexpected progress: {other:?}"),
        };
        assert_eq!(first.seq, 1);
        assert_eq!(first.next_batch, "s1");
        assert_eq!(first.rooms.len(), 1);
        assert_eq!(transport.requests_to("/sync").len(), 1);

        engine.issue(&ctx);
        match next(&mut engine).await {
            SyncProgress::Increment(increment) => assert_eq!(increment.seq, 2),
            other => panic!("unexpected progress: {other:?}"),
        }

        let requests = transport.requests_to("/sync");
        assert_eq!(requests.len(), 2);
        assert!(requests[0].url.query().is_some_and(|q| !q.contains("since=")));
        assert!(requests[1].url.query().is_some_and(|q| q.contains("since=s1")));
        assert!(requests[1].url.query().is_some_and(|q| q.contains("timeout=30000")));
        assert_eq!(engine.since(), Some("s2"));
    }

    #[tokio::test]
    async fn stop_cancels_round_quietly() {
        let transport = ScriptedTransport::new();
        let ctx = context(transport.clone());
        let mut engine = engine();

        engine.start(&ctx);
        let mut notifications = engine.subscribe_in_flight().expect("round in flight");
        transport.wait_for_requests("/sync", 1).await;
        engine.stop();

        assert!(!engine.is_running());
        assert_eq!(
            timeout(Duration::from_secs(1), notifications.recv())
                .await
                .expect("notification should arrive")
                .expect("channel open"),
            JobNotification::Finished
        );
        assert_eq!(
            timeout(Duration::from_secs(1), notifications.recv())
                .await
                .expect("channel should close"),
            Err(broadcast::error::RecvError::Closed)
        );
        assert!(timeout(Duration::from_millis(50), engine.next()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_then_gives_up_after_bound() {
        let transport = ScriptedTransport::new();
        for _ in 0..3 {
            transport.push("/sync", Reply::json(502, json!({})));
        }
        let ctx = context(transport.clone());
        let mut engine = engine();
        engine.start(&ctx);

        match next(&mut engine).await {
            SyncProgress::Failed {
                attempt, fatal, retry_in, ..
            } => {
                assert_eq!(attempt, 1);
                assert!(!fatal);
                assert_eq!(retry_in, Some(Duration::from_millis(100)));
            }
            other => panic!("unexpected progress: {other:?}"),
        }
        engine.issue(&ctx);
        assert_eq!(transport.requests_to("/sync").len(), 1);
        assert!(matches!(next(&mut engine).await, SyncProgress::RetryDue));

        engine.issue(&ctx);
        match next(&mut engine).await {
            SyncProgress::Failed { attempt, retry_in, .. } => {
                assert_eq!(attempt, 2);
                assert_eq!(retry_in, Some(Duration::from_millis(200)));
            }
            other => panic!("unexpected progress: {other:?}"),
        }
        assert!(matches!(next(&mut engine).await, SyncProgress::RetryDue));

        engine.issue(&ctx);
        match next(&mut engine).await {
            SyncProgress::Failed {
                attempt, fatal, retry_in, ..
            } => {
                assert_eq!(attempt, 3);
                assert!(fatal);
                assert_eq!(retry_in, None);
            }
            other => panic!("unexpected progress: {other:?}"),
        }
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn unauthorized_is_fatal_immediately() {
        let transport = ScriptedTransport::new();
        transport.push(
            "/sync",
            Reply::json(401, json!({ "errcode": "M_UNKNOWN_TOKEN", "error": "Invalid token" })),
        );
        let ctx = context(transport);
        let mut engine = engine();
        engine.start(&ctx);

        match next(&mut engine).await {
            SyncProgress::Failed { error, attempt, fatal, .. } => {
                assert!(error.is_auth_failure());
                assert_eq!(attempt, 1);
                assert!(fatal);
            }
            other => panic!("unexpected progress: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_stretches_backoff() {
        let transport = ScriptedTransport::new();
        transport.push(
            "/sync",
            Reply::json(429, json!({ "errcode": "M_LIMIT_EXCEEDED", "retry_after_ms": 700 })),
        );
        let ctx = context(transport);
        let mut engine = engine();
        engine.start(&ctx);

        match next(&mut engine).await {
            SyncProgress::Failed { retry_in, fatal, .. } => {
                assert!(!fatal);
                assert_eq!(retry_in, Some(Duration::from_millis(700)));
            }
            other => panic!("unexpected progress: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_clears_failure_count_but_keeps_token() {
        let transport = ScriptedTransport::new();
        transport.push("/sync", sync_reply("s1"));
        transport.push("/sync", Reply::json(502, json!({})));
        transport.push("/sync", Reply::json(502, json!({})));
        let ctx = context(transport.clone());
        let mut engine = engine();
        engine.start(&ctx);
        assert!(matches!(next(&mut engine).await, SyncProgress::Increment(_)));

        engine.issue(&ctx);
        assert!(matches!(next(&mut engine).await, SyncProgress::Failed { attempt: 1, .. }));
        assert_eq!(engine.consecutive_failures(), 1);

        engine.stop();
        engine.start(&ctx);
        assert_eq!(engine.consecutive_failures(), 0);
        match next(&mut engine).await {
            SyncProgress::Failed { attempt, fatal, .. } => {
                assert_eq!(attempt, 1);
                assert!(!fatal);
            }
            other => panic!("unexpected progress: {other:?}"),
        }
        let requests = transport.requests_to("/sync");
        assert_eq!(requests.len(), 3);
        assert!(requests[2].url.query().is_some_and(|q| q.contains("since=s1")));
    }

    #[tokio::test]
    async fn reset_forgets_resumption_token() {
        let transport = ScriptedTransport::new();
        transport.push("/sync", sync_reply("s1"));
        let ctx = context(transport);
        let mut engine = engine();
        engine.start(&ctx);
        assert!(matches!(next(&mut engine).await, SyncProgress::Increment(_)));
        assert_eq!(engine.since(), Some("s1"));

        engine.reset();
        assert_eq!(engine.since(), None);
        assert!(!engine.is_running());
    }
}
