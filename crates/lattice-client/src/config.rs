//! Runtime tuning for one client connection.

use std::time::Duration;

use lattice_core::RetryPolicy;
use thiserror::Error;
use url::Url;

use crate::{job::DEFAULT_JOB_TIMEOUT, sync_engine::DEFAULT_SYNC_FILTER};

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMMAND_BUFFER: usize = 128;
pub const DEFAULT_EVENT_BUFFER: usize = 512;
pub const DEFAULT_PAGINATION_CAP: u16 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the homeserver, e.g. `https://matrix.example.org`.
    pub homeserver: String,
    /// Timeout applied to every job.
    pub job_timeout: Duration,
    /// How long the server may hold a sync request.
    pub sync_timeout: Duration,
    /// JSON filter sent with every sync request.
    pub sync_filter: String,
    /// Sync backoff and the bound on consecutive failures.
    pub retry_policy: RetryPolicy,
    pub command_buffer: usize,
    pub event_buffer: usize,
    /// Upper bound for one back-pagination request.
    pub pagination_cap: u16,
}

impl ClientConfig {
    pub fn new(homeserver: impl Into<String>) -> Self {
        Self {
            homeserver: homeserver.into(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            sync_filter: DEFAULT_SYNC_FILTER.to_owned(),
            retry_policy: RetryPolicy::default(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            pagination_cap: DEFAULT_PAGINATION_CAP,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Check the configuration and return the parsed homeserver URL.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let homeserver = Url::parse(self.homeserver.trim()).map_err(|err| ConfigError::InvalidValue {
            key: "homeserver",
            value: self.homeserver.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(homeserver.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "homeserver",
                value: self.homeserver.clone(),
                reason: "scheme must be http or https".to_owned(),
            });
        }
        if homeserver.cannot_be_a_base() {
            return Err(ConfigError::InvalidValue {
                key: "homeserver",
                value: self.homeserver.clone(),
                reason: "must be a base URL".to_owned(),
            });
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "job_timeout",
                value: "0".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.sync_timeout >= self.job_timeout {
            return Err(ConfigError::SyncHoldTooLong {
                sync_timeout_ms: self.sync_timeout.as_millis() as u64,
                job_timeout_ms: self.job_timeout.as_millis() as u64,
            });
        }
        if let Err(err) = serde_json::from_str::<serde_json::Value>(&self.sync_filter) {
            return Err(ConfigError::InvalidValue {
                key: "sync_filter",
                value: self.sync_filter.clone(),
                reason: err.to_string(),
            });
        }
        if self.pagination_cap == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pagination_cap",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(homeserver)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// The sync hold must end before the job timeout fires.
    #[error("sync timeout {sync_timeout_ms}ms must be below job timeout {job_timeout_ms}ms")]
    SyncHoldTooLong {
        sync_timeout_ms: u64,
        job_timeout_ms: u64,
    },
}
