//! Environment-backed configuration for `lattice-smoke`.

use std::{env, time::Duration};

use lattice_client::ClientConfig;
use lattice_core::{ClientCommand, RetryPolicy};
use thiserror::Error;

const DEFAULT_HOMESERVER: &str = "https://matrix.org";
const DEFAULT_RUN_SECONDS: u64 = 60;

/// How the runner authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum LoginMode {
    Password { user: String, password: String },
    Token { user_id: String, access_token: String },
}

impl std::fmt::Debug for LoginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { user, .. } => f.debug_struct("Password").field("user", user).finish(),
            Self::Token { user_id, .. } => f.debug_struct("Token").field("user_id", user_id).finish(),
        }
    }
}

impl LoginMode {
    pub fn into_command(self) -> ClientCommand {
        match self {
            Self::Password { user, password } => ClientCommand::Connect { user, password },
            Self::Token {
                user_id,
                access_token,
            } => ClientCommand::ConnectWithToken {
                user_id,
                access_token,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    pub client: ClientConfig,
    pub login: LoginMode,
    /// How long to print events before disconnecting.
    pub run_for: Duration,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let homeserver = optional_trimmed_env("LATTICE_HOMESERVER", &mut lookup)
            .unwrap_or_else(|| DEFAULT_HOMESERVER.to_owned());
        let mut client = ClientConfig::new(homeserver);

        if let Some(ms) = parse_optional_u64("LATTICE_JOB_TIMEOUT_MS", &mut lookup)? {
            client.job_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_optional_u64("LATTICE_SYNC_TIMEOUT_MS", &mut lookup)? {
            client.sync_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_optional_u32("LATTICE_MAX_SYNC_FAILURES", &mut lookup)? {
            client.retry_policy = RetryPolicy::default().with_max_consecutive_failures(max);
        }
        client.validate().map_err(ConfigError::Client)?;

        let run_for = Duration::from_secs(
            parse_optional_u64("LATTICE_RUN_SECONDS", &mut lookup)?.unwrap_or(DEFAULT_RUN_SECONDS),
        );

        let token = optional_trimmed_env("LATTICE_TOKEN", &mut lookup);
        let login = match token {
            Some(access_token) => LoginMode::Token {
                user_id: optional_trimmed_env("LATTICE_USER_ID", &mut lookup)
                    .ok_or(ConfigError::Missing("LATTICE_USER_ID"))?,
                access_token,
            },
            None => LoginMode::Password {
                user: optional_trimmed_env("LATTICE_USER", &mut lookup)
                    .ok_or(ConfigError::Missing("LATTICE_USER"))?,
                password: lookup("LATTICE_PASSWORD")
                    .filter(|value| !value.is_empty())
                    .ok_or(ConfigError::Missing("LATTICE_PASSWORD"))?,
            },
        };

        Ok(Self {
            client,
            login,
            run_for,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error(transparent)]
    Client(lattice_client::ConfigError),
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_password_login_with_defaults() {
        let cfg = config_from_pairs(&[
            ("LATTICE_HOMESERVER", " https://matrix.example.org "),
            ("LATTICE_USER", "alice"),
            ("LATTICE_PASSWORD", "secret"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.client.homeserver, "https://matrix.example.org");
        assert_eq!(cfg.client.sync_timeout, Duration::from_secs(30));
        assert_eq!(cfg.run_for, Duration::from_secs(DEFAULT_RUN_SECONDS));
        assert_eq!(
            cfg.login,
            LoginMode::Password {
                user: "alice".into(),
                password: "secret".into(),
            }
        );
    }

    #[test]
    fn token_takes_precedence_and_needs_user_id() {
        let cfg = config_from_pairs(&[
            ("LATTICE_TOKEN", "syt_abc"),
            ("LATTICE_USER_ID", "@alice:example.org"),
            ("LATTICE_USER", "alice"),
        ])
        .expect("config should parse");
        assert!(matches!(cfg.login, LoginMode::Token { .. }));

        let err = config_from_pairs(&[("LATTICE_TOKEN", "syt_abc")])
            .expect_err("user id is required with a token");
        assert_eq!(err, ConfigError::Missing("LATTICE_USER_ID"));
    }

    #[test]
    fn applies_timeout_and_failure_tuning() {
        let cfg = config_from_pairs(&[
            ("LATTICE_USER", "alice"),
            ("LATTICE_PASSWORD", "secret"),
            ("LATTICE_SYNC_TIMEOUT_MS", "10000"),
            ("LATTICE_JOB_TIMEOUT_MS", "20000"),
            ("LATTICE_MAX_SYNC_FAILURES", "3"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.client.sync_timeout, Duration::from_millis(10_000));
        assert_eq!(cfg.client.job_timeout, Duration::from_millis(20_000));
        assert_eq!(cfg.client.retry_policy.max_consecutive_failures(), 3);
    }

    #[test]
    fn rejects_sync_hold_at_or_above_job_timeout() {
        let err = config_from_pairs(&[
            ("LATTICE_USER", "alice"),
            ("LATTICE_PASSWORD", "secret"),
            ("LATTICE_SYNC_TIMEOUT_MS", "20000"),
            ("LATTICE_JOB_TIMEOUT_MS", "20000"),
        ])
        .expect_err("hold must be below job timeout");
        assert!(matches!(err, ConfigError::Client(_)));
    }

    #[test]
    fn rejects_unparseable_numbers() {
        let err = config_from_pairs(&[("LATTICE_SYNC_TIMEOUT_MS", "soon")])
            .expect_err("timeout must be numeric");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "LATTICE_SYNC_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn password_login_requires_credentials() {
        assert_eq!(
            config_from_pairs(&[]).expect_err("user is required"),
            ConfigError::Missing("LATTICE_USER")
        );
    }
}
