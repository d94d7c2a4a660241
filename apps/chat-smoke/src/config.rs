//! Environment-backed configuration for `chat-smoke`.

use std::{env, time::Duration};

use chat_session::chat_core::SessionConfig;
use thiserror::Error;

const DEFAULT_USER_ID: &str = "@alice";
const DEFAULT_RUN_MS: u64 = 12_000;

/// Runtime configuration used by the smoke run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Session tuning forwarded to `ChatSession::new`.
    pub session: SessionConfig,
    /// User the session acts as.
    pub user_id: String,
    /// How long to keep polling before printing the final timeline.
    pub run_ms: u64,
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
        let defaults = SessionConfig::default();

        let poll_interval_ms = parse_positive_u64(
            "CHAT_SMOKE_POLL_INTERVAL_MS",
            defaults.poll_interval_ms,
            &mut lookup,
        )?;
        let history_page_size = parse_positive_u16(
            "CHAT_SMOKE_HISTORY_PAGE_SIZE",
            defaults.history_page_size,
            &mut lookup,
        )?;
        let history_pacing_ms = parse_positive_u64(
            "CHAT_SMOKE_HISTORY_PACING_MS",
            defaults.history_pacing_ms,
            &mut lookup,
        )?;
        let send_pacing_ms = parse_positive_u64(
            "CHAT_SMOKE_SEND_PACING_MS",
            defaults.send_pacing_ms,
            &mut lookup,
        )?;
        let run_ms = parse_positive_u64("CHAT_SMOKE_RUN_MS", DEFAULT_RUN_MS, &mut lookup)?;
        let user_id = optional_trimmed_env("CHAT_SMOKE_USER", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());

        Ok(Self {
            session: SessionConfig {
                poll_interval_ms,
                history_page_size,
                history_pacing_ms,
                send_pacing_ms,
                ..defaults
            },
            user_id,
            run_ms,
        })
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_ms)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_positive_u64<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "must be at least 1".to_owned(),
        }),
        Ok(parsed) => Ok(parsed),
        Err(err) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        }),
    }
}

fn parse_positive_u16<F>(
    key: &'static str,
    default: u16,
    lookup: &mut F,
) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let parsed = parse_positive_u64(key, u64::from(default), lookup)?;
    u16::try_from(parsed).map_err(|err| ConfigError::InvalidValue {
        key,
        value: parsed.to_string(),
        reason: err.to_string(),
    })
}
