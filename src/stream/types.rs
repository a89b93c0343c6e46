use crate::error::AppError;
use crate::stream::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_WINDOW_CAPACITY: usize = 200;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_MAX_ATTEMPT: u32 = 30;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 << 20;
pub const DEFAULT_DECODE_FAILURE_POLICY: DecodeFailurePolicy = DecodeFailurePolicy::Drop;
pub const MIN_WINDOW_CAPACITY: usize = 1;
pub const MAX_WINDOW_CAPACITY: usize = 10_000;
pub const MIN_BACKOFF_BASE_MS: u64 = 1;
pub const MAX_BACKOFF_BASE_MS: u64 = 60_000;
pub const MAX_BACKOFF_MAX_MS: u64 = 600_000;
pub const MIN_BACKOFF_MAX_ATTEMPT: u32 = 1;
pub const MAX_BACKOFF_MAX_ATTEMPT: u32 = 62;
pub const MIN_MAX_MESSAGE_BYTES: usize = 1 << 10;
pub const MAX_MAX_MESSAGE_BYTES: usize = 64 << 20;

pub const TELEMETRY_URL_ENV: &str = "PLANT_TELEMETRY_URL";
pub const ALERTS_URL_ENV: &str = "PLANT_ALERTS_URL";
pub const WINDOW_CAPACITY_ENV: &str = "PLANT_WINDOW_CAPACITY";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    #[serde(rename_all = "camelCase")]
    Reconnecting { attempt: u32, delay_ms: u64 },
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// What happens to a frame that does not normalize into a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Count and log it.
    Drop,
    /// Count and log it, and keep it as the store's last rejected frame.
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusSnapshot {
    pub state: ConnectionState,
    pub endpoint: String,
    pub connect_attempts: u64,
    pub frames_received: u64,
    pub reason: Option<String>,
}

impl StreamStatusSnapshot {
    pub fn idle(endpoint: String) -> Self {
        Self {
            state: ConnectionState::Idle,
            endpoint,
            connect_attempts: 0,
            frames_received: 0,
            reason: Some("stream idle".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientArgs {
    pub telemetry_url: Option<String>,
    pub alerts_url: Option<String>,
    pub window_capacity: Option<usize>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub backoff_max_attempt: Option<u32>,
    pub max_message_bytes: Option<usize>,
    pub decode_failure_policy: Option<DecodeFailurePolicy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub telemetry_url: String,
    pub alerts_url: String,
    pub window_capacity: usize,
    pub backoff: BackoffPolicy,
    pub max_message_bytes: usize,
    pub decode_failure_policy: DecodeFailurePolicy,
}

impl ClientArgs {
    pub fn from_env() -> Result<Self, AppError> {
        let window_capacity = match env_value(WINDOW_CAPACITY_ENV) {
            Some(value) => Some(value.parse::<usize>()?),
            None => None,
        };

        Ok(Self {
            telemetry_url: env_value(TELEMETRY_URL_ENV),
            alerts_url: env_value(ALERTS_URL_ENV),
            window_capacity,
            ..Self::default()
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, AppError> {
        let contents = std::fs::read_to_string(path)?;
        let args = serde_json::from_str(&contents)?;
        Ok(args)
    }

    /// Fields set on `other` win over fields set on `self`.
    pub fn overlay(self, other: ClientArgs) -> Self {
        Self {
            telemetry_url: other.telemetry_url.or(self.telemetry_url),
            alerts_url: other.alerts_url.or(self.alerts_url),
            window_capacity: other.window_capacity.or(self.window_capacity),
            backoff_base_ms: other.backoff_base_ms.or(self.backoff_base_ms),
            backoff_max_ms: other.backoff_max_ms.or(self.backoff_max_ms),
            backoff_max_attempt: other.backoff_max_attempt.or(self.backoff_max_attempt),
            max_message_bytes: other.max_message_bytes.or(self.max_message_bytes),
            decode_failure_policy: other.decode_failure_policy.or(self.decode_failure_policy),
        }
    }

    pub fn normalize(self) -> Result<ClientConfig, AppError> {
        let telemetry_url = normalize_stream_url("telemetryUrl", self.telemetry_url)?;
        let alerts_url = normalize_stream_url("alertsUrl", self.alerts_url)?;

        let window_capacity = self.window_capacity.unwrap_or(DEFAULT_WINDOW_CAPACITY);
        if !(MIN_WINDOW_CAPACITY..=MAX_WINDOW_CAPACITY).contains(&window_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "windowCapacity must be between {MIN_WINDOW_CAPACITY} and {MAX_WINDOW_CAPACITY}"
            )));
        }

        let base_delay_ms = self.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS);
        if !(MIN_BACKOFF_BASE_MS..=MAX_BACKOFF_BASE_MS).contains(&base_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "backoffBaseMs must be between {MIN_BACKOFF_BASE_MS} and {MAX_BACKOFF_BASE_MS}"
            )));
        }

        let max_delay_ms = self.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS);
        if !(base_delay_ms..=MAX_BACKOFF_MAX_MS).contains(&max_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "backoffMaxMs must be between backoffBaseMs ({base_delay_ms}) and {MAX_BACKOFF_MAX_MS}"
            )));
        }

        let max_attempt = self
            .backoff_max_attempt
            .unwrap_or(DEFAULT_BACKOFF_MAX_ATTEMPT);
        if !(MIN_BACKOFF_MAX_ATTEMPT..=MAX_BACKOFF_MAX_ATTEMPT).contains(&max_attempt) {
            return Err(AppError::InvalidArgument(format!(
                "backoffMaxAttempt must be between {MIN_BACKOFF_MAX_ATTEMPT} and {MAX_BACKOFF_MAX_ATTEMPT}"
            )));
        }

        let max_message_bytes = self.max_message_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        if !(MIN_MAX_MESSAGE_BYTES..=MAX_MAX_MESSAGE_BYTES).contains(&max_message_bytes) {
            return Err(AppError::InvalidArgument(format!(
                "maxMessageBytes must be between {MIN_MAX_MESSAGE_BYTES} and {MAX_MAX_MESSAGE_BYTES}"
            )));
        }

        Ok(ClientConfig {
            telemetry_url,
            alerts_url,
            window_capacity,
            backoff: BackoffPolicy {
                base_delay_ms,
                max_delay_ms,
                max_attempt,
            },
            max_message_bytes,
            decode_failure_policy: self
                .decode_failure_policy
                .unwrap_or(DEFAULT_DECODE_FAILURE_POLICY),
        })
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_stream_url(field: &str, value: Option<String>) -> Result<String, AppError> {
    let url = value.unwrap_or_default().trim().to_string();
    if url.is_empty() {
        return Err(AppError::InvalidArgument(format!("{field} is required")));
    }

    let lowercase = url.to_ascii_lowercase();
    if !(lowercase.starts_with("ws://") || lowercase.starts_with("wss://")) {
        return Err(AppError::InvalidArgument(format!(
            "{field} must use the ws:// or wss:// scheme"
        )));
    }

    Ok(url)
}
