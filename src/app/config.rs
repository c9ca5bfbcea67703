use std::time::Duration;

use crate::adapters::channel::{Backoff, ChannelOptions, RetryPolicy};
use crate::app::AppError;
use crate::domain::polling::PollIntervals;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMode {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub keba_ip: String,
    pub keba_udp_port: u16,
    pub db_path: String,
    pub response_timeout_ms: u64,
    pub min_send_interval_ms: u64,
    pub max_send_attempts: Option<u32>,
    pub retry_backoff: BackoffMode,
    pub max_backoff_ms: u64,
    pub charging_poll_interval_s: u64,
    pub idle_poll_interval_s: u64,
    pub error_retry_delay_ms: u64,
    pub heartbeat_url: Option<String>,
    pub heartbeat_timeout_ms: u64,
    pub debug_script: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let keba_ip = non_empty(&lookup, "KEBA_IP")
            .ok_or_else(|| AppError::config("KEBA_IP is required"))?;

        let max_send_attempts = parse_optional::<u32, _>(&lookup, "MAX_SEND_ATTEMPTS")?;
        if max_send_attempts == Some(0) {
            return Err(AppError::config(
                "MAX_SEND_ATTEMPTS must be greater than zero",
            ));
        }

        let retry_backoff = match non_empty(&lookup, "RETRY_BACKOFF") {
            None => BackoffMode::Fixed,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "fixed" => BackoffMode::Fixed,
                "exponential" => BackoffMode::Exponential,
                _ => {
                    return Err(AppError::config(
                        "RETRY_BACKOFF must be one of: fixed, exponential",
                    ));
                }
            },
        };

        Ok(Self {
            keba_ip,
            keba_udp_port: parse_or_default(&lookup, "KEBA_UDP_PORT", 7090_u16)?,
            db_path: non_empty(&lookup, "DB_PATH")
                .unwrap_or_else(|| "/var/lib/keba/keba.db".to_string()),
            response_timeout_ms: parse_or_default(&lookup, "RESPONSE_TIMEOUT_MS", 5000_u64)?,
            min_send_interval_ms: parse_or_default(&lookup, "MIN_SEND_INTERVAL_MS", 100_u64)?,
            max_send_attempts,
            retry_backoff,
            max_backoff_ms: parse_or_default(&lookup, "MAX_BACKOFF_MS", 30_000_u64)?,
            charging_poll_interval_s: parse_or_default(
                &lookup,
                "CHARGING_POLL_INTERVAL_S",
                60_u64,
            )?,
            idle_poll_interval_s: parse_or_default(&lookup, "IDLE_POLL_INTERVAL_S", 3600_u64)?,
            error_retry_delay_ms: parse_or_default(&lookup, "ERROR_RETRY_DELAY_MS", 1000_u64)?,
            heartbeat_url: non_empty(&lookup, "HEARTBEAT_URL"),
            heartbeat_timeout_ms: parse_or_default(&lookup, "HEARTBEAT_TIMEOUT_MS", 10_000_u64)?,
            debug_script: non_empty(&lookup, "KEBA_DEBUG_SCRIPT"),
        })
    }

    pub fn channel_options(&self) -> ChannelOptions {
        let backoff = match self.retry_backoff {
            BackoffMode::Fixed => Backoff::Fixed,
            BackoffMode::Exponential => Backoff::Exponential {
                max: Duration::from_millis(self.max_backoff_ms),
            },
        };

        ChannelOptions {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            min_send_interval: Duration::from_millis(self.min_send_interval_ms),
            retry: RetryPolicy {
                max_attempts: self.max_send_attempts,
                backoff,
            },
        }
    }

    pub fn poll_intervals(&self) -> PollIntervals {
        PollIntervals {
            charging: Duration::from_secs(self.charging_poll_interval_s),
            idle: Duration::from_secs(self.idle_poll_interval_s),
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional(lookup, key)?.unwrap_or(default))
}

fn parse_optional<T, F>(lookup: &F, key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(None),
    }
}
