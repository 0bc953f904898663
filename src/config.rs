use crate::poller::PollOptions;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Remote API
    pub api_base_url: String,
    pub http_timeout_secs: u64,

    // Local store (None = no persistence backend)
    pub database_path: Option<PathBuf>,

    // Content
    pub site_code: String,
    pub fallback_hl: String,

    // Translation polling
    pub poll_max_attempts: u32,
    pub poll_interval_ms: u64,
    pub require_cron_key: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_base_url = std::env::var("API_BASE_URL").context("API_BASE_URL not set")?;
        if api_base_url.trim().is_empty() {
            anyhow::bail!("API_BASE_URL is empty");
        }

        Ok(Self {
            api_base_url: api_base_url.trim().to_string(),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),

            database_path: std::env::var("DATABASE_PATH")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),

            site_code: std::env::var("SITE_CODE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "myfriends".to_string()),
            fallback_hl: std::env::var("FALLBACK_HL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "eng00".to_string()),

            poll_max_attempts: std::env::var("POLL_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(5),
            poll_interval_ms: std::env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            require_cron_key: std::env::var("REQUIRE_CRON_KEY")
                .ok()
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
        })
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            max_attempts: self.poll_max_attempts,
            interval: Duration::from_millis(self.poll_interval_ms),
            require_job_token: self.require_cron_key,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
