use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::images::ImageLimits;
use crate::provider::DEFAULT_GEMINI_API_BASE;
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TEMPERATURE: f64 = 0.1;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Everything the pipeline needs to talk to the model. Built once by the
/// caller and injected; nothing below reads the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub temperature: f64,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub image_limits: ImageLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            image_limits: ImageLimits::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(non_empty_env)
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();
        config.api_key = get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY"));
        if let Some(base) = get("GEMINI_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("LOOMCHECK_MODEL") {
            config.model = model;
        }
        if let Some(raw) = get("LOOMCHECK_REQUEST_TIMEOUT") {
            let seconds = raw
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite() && *value > 0.0)
                .with_context(|| {
                    format!("LOOMCHECK_REQUEST_TIMEOUT must be a positive number of seconds, got {raw:?}")
                })?;
            config.request_timeout = Duration::from_secs_f64(seconds);
        }
        if let Some(raw) = get("LOOMCHECK_MAX_RETRIES") {
            config.retry.max_retries = raw.parse::<u32>().with_context(|| {
                format!("LOOMCHECK_MAX_RETRIES must be a non-negative integer, got {raw:?}")
            })?;
        }
        if let Some(raw) = get("LOOMCHECK_RETRY_BASE_MS") {
            let millis = raw.parse::<u64>().with_context(|| {
                format!("LOOMCHECK_RETRY_BASE_MS must be a non-negative integer, got {raw:?}")
            })?;
            config.retry.base_delay = Duration::from_millis(millis);
        }
        Ok(config)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = Some(api_key.trim().to_string()).filter(|value| !value.is_empty());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
