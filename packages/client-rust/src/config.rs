//! Configuration for the state client.
//!
//! Plain structs with `Default` values and builder-style setters. Hosting
//! runtimes that configure through the environment use
//! [`StateConfig::from_env`].

use std::time::Duration;

use anyhow::Context as _;

/// Prefix of every environment variable read by [`StateConfig::from_env`].
pub const ENV_PREFIX: &str = "FNSTATE_";

/// Client-level configuration shared by every store handle.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Base URL of the state storage service. `None` means the hosting
    /// component has no state capability and every operation reports
    /// `Unsupported`.
    pub state_storage_url: Option<String>,
    /// Upper bound a blocking call waits for its future to resolve.
    pub operation_timeout: Duration,
    /// Deadline attached to every individual backend call.
    pub backend_deadline: Duration,
    /// Outstanding operations per key above which blocking submissions wait.
    pub per_key_watermark: usize,
    /// Retry behaviour for transient backend failures.
    pub retry: RetryConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_storage_url: None,
            operation_timeout: Duration::from_secs(30),
            backend_deadline: Duration::from_secs(10),
            per_key_watermark: 64,
            retry: RetryConfig::default(),
        }
    }
}

impl StateConfig {
    #[must_use]
    pub fn with_state_storage_url(mut self, url: impl Into<String>) -> Self {
        self.state_storage_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backend_deadline(mut self, deadline: Duration) -> Self {
        self.backend_deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_per_key_watermark(mut self, watermark: usize) -> Self {
        self.per_key_watermark = watermark.max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Reads overrides from `FNSTATE_*` environment variables on top of the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    ///
    /// Recognised names (without prefix): `STATE_STORAGE_URL`,
    /// `OPERATION_TIMEOUT_MS`, `BACKEND_DEADLINE_MS`, `PER_KEY_WATERMARK`,
    /// `MAX_RETRIES`, `RETRY_INITIAL_DELAY_MS`, `RETRY_MAX_DELAY_MS`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let millis = |name: &str| -> anyhow::Result<Option<Duration>> {
            get(name)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .with_context(|| format!("{ENV_PREFIX}{name}={raw} is not a number of milliseconds"))
                })
                .transpose()
        };

        let mut config = Self::default();
        if let Some(url) = get("STATE_STORAGE_URL").filter(|url| !url.trim().is_empty()) {
            config.state_storage_url = Some(url.trim().to_string());
        }
        if let Some(timeout) = millis("OPERATION_TIMEOUT_MS")? {
            config.operation_timeout = timeout;
        }
        if let Some(deadline) = millis("BACKEND_DEADLINE_MS")? {
            config.backend_deadline = deadline;
        }
        if let Some(raw) = get("PER_KEY_WATERMARK") {
            let watermark: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PREFIX}PER_KEY_WATERMARK={raw} is not a count"))?;
            config = config.with_per_key_watermark(watermark);
        }
        if let Some(raw) = get("MAX_RETRIES") {
            config.retry.max_retries = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PREFIX}MAX_RETRIES={raw} is not a count"))?;
        }
        if let Some(delay) = millis("RETRY_INITIAL_DELAY_MS")? {
            config.retry.initial_delay = delay;
        }
        if let Some(delay) = millis("RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = delay;
        }
        Ok(config)
    }
}

/// Exponential backoff settings for retried backend calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}
