use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::{Client, Error, Result, Transport};

/// Settings consumed by the client.
///
/// `Settings` is plain data so it can be produced by any loader: deserialized from a settings
/// file (durations are fractional seconds), read from the environment with
/// [`Settings::from_env`], or built in code. Missing fields take their defaults.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the ingestion API.
    pub endpoint: String,
    /// Explicit on/off switch. When unset, the client is enabled iff an API key is present.
    pub enabled: Option<bool>,
    /// Project API key, sent in the request body and as a bearer token.
    pub api_key: Option<String>,
    /// Project id. Informational only.
    pub project_id: Option<String>,
    /// Per-request timeout.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub client_timeout: Duration,
    /// A send is due once this many events are buffered.
    pub batch_size: usize,
    /// A send is due once this long has passed since the last send.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub batch_interval: Duration,
    /// Retries per request on transport errors, 429 and 5xx. `0` disables retrying.
    pub default_retries: u32,
    /// Initial retry backoff, doubled on every attempt.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub retry_interval: Duration,
    /// Upper bound for a single retry backoff.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_retry_delay: Duration,
    /// Send capture events in one `/batch` request instead of one `/capture` request each.
    pub batched: bool,
    /// Number of worker tasks.
    pub num_workers: usize,
    /// Cadence at which idle workers re-check the flush policy.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub upkeep_interval: Duration,
    /// Buffer and drain as usual but never send requests.
    pub dryrun: bool,
    /// Log routine activity at `info` instead of `debug`.
    pub debug_enabled: bool,
    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// How long `stop()` waits for workers and in-flight sends before cancelling them.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub shutdown_timeout: Duration,
}

impl Settings {
    /// Default value for [`Settings::endpoint`].
    pub const DEFAULT_ENDPOINT: &'static str = "https://app.posthog.com";

    /// Load settings from `POSTHOG_*` environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSetting`] if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Settings> {
        Settings::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through `lookup`, which maps a `POSTHOG_*` variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings> {
        let mut settings = Settings::default();
        let var = |name: &'static str| lookup(name).map(|value| (name, value));

        if let Some((_, value)) = var("POSTHOG_ENDPOINT") {
            settings.endpoint = value;
        }
        if let Some((name, value)) = var("POSTHOG_ENABLED") {
            settings.enabled = Some(parse_bool(name, value)?);
        }
        if let Some((_, value)) = var("POSTHOG_API_KEY") {
            settings.api_key = Some(value);
        }
        if let Some((_, value)) = var("POSTHOG_PROJECT_ID") {
            settings.project_id = Some(value);
        }
        if let Some((name, value)) = var("POSTHOG_CLIENT_TIMEOUT") {
            settings.client_timeout = parse_seconds(name, value)?;
        }
        if let Some((name, value)) = var("POSTHOG_BATCH_SIZE") {
            settings.batch_size = parse(name, value)?;
        }
        if let Some((name, value)) = var("POSTHOG_BATCH_INTERVAL") {
            settings.batch_interval = parse_seconds(name, value)?;
        }
        if let Some((name, value)) = var("POSTHOG_DEFAULT_RETRIES") {
            settings.default_retries = parse(name, value)?;
        }
        if let Some((name, value)) = var("POSTHOG_BATCHED") {
            settings.batched = parse_bool(name, value)?;
        }
        if let Some((name, value)) = var("POSTHOG_NUM_WORKERS") {
            settings.num_workers = parse(name, value)?;
        }
        if let Some((name, value)) = var("POSTHOG_UPKEEP_INTERVAL") {
            settings.upkeep_interval = parse_seconds(name, value)?;
        }
        if let Some((name, value)) = var("POSTHOG_DRYRUN") {
            settings.dryrun = parse_bool(name, value)?;
        }
        if let Some((name, value)) = var("POSTHOG_DEBUG_ENABLED") {
            settings.debug_enabled = parse_bool(name, value)?;
        }

        Ok(settings)
    }

    /// Whether the client should run: not explicitly disabled, and both an API key and an
    /// endpoint are configured.
    pub fn is_enabled(&self) -> bool {
        let has_api_key = self.api_key.as_deref().is_some_and(|key| !key.is_empty());
        self.enabled.unwrap_or(true) && has_api_key && !self.endpoint.is_empty()
    }

    /// Level used for routine (non-warning) log messages.
    pub(crate) fn routine_log_level(&self) -> log::Level {
        if self.debug_enabled {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            endpoint: Settings::DEFAULT_ENDPOINT.to_owned(),
            enabled: None,
            api_key: None,
            project_id: None,
            client_timeout: Duration::from_secs(60),
            batch_size: 100,
            batch_interval: Duration::from_secs(60),
            default_retries: 3,
            retry_interval: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
            batched: true,
            num_workers: 1,
            upkeep_interval: Duration::from_millis(100),
            dryrun: false,
            debug_enabled: false,
            pool_max_idle_per_host: 10,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

fn parse<T: FromStr>(name: &'static str, value: String) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidSetting { name, value })
}

fn parse_bool(name: &'static str, value: String) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidSetting { name, value }),
    }
}

fn parse_seconds(name: &'static str, value: String) -> Result<Duration> {
    let seconds: f64 = parse(name, value.clone())?;
    Duration::try_from_secs_f64(seconds).map_err(|_| Error::InvalidSetting { name, value })
}

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use posthog_batch::ClientConfig;
/// # use std::time::Duration;
/// let client = ClientConfig::from_api_key("phc_key")
///     .batch_size(50)
///     .batch_interval(Duration::from_secs(10))
///     .to_client();
/// ```
pub struct ClientConfig {
    pub(crate) settings: Settings,
    pub(crate) transport: Option<Arc<dyn Transport>>,
}

impl ClientConfig {
    /// Create a default configuration using the specified API key.
    ///
    /// ```
    /// # use posthog_batch::ClientConfig;
    /// ClientConfig::from_api_key("phc_key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig::from_settings(Settings {
            api_key: Some(api_key.into()),
            ..Settings::default()
        })
    }

    /// Create a configuration from loaded settings.
    pub fn from_settings(settings: Settings) -> Self {
        ClientConfig {
            settings,
            transport: None,
        }
    }

    /// Create a configuration from `POSTHOG_*` environment variables. See [`Settings::from_env`].
    pub fn from_env() -> Result<Self> {
        Settings::from_env().map(ClientConfig::from_settings)
    }

    /// Settings this configuration will run with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Override the ingestion API base URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.settings.endpoint = endpoint.into();
        self
    }

    /// Explicitly enable or disable the client.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.settings.enabled = Some(enabled);
        self
    }

    /// Set the project id.
    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.settings.project_id = Some(project_id.into());
        self
    }

    /// Set the per-request timeout.
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.settings.client_timeout = timeout;
        self
    }

    /// Set the number of buffered events that makes a send due.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.settings.batch_size = batch_size;
        self
    }

    /// Set the time since the last send that makes a send due.
    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.settings.batch_interval = interval;
        self
    }

    /// Set the number of retries per request. `0` disables retrying.
    pub fn default_retries(mut self, retries: u32) -> Self {
        self.settings.default_retries = retries;
        self
    }

    /// Set the initial retry backoff.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.settings.retry_interval = interval;
        self
    }

    /// Send capture events in batches (`true`) or one request per event (`false`).
    pub fn batched(mut self, batched: bool) -> Self {
        self.settings.batched = batched;
        self
    }

    /// Set the default number of worker tasks.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.settings.num_workers = num_workers;
        self
    }

    /// Set the idle re-check cadence of workers.
    pub fn upkeep_interval(mut self, interval: Duration) -> Self {
        self.settings.upkeep_interval = interval;
        self
    }

    /// Enable dry-run mode: events are drained and counted but never sent.
    pub fn dryrun(mut self, dryrun: bool) -> Self {
        self.settings.dryrun = dryrun;
        self
    }

    /// Log routine activity at `info` level.
    pub fn debug_enabled(mut self, debug_enabled: bool) -> Self {
        self.settings.debug_enabled = debug_enabled;
        self
    }

    /// Set how long `stop()` waits before cancelling outstanding work.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = timeout;
        self
    }

    /// Use `transport` instead of the default [`HttpTransport`](crate::HttpTransport).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Create a new [`Client`] using this configuration.
    ///
    /// ```
    /// # use posthog_batch::{Client, ClientConfig};
    /// let client: Client = ClientConfig::from_api_key("phc_key").to_client();
    /// ```
    pub fn to_client(self) -> Client {
        Client::new(self)
    }
}
