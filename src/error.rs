use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the client.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the PostHog client.
///
/// Producers (`add_event`, captured functions) never receive errors. Only lifecycle calls
/// (`start`, `flush_now`, `stop`) and settings loaders return them.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The configured endpoint is not a valid base URL.
    #[error("invalid endpoint configuration")]
    InvalidEndpoint(#[source] url::ParseError),

    /// A setting could not be parsed from its textual representation.
    #[error("invalid value {value:?} for setting {name}")]
    InvalidSetting {
        /// Name of the setting (environment variable name when loaded from env).
        name: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },

    /// The worker pool needs a Tokio runtime and none is running on this thread.
    #[error("no tokio runtime available to start the worker pool")]
    NoRuntime,

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// An event could not be serialized to JSON.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// Some requests of a send attempt did not succeed.
    #[error("{failed} of {attempted} requests failed")]
    DispatchFailed {
        /// Number of failed requests.
        failed: usize,
        /// Number of requests attempted.
        attempted: usize,
    },
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}
