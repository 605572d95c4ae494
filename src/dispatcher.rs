//! Turns drained events into requests against the ingestion API.
use std::sync::Arc;

use serde_json::{json, Map, Value};
use url::Url;

use crate::{Endpoint, Error, EventKind, Result, Transport};

/// Failed response bodies are cut to this many characters before logging.
const MAX_LOGGED_BODY_CHARS: usize = 512;

/// Result of a single HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Request target.
    pub url: Url,
    /// Number of events carried by the request.
    pub events: usize,
    /// Response status, or `None` if no response was received.
    pub status: Option<u16>,
    /// Transport error message when no response was received.
    pub error: Option<String>,
}

impl RequestOutcome {
    /// HTTP 200 is the sole success status.
    pub fn is_success(&self) -> bool {
        self.status == Some(200)
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Events consumed from the buffer. Counted in dry-run mode as well, where nothing goes
    /// over the wire.
    pub sent: usize,
    /// One entry per request issued. Empty in dry-run mode.
    pub requests: Vec<RequestOutcome>,
}

impl DispatchOutcome {
    /// Events carried by requests answered with 200.
    pub fn successful_events(&self) -> usize {
        self.requests
            .iter()
            .filter(|request| request.is_success())
            .map(|request| request.events)
            .sum()
    }

    /// Events carried by requests that failed or were answered with a non-200 status.
    pub fn failed_events(&self) -> usize {
        self.requests
            .iter()
            .filter(|request| !request.is_success())
            .map(|request| request.events)
            .sum()
    }

    /// Number of failed requests.
    pub fn failed_requests(&self) -> usize {
        self.requests
            .iter()
            .filter(|request| !request.is_success())
            .count()
    }

    /// Append the results of another send to this one.
    pub fn merge(&mut self, other: DispatchOutcome) {
        self.sent += other.sent;
        self.requests.extend(other.requests);
    }

    /// `Err(Error::DispatchFailed)` if any request failed.
    pub fn into_result(self) -> Result<DispatchOutcome> {
        match self.failed_requests() {
            0 => Ok(self),
            failed => Err(Error::DispatchFailed {
                failed,
                attempted: self.requests.len(),
            }),
        }
    }
}

/// Sends drained events to the ingestion API.
///
/// Capture events go to `/batch` as `{"batch": [...], "api_key": ...}` when batched, otherwise to
/// `/capture` one request per event with `api_key` merged into the event. Identify events always
/// go to `/identify`, one request per event.
pub struct Dispatcher {
    endpoint: Endpoint,
    api_key: String,
    transport: Arc<dyn Transport>,
    routine_level: log::Level,
}

impl Dispatcher {
    /// Create a dispatcher sending through `transport`.
    pub fn new(endpoint: Endpoint, api_key: impl Into<String>, transport: Arc<dyn Transport>) -> Dispatcher {
        Dispatcher {
            endpoint,
            api_key: api_key.into(),
            transport,
            routine_level: log::Level::Debug,
        }
    }

    /// Log dry-run and success messages at `level`.
    pub fn with_routine_level(mut self, level: log::Level) -> Dispatcher {
        self.routine_level = level;
        self
    }

    /// Send `events` of `kind`.
    ///
    /// Failures never abort the send: every request is attempted and its result recorded in the
    /// returned [`DispatchOutcome`]. With `dry_run`, requests are only logged.
    pub async fn send(
        &self,
        kind: EventKind,
        events: Vec<Map<String, Value>>,
        batched: bool,
        dry_run: bool,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome {
            sent: events.len(),
            requests: Vec::new(),
        };
        if events.is_empty() {
            return outcome;
        }

        match kind {
            EventKind::Capture if batched => {
                let count = events.len();
                let body = json!({"batch": events, "api_key": self.api_key});
                if dry_run {
                    self.log_dry_run(self.endpoint.batch(), count, &body);
                } else {
                    outcome
                        .requests
                        .push(self.post(self.endpoint.batch(), count, &body).await);
                }
            }
            EventKind::Capture | EventKind::Identify => {
                let url = match kind {
                    EventKind::Capture => self.endpoint.capture(),
                    EventKind::Identify => self.endpoint.identify(),
                };
                for mut event in events {
                    event.insert("api_key".to_owned(), Value::String(self.api_key.clone()));
                    let body = Value::Object(event);
                    if dry_run {
                        self.log_dry_run(url, 1, &body);
                        continue;
                    }
                    outcome.requests.push(self.post(url, 1, &body).await);
                }
            }
        }

        outcome
    }

    /// Close the underlying transport.
    pub async fn close(&self) {
        self.transport.close().await
    }

    async fn post(&self, url: &Url, events: usize, body: &Value) -> RequestOutcome {
        match self.transport.post(url, body).await {
            Ok(response) => {
                if response.is_success() {
                    log::log!(target: "posthog", self.routine_level, events, url:% = url; "sent events");
                } else {
                    let body = response.body.as_deref().unwrap_or_default();
                    log::warn!(target: "posthog", status = response.status, events, url:% = url;
                        "error sending events: {}", truncate(body, MAX_LOGGED_BODY_CHARS));
                }
                RequestOutcome {
                    url: url.clone(),
                    events,
                    status: Some(response.status),
                    error: None,
                }
            }
            Err(err) => {
                log::warn!(target: "posthog", events, url:% = url; "failed to send events: {}", err);
                RequestOutcome {
                    url: url.clone(),
                    events,
                    status: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    fn log_dry_run(&self, url: &Url, events: usize, body: &Value) {
        log::log!(target: "posthog", self.routine_level, events, url:% = url; "[dryrun] would send: {}", body);
    }
}

/// Cut `text` to at most `max_chars` characters.
fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
