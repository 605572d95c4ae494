//! Asynchronous batching client for the PostHog ingestion API.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that accepts analytics events from any task or thread
//! and sends them to PostHog in the background. Producers call [`Client::add_event`], which never
//! blocks on I/O. Worker tasks move submissions into an [`EventBuffer`] and send its contents
//! through a [`Dispatcher`] when the buffer reaches `batch_size` events, when `batch_interval`
//! has passed since the last send, or when a flush is forced. At most one send is in flight at any
//! time.
//!
//! Two event kinds are supported: [`CaptureEvent`] (sent in batches to `/batch`, or one by one to
//! `/capture`) and [`IdentifyEvent`] (sent one by one to `/identify`).
//!
//! Function calls can be captured with [`Capture`], which wraps a function and submits an event
//! each time it returns. The client is resolved at call time, so wrapping can happen before a
//! client exists (see [`ClientRegistry`]).
//!
//! The client is configured with [`ClientConfig`], built in code or from `POSTHOG_*` environment
//! variables via [`Settings::from_env`]. Call [`Client::stop`] before exiting: buffered events are
//! lost otherwise.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Producers never see errors: events that cannot be sent are logged and counted in
//! [`ClientStats`]. Only [`Client::start`], [`Client::flush_now`] and [`Client::stop`] return
//! errors, which are useful for diagnostics but usually safe to ignore in production.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the `posthog` target.
//! Routine activity is logged at `debug` level (`info` with `debug_enabled`); failed requests are
//! logged at `warn` level. Consider integrating a `log`-compatible logger implementation for
//! better visibility into client operations.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod capture;
mod client;
mod config;
mod dispatcher;
mod endpoint;
mod error;
mod event;
mod event_buffer;
mod retry;
mod stats;
mod transport;
mod worker;

pub use capture::{BoxFuture, Capture, Captured, CapturedAsync, ClientRegistry, ClientResolver};
pub use client::{Client, FlushScope};
pub use config::{ClientConfig, Settings};
pub use dispatcher::{DispatchOutcome, Dispatcher, RequestOutcome};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use event::{CaptureEvent, Event, EventKind, IdentifyEvent};
pub use event_buffer::{DrainOptions, EventBuffer};
pub use retry::{RetryPolicy, RetryingTransport};
pub use stats::ClientStats;
pub use transport::{HttpTransport, Transport, TransportResponse};
