use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;

use crate::event_buffer::DrainOptions;
use crate::retry::{RetryPolicy, RetryingTransport};
use crate::stats::StatsRecorder;
use crate::worker::{FlushPolicy, FlushReason, SharedIntake, WorkerPool};
use crate::{
    Capture, ClientConfig, ClientStats, DispatchOutcome, Dispatcher, Endpoint, Error, Event,
    EventBuffer, EventKind, HttpTransport, Result, Settings, Transport,
};

/// A client batching events and sending them to the PostHog ingestion API in the background.
///
/// `add_event` never blocks on I/O: submissions go to an intake queue and worker tasks move them
/// into a buffer that is sent once it holds `batch_size` events or `batch_interval` has passed
/// since the last send. At most one send is in flight at any time.
///
/// Workers run on the tokio runtime that is current when the client starts. The client starts
/// lazily on the first submission, or explicitly with [`Client::start`].
///
/// `Client` is cheap to clone; clones share the same queue, buffer and workers.
///
/// # Examples
/// ```no_run
/// # use posthog_batch::{CaptureEvent, ClientConfig};
/// # async fn run() -> posthog_batch::Result<()> {
/// let client = ClientConfig::from_api_key("phc_key").to_client();
/// client.add_event(CaptureEvent::new("signed up", "user-1").property("plan", "pro"));
///
/// let stats = client.stop().await?;
/// println!("{stats}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

/// State shared between the client handle and its worker tasks.
pub(crate) struct ClientCore {
    pub(crate) settings: Settings,
    buffer: EventBuffer,
    stats: StatsRecorder,
    policy: FlushPolicy,
    // Held for the whole duration of a send.
    send_lock: tokio::sync::Mutex<()>,
    force_flush: AtomicBool,
    last_send: Mutex<Instant>,
    started_at: Mutex<Option<Instant>>,
    pub(crate) intake_ready: Notify,
    transport: Option<Arc<dyn Transport>>,
    // Built on the first send, taken when the client stops.
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    lifecycle: Mutex<Lifecycle>,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    runtime: Handle,
    intake: mpsc::UnboundedSender<Event>,
    receiver: SharedIntake,
    stop: watch::Sender<bool>,
    pool: WorkerPool,
    flushes: JoinSet<()>,
}

/// How a send acquires the send lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendMode {
    /// Skip the send if another one is in flight.
    TryLock,
    /// Wait for the in-flight send to finish.
    Wait,
}

impl Client {
    /// Create a new client from `config`. Nothing is started until the first event is added or
    /// [`Client::start`] is called.
    ///
    /// ```
    /// # use posthog_batch::{Client, ClientConfig};
    /// let client = Client::new(ClientConfig::from_api_key("phc_key"));
    /// assert!(!client.is_started());
    /// ```
    pub fn new(config: ClientConfig) -> Client {
        let ClientConfig {
            settings,
            transport,
        } = config;
        if !settings.is_enabled() {
            log::debug!(target: "posthog", "PostHog client is disabled, events will be ignored");
        }

        Client {
            core: Arc::new(ClientCore {
                policy: FlushPolicy {
                    batch_size: settings.batch_size,
                    batch_interval: settings.batch_interval,
                },
                settings,
                buffer: EventBuffer::new(),
                stats: StatsRecorder::default(),
                send_lock: tokio::sync::Mutex::new(()),
                force_flush: AtomicBool::new(false),
                last_send: Mutex::new(Instant::now()),
                started_at: Mutex::new(None),
                intake_ready: Notify::new(),
                transport,
                dispatcher: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::Idle),
            }),
        }
    }

    /// Settings the client runs with.
    pub fn settings(&self) -> &Settings {
        &self.core.settings
    }

    /// Whether the client accepts events. See [`Settings::is_enabled`].
    pub fn is_enabled(&self) -> bool {
        self.core.settings.is_enabled()
    }

    /// Whether workers are running.
    pub fn is_started(&self) -> bool {
        matches!(*self.core.lifecycle(), Lifecycle::Running(_))
    }

    /// Whether [`Client::stop`] was called. A stopped client cannot be restarted.
    pub fn is_stopped(&self) -> bool {
        matches!(*self.core.lifecycle(), Lifecycle::Stopped)
    }

    /// Start `num_workers` workers from settings. See [`Client::start_with_workers`].
    pub fn start(&self) -> Result<()> {
        self.start_with_workers(self.core.settings.num_workers)
    }

    /// Start `num_workers` worker tasks (at least one) on the current tokio runtime.
    ///
    /// Does nothing if the client is disabled, already running, or stopped.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidEndpoint`] if the configured endpoint is not a valid URL.
    /// - [`Error::NoRuntime`] if called outside of a tokio runtime.
    pub fn start_with_workers(&self, num_workers: usize) -> Result<()> {
        let mut lifecycle = self.core.lifecycle();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Ok(());
        }
        if !self.is_enabled() {
            log::warn!(target: "posthog", "PostHog client is disabled, not starting workers");
            return Ok(());
        }

        Endpoint::new(&self.core.settings.endpoint)?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let num_workers = num_workers.max(1);

        let (intake, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let (stop, stop_receiver) = watch::channel(false);

        *lock_instant(&self.core.last_send) = Instant::now();
        *self
            .core
            .started_at
            .lock()
            .expect("thread holding start time lock should not panic") = Some(Instant::now());

        log::log!(target: "posthog", self.core.routine_level(), num_workers; "starting event workers");
        let pool = WorkerPool::spawn(
            &runtime,
            self.core.clone(),
            receiver.clone(),
            stop_receiver,
            num_workers,
        );

        *lifecycle = Lifecycle::Running(Running {
            runtime,
            intake,
            receiver,
            stop,
            pool,
            flushes: JoinSet::new(),
        });
        Ok(())
    }

    /// Queue an event for sending. Never blocks on I/O.
    ///
    /// Starts the client if it is idle. Events are silently ignored when the client is disabled,
    /// and dropped with a log message when it is stopped or cannot start.
    pub fn add_event(&self, event: impl Into<Event>) {
        if !self.is_enabled() {
            return;
        }
        let event = event.into();
        if !event.is_valid() {
            log::debug!(target: "posthog", kind:? = event.kind(); "queueing event without event name or distinct_id");
        }

        if matches!(*self.core.lifecycle(), Lifecycle::Idle) {
            if let Err(err) = self.start() {
                log::warn!(target: "posthog", "failed to start PostHog client, dropping event: {}", err);
                return;
            }
        }

        match &*self.core.lifecycle() {
            Lifecycle::Running(running) => {
                if running.intake.send(event).is_err() {
                    log::warn!(target: "posthog", "event intake is closed, dropping event");
                    return;
                }
                self.core.intake_ready.notify_one();
            }
            Lifecycle::Idle => {}
            Lifecycle::Stopped => {
                log::debug!(target: "posthog", "PostHog client is stopped, dropping event");
            }
        }
    }

    /// Request a send in the background.
    ///
    /// With `force`, the send waits for an in-flight send to finish and then sends everything
    /// buffered. Without it, the send is skipped if another one is in flight.
    pub fn flush(&self, force: bool) {
        let mut lifecycle = self.core.lifecycle();
        let Lifecycle::Running(running) = &mut *lifecycle else {
            return;
        };

        // Reap finished flushes so the set does not grow.
        while running.flushes.try_join_next().is_some() {}

        let core = self.core.clone();
        let receiver = running.receiver.clone();
        running.flushes.spawn_on(
            async move {
                core.flush(&receiver, force).await;
            },
            &running.runtime,
        );
    }

    /// Send buffered and queued events now and wait for the result.
    ///
    /// Returns `Ok(None)` when nothing was sent: the client is not running, nothing was pending,
    /// or (without `force`) another send was in flight.
    ///
    /// # Errors
    ///
    /// [`Error::DispatchFailed`] if any request of the send failed.
    pub async fn flush_now(&self, force: bool) -> Result<Option<DispatchOutcome>> {
        let receiver = match &*self.core.lifecycle() {
            Lifecycle::Running(running) => running.receiver.clone(),
            Lifecycle::Idle | Lifecycle::Stopped => return Ok(None),
        };
        self.core
            .flush(&receiver, force)
            .await
            .map(DispatchOutcome::into_result)
            .transpose()
    }

    /// Stop the client: signal workers, wait for their final sends, flush whatever remains and
    /// close the transport.
    ///
    /// Workers and in-flight flushes get `shutdown_timeout` to finish before they are cancelled.
    /// Every event queued before `stop` is sent unless cancelled this way. Stopping is terminal:
    /// later calls to `add_event` and `start` do nothing. Calling `stop` again returns the stats
    /// without doing anything else.
    ///
    /// # Errors
    ///
    /// [`Error::DispatchFailed`] if any request sent during shutdown failed. Stats are still
    /// logged.
    pub async fn stop(&self) -> Result<ClientStats> {
        let previous = std::mem::replace(&mut *self.core.lifecycle(), Lifecycle::Stopped);
        let Lifecycle::Running(Running {
            intake,
            receiver,
            stop,
            pool,
            mut flushes,
            ..
        }) = previous
        else {
            return Ok(self.stats());
        };

        log::log!(target: "posthog", self.core.routine_level(), "stopping event workers");
        let before = self.stats();
        drop(intake);
        let _ = stop.send(true);

        let grace = self.core.settings.shutdown_timeout;
        if !pool.join(grace).await {
            log::warn!(target: "posthog", "workers did not stop within {:?}, cancelled them", grace);
        }
        let pending_flushes = async { while flushes.join_next().await.is_some() {} };
        if tokio::time::timeout(grace, pending_flushes).await.is_err() {
            log::warn!(target: "posthog", "flushes did not finish within {:?}, cancelled them", grace);
            flushes.abort_all();
        }

        self.core.drain_intake(&receiver);
        self.core.send_events(SendMode::Wait, None).await;
        self.core.close_transport().await;

        let stats = self.stats();
        log::info!(target: "posthog", stats:serde; "PostHog client stopped. {}", stats);

        // Workers make their own final sends, so failures are counted across the whole shutdown.
        match stats.failed_requests - before.failed_requests {
            0 => Ok(stats),
            failed => Err(Error::DispatchFailed {
                failed: failed as usize,
                attempted: (stats.requests - before.requests) as usize,
            }),
        }
    }

    /// Force a send when the returned guard is dropped.
    ///
    /// Use it around a unit of work whose events should go out promptly once the work is done.
    /// Starts the client if it is idle.
    ///
    /// ```no_run
    /// # use posthog_batch::{CaptureEvent, ClientConfig};
    /// # let client = ClientConfig::from_api_key("phc_key").to_client();
    /// {
    ///     let scope = client.scope();
    ///     scope.add_event(CaptureEvent::new("job finished", "worker-7"));
    /// } // a send is due here
    /// ```
    pub fn scope(&self) -> FlushScope<'_> {
        if self.is_enabled() {
            if let Err(err) = self.start() {
                log::warn!(target: "posthog", "failed to start PostHog client: {}", err);
            }
        }
        FlushScope { client: self }
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> ClientStats {
        let uptime = self
            .core
            .started_at
            .lock()
            .expect("thread holding start time lock should not panic")
            .map_or(Duration::ZERO, |started_at| started_at.elapsed());
        self.core.stats.snapshot(uptime)
    }

    /// Number of events moved to the buffer and not sent yet. Events still in the intake queue
    /// are not counted.
    pub fn buffered_len(&self) -> usize {
        self.core.buffer.len()
    }

    /// Build a [`Capture`] wrapper that reports calls to this client.
    pub fn capture(&self) -> Capture {
        Capture::new(self.clone())
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }
}

impl ClientCore {
    pub(crate) fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    pub(crate) fn stats(&self) -> &StatsRecorder {
        &self.stats
    }

    pub(crate) fn routine_level(&self) -> log::Level {
        self.settings.routine_log_level()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .expect("thread holding client lifecycle lock should not panic")
    }

    /// Move everything waiting in the intake queue into the buffer.
    pub(crate) fn drain_intake(&self, intake: &SharedIntake) -> usize {
        let mut receiver = intake
            .lock()
            .expect("thread holding intake lock should not panic");
        let mut moved = 0;
        while let Ok(event) = receiver.try_recv() {
            self.buffer.push(event);
            moved += 1;
        }
        moved
    }

    fn flush_due(&self) -> Option<FlushReason> {
        let since_last_send = lock_instant(&self.last_send).elapsed();
        self.policy.evaluate(
            self.buffer.len(),
            since_last_send,
            self.force_flush.load(Ordering::SeqCst),
        )
    }

    /// Evaluate the flush policy and send if due, skipping if another send is in flight.
    pub(crate) async fn maybe_send(&self, worker: usize) {
        let Some(reason) = self.flush_due() else {
            return;
        };
        log::trace!(target: "posthog", worker, reason:? = reason; "send due");

        // Policy sends take one batch; the next evaluation picks up the rest.
        let limit = match reason {
            FlushReason::Forced => None,
            FlushReason::BatchSize | FlushReason::Interval => Some(self.policy.batch_size.max(1)),
        };
        self.send_events(SendMode::TryLock, limit).await;
    }

    async fn flush(&self, intake: &SharedIntake, force: bool) -> Option<DispatchOutcome> {
        self.drain_intake(intake);
        let mode = if force {
            SendMode::Wait
        } else {
            SendMode::TryLock
        };
        self.send_events(mode, None).await
    }

    /// Drain up to `limit` events from the buffer and send them.
    ///
    /// Returns `None` when nothing was sent.
    pub(crate) async fn send_events(
        &self,
        mode: SendMode,
        limit: Option<usize>,
    ) -> Option<DispatchOutcome> {
        if self.buffer.is_empty() {
            return None;
        }
        let _guard = match mode {
            SendMode::TryLock => match self.send_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    log::trace!(target: "posthog", "send already in flight, skipping");
                    return None;
                }
            },
            SendMode::Wait => self.send_lock.lock().await,
        };

        let dispatcher = match self.dispatcher() {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                log::warn!(target: "posthog", "failed to create transport, keeping events buffered: {}", err);
                return None;
            }
        };

        // An unlimited drain takes everything a forced trigger asked for. A limited one leaves the
        // flag alone so the next evaluation still sends the remainder.
        if limit.is_none() {
            self.force_flush.store(false, Ordering::SeqCst);
        }

        let started = Instant::now();
        let batched = self.settings.batched;
        let capture = self.buffer.drain(
            EventKind::Capture,
            DrainOptions {
                batched,
                limit,
                ..DrainOptions::default()
            },
        );
        let identify = self.buffer.drain(
            EventKind::Identify,
            DrainOptions {
                limit: limit.map(|limit| limit.saturating_sub(capture.len())),
                ..DrainOptions::default()
            },
        );
        if capture.is_empty() && identify.is_empty() {
            return None;
        }

        let dry_run = self.settings.dryrun;
        let mut outcome = dispatcher
            .send(EventKind::Capture, capture, batched, dry_run)
            .await;
        outcome.merge(
            dispatcher
                .send(EventKind::Identify, identify, batched, dry_run)
                .await,
        );

        self.stats.record_dispatch(&outcome, started.elapsed());
        *lock_instant(&self.last_send) = Instant::now();
        log::log!(target: "posthog", self.routine_level(),
            sent = outcome.sent, failed = outcome.failed_events(), remaining = self.buffer.len();
            "dispatched events");
        Some(outcome)
    }

    /// The dispatcher, creating the transport on first use.
    fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        let mut dispatcher = self
            .dispatcher
            .lock()
            .expect("thread holding dispatcher lock should not panic");
        if let Some(dispatcher) = dispatcher.as_ref() {
            return Ok(dispatcher.clone());
        }

        let endpoint = Endpoint::new(&self.settings.endpoint)?;
        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(HttpTransport::new(&self.settings)?),
        };
        let transport: Arc<dyn Transport> = match RetryPolicy::from_settings(&self.settings) {
            Some(policy) => Arc::new(RetryingTransport::new(transport, policy)),
            None => transport,
        };

        let created = Arc::new(
            Dispatcher::new(
                endpoint,
                self.settings.api_key.clone().unwrap_or_default(),
                transport,
            )
            .with_routine_level(self.routine_level()),
        );
        *dispatcher = Some(created.clone());
        Ok(created)
    }

    async fn close_transport(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .expect("thread holding dispatcher lock should not panic")
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.close().await;
        }
    }
}

fn lock_instant(instant: &Mutex<Instant>) -> MutexGuard<'_, Instant> {
    instant
        .lock()
        .expect("thread holding timestamp lock should not panic")
}

/// Guard returned by [`Client::scope`]. Dropping it makes a send due.
///
/// Dereferences to the [`Client`].
pub struct FlushScope<'a> {
    client: &'a Client,
}

impl Deref for FlushScope<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client
    }
}

impl Drop for FlushScope<'_> {
    fn drop(&mut self) {
        self.client.core.force_flush.store(true, Ordering::SeqCst);
        self.client.core.intake_ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::transport::testing::RecordingTransport;
    use crate::{CaptureEvent, IdentifyEvent};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(transport: &Arc<RecordingTransport>) -> ClientConfig {
        ClientConfig::from_api_key("phc_test")
            .endpoint("http://localhost:8000")
            .default_retries(0)
            .upkeep_interval(Duration::from_millis(10))
            .transport(transport.clone())
    }

    fn event(i: usize) -> CaptureEvent {
        CaptureEvent::new("clicked", format!("user-{i}"))
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition was not met in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_when_batch_size_is_reached() {
        init();
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).batch_size(5).to_client();

        for i in 0..5 {
            client.add_event(event(i));
        }
        eventually(|| transport.request_count() == 1).await;

        let (url, body) = transport.requests().remove(0);
        assert_eq!(url.path(), "/batch");
        assert_eq!(body["batch"].as_array().unwrap().len(), 5);
        assert_eq!(body["api_key"], "phc_test");
        assert_eq!(client.buffered_len(), 0);

        for i in 5..8 {
            client.add_event(event(i));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.request_count(), 1);

        let stats = client.stop().await.unwrap();
        assert_eq!(transport.event_count(), 8);
        assert_eq!(stats.events_sent, 8);
        assert_eq!(stats.successful_events, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_partial_batch_after_interval() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport)
            .batch_interval(Duration::from_millis(50))
            .to_client();

        client.add_event(event(1));
        client.add_event(event(2));
        eventually(|| transport.request_count() == 1).await;

        assert_eq!(transport.event_count(), 2);
        client.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scope_exit_forces_send() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).to_client();

        {
            let scope = client.scope();
            scope.add_event(event(1));
            assert!(client.is_started());
        }
        eventually(|| transport.request_count() == 1).await;

        client.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_sends_in_background() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).to_client();

        client.add_event(event(1));
        client.add_event(event(2));
        client.flush(true);
        eventually(|| transport.event_count() == 2).await;

        client.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_send_in_flight() {
        let transport = Arc::new(RecordingTransport::new().with_delay(Duration::from_millis(10)));
        let client = config(&transport)
            .batch_size(3)
            .batched(false)
            .to_client();
        client.start_with_workers(4).unwrap();

        for i in 0..30 {
            client.add_event(event(i));
            if i % 7 == 0 {
                client.flush(false);
            }
        }
        let stats = client.stop().await.unwrap();

        assert_eq!(transport.event_count(), 30);
        assert_eq!(stats.events_sent, 30);
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_sends_everything_queued() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).to_client();

        for i in 0..37 {
            client.add_event(event(i));
        }
        let stats = client.stop().await.unwrap();

        assert_eq!(stats.events_sent, 37);
        assert_eq!(transport.event_count(), 37);
        assert!(client.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dry_run_drains_without_requests() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).dryrun(true).to_client();

        client.add_event(event(1));
        let outcome = client.flush_now(true).await.unwrap().unwrap();

        assert_eq!(outcome.sent, 1);
        assert!(outcome.requests.is_empty());
        assert_eq!(client.buffered_len(), 0);
        assert_eq!(transport.request_count(), 0);
        assert_eq!(client.stats().events_sent, 1);
        client.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_full_batches_and_flushes_remainder_on_stop() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport)
            .batch_size(20)
            .dryrun(true)
            .to_client();
        client.start_with_workers(2).unwrap();

        for i in 0..45 {
            client.add_event(event(i));
        }
        eventually(|| client.stats().events_sent == 40 && client.buffered_len() == 5).await;
        assert_eq!(client.stats().dispatches, 2);

        let stats = client.stop().await.unwrap();
        assert_eq!(stats.events_sent, 45);
        assert_eq!(stats.dispatches, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn identify_events_go_to_identify() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).to_client();

        client.add_event(IdentifyEvent::new("user-1").property("email", "a@b.c"));
        client.add_event(event(1));
        client.stop().await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let (url, body) = requests
            .iter()
            .find(|(url, _)| url.path() == "/identify")
            .unwrap();
        assert_eq!(url.path(), "/identify");
        assert_eq!(body["distinct_id"], "user-1");
        assert_eq!(body["properties"], json!({"email": "a@b.c"}));
        assert_eq!(body["api_key"], "phc_test");
    }

    #[tokio::test]
    async fn disabled_client_ignores_events() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).enabled(false).to_client();

        client.add_event(event(1));
        client.start().unwrap();

        assert!(!client.is_started());
        assert_eq!(client.stop().await.unwrap(), ClientStats::default());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_client_rejects_events() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).to_client();
        client.add_event(event(1));
        client.stop().await.unwrap();

        client.add_event(event(2));
        client.start().unwrap();

        assert!(!client.is_started());
        assert_eq!(client.buffered_len(), 0);
        assert_eq!(client.stats().events_sent, 1);
        assert_eq!(client.flush_now(true).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transport_is_closed_once() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).to_client();

        client.add_event(event(1));
        client.stop().await.unwrap();
        client.stop().await.unwrap();

        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_final_send_is_reported() {
        init();
        let transport = Arc::new(RecordingTransport::new().with_status(500));
        let client = config(&transport).to_client();

        for i in 0..3 {
            client.add_event(event(i));
        }
        let err = client.stop().await.unwrap_err();

        assert!(matches!(err, Error::DispatchFailed { failed: 1, attempted: 1 }));
        assert_eq!(client.stats().failed_events, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicked_worker_is_restarted() {
        let transport = Arc::new(RecordingTransport::new().panicking_once());
        let client = config(&transport).batch_size(1).to_client();

        client.add_event(event(1));
        eventually(|| client.stats().worker_restarts == 1).await;

        client.add_event(event(2));
        eventually(|| transport.event_count() == 1).await;
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn forced_flush_survives_limited_send() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).batch_size(20).to_client();
        for i in 0..25 {
            client.core.buffer().push(event(i));
        }
        assert_eq!(client.core.flush_due(), Some(FlushReason::BatchSize));

        // Forced trigger arriving after the size trigger was chosen.
        drop(FlushScope { client: &client });
        client.core.send_events(SendMode::TryLock, Some(20)).await.unwrap();

        assert_eq!(client.buffered_len(), 5);
        assert_eq!(client.core.flush_due(), Some(FlushReason::Forced));

        client.core.maybe_send(0).await;
        assert_eq!(client.buffered_len(), 0);
        assert_eq!(transport.event_count(), 25);
        assert_eq!(client.core.flush_due(), None);
        assert!(!client.core.force_flush.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_is_skipped_while_another_is_in_flight() {
        let transport = Arc::new(RecordingTransport::new());
        let client = config(&transport).batch_size(3).to_client();
        for i in 0..3 {
            client.core.buffer().push(event(i));
        }

        let in_flight = client.core.send_lock.lock().await;
        assert_eq!(client.core.send_events(SendMode::TryLock, None).await, None);
        client.core.maybe_send(0).await;
        assert_eq!(client.buffered_len(), 3);
        assert_eq!(transport.request_count(), 0);

        drop(in_flight);
        assert_eq!(client.core.flush_due(), Some(FlushReason::BatchSize));
        client.core.maybe_send(0).await;
        assert_eq!(client.buffered_len(), 0);
        assert_eq!(transport.event_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_request_is_retried() {
        init();
        let transport = Arc::new(RecordingTransport::new().with_statuses(&[500]));
        let client = config(&transport)
            .default_retries(1)
            .retry_interval(Duration::from_millis(1))
            .to_client();

        client.add_event(event(1));
        let stats = client.stop().await.unwrap();

        assert_eq!(transport.request_count(), 2);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.failed_requests, 0);
        assert_eq!(stats.successful_events, 1);
    }

    #[test]
    fn start_requires_runtime() {
        let client = ClientConfig::from_api_key("phc_test").to_client();

        assert!(matches!(client.start(), Err(Error::NoRuntime)));
        client.add_event(event(1));
        assert!(!client.is_started());
    }

    #[tokio::test]
    async fn start_rejects_invalid_endpoint() {
        let client = ClientConfig::from_api_key("phc_test")
            .endpoint("not a url")
            .to_client();

        assert!(matches!(client.start(), Err(Error::InvalidEndpoint(_))));
    }
}
