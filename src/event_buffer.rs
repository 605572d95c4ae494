use std::sync::Mutex;

use serde_json::{Map, Value};

use crate::event::{CaptureEvent, Event, EventKind, IdentifyEvent};

/// How [`EventBuffer::drain`] serializes and consumes events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOptions {
    /// Produce the `/batch` item shape (see [`CaptureEvent::prepare_request`]).
    pub batched: bool,
    /// Drop absent optional fields instead of sending `null`.
    pub exclude_empty: bool,
    /// Remove the drained events from the buffer.
    pub clear_after: bool,
    /// Drain at most this many events (oldest first). `None` drains everything.
    pub limit: Option<usize>,
}

impl Default for DrainOptions {
    fn default() -> DrainOptions {
        DrainOptions {
            batched: false,
            exclude_empty: true,
            clear_after: true,
            limit: None,
        }
    }
}

/// In-memory, insertion-ordered collection of pending events.
///
/// The buffer is unbounded; callers keep it small by flushing according to `batch_size`. All
/// operations take an internal lock, so pushing from several workers while another worker drains
/// is safe, and a draining call that clears removes exactly the events it serialized.
#[derive(Debug, Default)]
pub struct EventBuffer {
    pending: Mutex<Pending>,
}

#[derive(Debug, Default)]
struct Pending {
    capture: Vec<CaptureEvent>,
    identify: Vec<IdentifyEvent>,
}

impl EventBuffer {
    /// Create an empty buffer.
    pub fn new() -> EventBuffer {
        EventBuffer::default()
    }

    /// Append an event to the sequence matching its kind.
    pub fn push(&self, event: impl Into<Event>) {
        let mut pending = self.lock();
        match event.into() {
            Event::Capture(event) => pending.capture.push(event),
            Event::Identify(event) => pending.identify.push(event),
        }
    }

    /// Serialize pending events of `kind` into wire objects.
    ///
    /// Events that fail to serialize are logged and skipped. With `clear_after`, the drained
    /// events are removed under the same lock acquisition, so a concurrent `push` is either part
    /// of this drain or stays in the buffer.
    pub fn drain(&self, kind: EventKind, options: DrainOptions) -> Vec<Map<String, Value>> {
        let mut pending = self.lock();
        match kind {
            EventKind::Capture => take(&mut pending.capture, options, |event| {
                event.prepare_request(options.batched, options.exclude_empty)
            }),
            EventKind::Identify => take(&mut pending.identify, options, |event| {
                event.prepare_request(options.batched, options.exclude_empty)
            }),
        }
    }

    /// Total number of pending events of all kinds.
    pub fn len(&self) -> usize {
        let pending = self.lock();
        pending.capture.len() + pending.identify.len()
    }

    /// Number of pending events of `kind`.
    pub fn len_of(&self, kind: EventKind) -> usize {
        let pending = self.lock();
        match kind {
            EventKind::Capture => pending.capture.len(),
            EventKind::Identify => pending.identify.len(),
        }
    }

    /// Returns `true` when no events are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all pending events.
    pub fn clear(&self) {
        let mut pending = self.lock();
        pending.capture.clear();
        pending.identify.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending
            .lock()
            .expect("thread holding event buffer lock should not panic")
    }
}

fn take<T>(
    events: &mut Vec<T>,
    options: DrainOptions,
    prepare: impl Fn(&T) -> crate::Result<Map<String, Value>>,
) -> Vec<Map<String, Value>> {
    let count = options.limit.map_or(events.len(), |limit| limit.min(events.len()));

    let prepared = events[..count]
        .iter()
        .filter_map(|event| {
            prepare(event)
                .inspect_err(|err| {
                    log::warn!(target: "posthog", "dropping event that failed to serialize: {:?}", err);
                })
                .ok()
        })
        .collect();

    if options.clear_after {
        events.drain(..count);
    }
    prepared
}
