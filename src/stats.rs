use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::DispatchOutcome;

/// Snapshot of client counters. All counters only grow for the lifetime of a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// Events consumed from the buffer by sends (including dry-run sends).
    pub events_sent: u64,
    /// Events carried by requests answered with 200.
    pub successful_events: u64,
    /// Events carried by requests that failed or were answered with a non-200 status.
    pub failed_events: u64,
    /// Send attempts that consumed at least one event.
    pub dispatches: u64,
    /// HTTP requests issued.
    pub requests: u64,
    /// HTTP requests that failed or were answered with a non-200 status.
    pub failed_requests: u64,
    /// Workers respawned after panicking.
    pub worker_restarts: u64,
    /// Cumulative time spent sending.
    pub send_duration: Duration,
    /// Time since the client started.
    pub uptime: Duration,
}

impl ClientStats {
    /// Average send throughput, if anything was sent.
    pub fn events_per_second(&self) -> Option<f64> {
        let seconds = self.send_duration.as_secs_f64();
        (self.events_sent > 0 && seconds > 0.0).then(|| self.events_sent as f64 / seconds)
    }
}

impl fmt::Display for ClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total Uptime: {:.2?}. Events Sent: {} ({} ok, {} failed). Total Request Duration: {:.2?}.",
            self.uptime, self.events_sent, self.successful_events, self.failed_events, self.send_duration,
        )?;
        if let Some(rate) = self.events_per_second() {
            write!(f, " Avg {rate:.2} events/s")?;
        }
        Ok(())
    }
}

/// Lock-free counters updated by workers.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    events_sent: AtomicU64,
    successful_events: AtomicU64,
    failed_events: AtomicU64,
    dispatches: AtomicU64,
    requests: AtomicU64,
    failed_requests: AtomicU64,
    worker_restarts: AtomicU64,
    send_duration_nanos: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record_dispatch(&self, outcome: &DispatchOutcome, duration: Duration) {
        if outcome.sent == 0 {
            return;
        }
        self.events_sent
            .fetch_add(outcome.sent as u64, Ordering::Relaxed);
        self.successful_events
            .fetch_add(outcome.successful_events() as u64, Ordering::Relaxed);
        self.failed_events
            .fetch_add(outcome.failed_events() as u64, Ordering::Relaxed);
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.requests
            .fetch_add(outcome.requests.len() as u64, Ordering::Relaxed);
        self.failed_requests
            .fetch_add(outcome.failed_requests() as u64, Ordering::Relaxed);
        self.send_duration_nanos.fetch_add(
            u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub(crate) fn record_worker_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, uptime: Duration) -> ClientStats {
        ClientStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            successful_events: self.successful_events.load(Ordering::Relaxed),
            failed_events: self.failed_events.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            send_duration: Duration::from_nanos(self.send_duration_nanos.load(Ordering::Relaxed)),
            uptime,
        }
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::RequestOutcome;

    fn request(events: usize, status: Option<u16>) -> RequestOutcome {
        RequestOutcome {
            url: Url::parse("http://localhost/batch").unwrap(),
            events,
            status,
            error: None,
        }
    }

    #[test]
    fn records_dispatch_counts() {
        let recorder = StatsRecorder::default();
        let outcome = DispatchOutcome {
            sent: 5,
            requests: vec![request(3, Some(200)), request(1, Some(500)), request(1, None)],
        };

        recorder.record_dispatch(&outcome, Duration::from_millis(20));
        let stats = recorder.snapshot(Duration::from_secs(1));

        assert_eq!(stats.events_sent, 5);
        assert_eq!(stats.successful_events, 3);
        assert_eq!(stats.failed_events, 2);
        assert_eq!(stats.dispatches, 1);
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.failed_requests, 2);
        assert_eq!(stats.send_duration, Duration::from_millis(20));
    }

    #[test]
    fn empty_dispatch_is_not_counted() {
        let recorder = StatsRecorder::default();
        recorder.record_dispatch(&DispatchOutcome::default(), Duration::from_millis(5));

        assert_eq!(recorder.snapshot(Duration::ZERO), ClientStats::default());
    }

    #[test]
    fn display_includes_rate() {
        let stats = ClientStats {
            events_sent: 10,
            send_duration: Duration::from_secs(2),
            ..ClientStats::default()
        };

        assert_eq!(stats.events_per_second(), Some(5.0));
        assert!(stats.to_string().contains("Avg 5.00 events/s"));
        assert!(ClientStats::default().events_per_second().is_none());
    }
}
