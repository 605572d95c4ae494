//! Worker tasks that move submissions from the intake queue into the event buffer and decide when
//! to send.
//!
//! Each worker cycles through `Running -> Draining -> Stopped`:
//!
//! - `Running`: take one submission from the intake queue without blocking and append it to the
//!   buffer, then evaluate the flush policy. When the queue is empty the policy is evaluated as
//!   well, and the worker sleeps until a new submission arrives, the upkeep interval elapses, or a
//!   stop is requested.
//! - `Draining`: entered on stop. Remaining submissions are moved into the buffer and a final send
//!   is made, waiting for the send lock if another send is in flight.
//! - `Stopped`: the task exits.
//!
//! Steady-state sends use `try_lock` on the send lock. A worker that finds a send in flight skips
//! its trigger instead of queueing it; the condition that made the send due (full buffer, elapsed
//! interval, forced flag) still holds on the next evaluation by any worker, which is at most one
//! upkeep interval later.
//!
//! A supervisor task owns the workers and respawns a worker that panicked while the pool is
//! running.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::client::{ClientCore, SendMode};
use crate::Event;

/// Receiving end of the intake queue, shared by all workers.
pub(crate) type SharedIntake = Arc<Mutex<mpsc::UnboundedReceiver<Event>>>;

/// Why a send became due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushReason {
    /// A scope exited or a forced flush was requested.
    Forced,
    /// The buffer holds at least `batch_size` events.
    BatchSize,
    /// More than `batch_interval` passed since the last send.
    Interval,
}

/// Size/time thresholds deciding when buffered events are sent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushPolicy {
    pub(crate) batch_size: usize,
    pub(crate) batch_interval: Duration,
}

impl FlushPolicy {
    /// A send is due if the buffer is non-empty and any of: forced, size threshold reached,
    /// interval exceeded.
    pub(crate) fn evaluate(
        &self,
        buffered: usize,
        since_last_send: Duration,
        forced: bool,
    ) -> Option<FlushReason> {
        if buffered == 0 {
            None
        } else if forced {
            Some(FlushReason::Forced)
        } else if buffered >= self.batch_size {
            Some(FlushReason::BatchSize)
        } else if since_last_send > self.batch_interval {
            Some(FlushReason::Interval)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Running,
    Draining,
    Stopped,
}

/// True once stop was signalled or the signalling side is gone.
pub(crate) fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

struct Worker {
    id: usize,
    core: Arc<ClientCore>,
    intake: SharedIntake,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        log::log!(target: "posthog", self.core.routine_level(), worker = self.id; "worker started");
        let mut state = WorkerState::Running;
        loop {
            state = match state {
                WorkerState::Running => self.step().await,
                WorkerState::Draining => {
                    self.drain().await;
                    WorkerState::Stopped
                }
                WorkerState::Stopped => {
                    log::log!(target: "posthog", self.core.routine_level(), worker = self.id; "worker stopped");
                    return;
                }
            };
        }
    }

    async fn step(&mut self) -> WorkerState {
        if stop_requested(&self.stop) {
            return WorkerState::Draining;
        }

        let next = self
            .intake
            .lock()
            .expect("thread holding intake lock should not panic")
            .try_recv();
        match next {
            Ok(event) => {
                self.core.buffer().push(event);
                self.core.maybe_send(self.id).await;
                WorkerState::Running
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                self.core.maybe_send(self.id).await;
                tokio::select! {
                    _ = self.core.intake_ready.notified() => {}
                    _ = tokio::time::sleep(self.core.settings.upkeep_interval) => {}
                    _ = self.stop.changed() => {}
                }
                WorkerState::Running
            }
            Err(mpsc::error::TryRecvError::Disconnected) => WorkerState::Draining,
        }
    }

    async fn drain(&mut self) {
        let moved = self.core.drain_intake(&self.intake);
        log::debug!(target: "posthog", worker = self.id, moved; "worker draining");
        self.core.send_events(SendMode::Wait, None).await;
    }
}

/// The supervisor task and handles to abort its workers.
pub(crate) struct WorkerPool {
    supervisor: JoinHandle<()>,
    workers: Arc<Mutex<Vec<AbortHandle>>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        runtime: &Handle,
        core: Arc<ClientCore>,
        intake: SharedIntake,
        stop: watch::Receiver<bool>,
        num_workers: usize,
    ) -> WorkerPool {
        let workers = Arc::new(Mutex::new(Vec::new()));
        let supervisor = Supervisor {
            runtime: runtime.clone(),
            core,
            intake,
            stop,
            workers: workers.clone(),
        };
        WorkerPool {
            supervisor: runtime.spawn(supervisor.run(num_workers)),
            workers,
        }
    }

    /// Wait for every worker to finish its final send. After `grace`, abort whatever is left.
    ///
    /// Returns `false` if anything had to be aborted.
    pub(crate) async fn join(self, grace: Duration) -> bool {
        let supervisor = self.supervisor.abort_handle();
        match tokio::time::timeout(grace, self.supervisor).await {
            Ok(_) => true,
            Err(_) => {
                supervisor.abort();
                for worker in self
                    .workers
                    .lock()
                    .expect("thread holding worker list lock should not panic")
                    .iter()
                {
                    worker.abort();
                }
                false
            }
        }
    }
}

struct Supervisor {
    runtime: Handle,
    core: Arc<ClientCore>,
    intake: SharedIntake,
    stop: watch::Receiver<bool>,
    workers: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Supervisor {
    async fn run(mut self, num_workers: usize) {
        let mut slots: Vec<Option<JoinHandle<()>>> = (0..num_workers)
            .map(|id| Some(self.spawn_worker(id)))
            .collect();

        while !stop_requested(&self.stop) {
            tokio::select! {
                _ = self.stop.changed() => {}
                _ = tokio::time::sleep(self.core.settings.upkeep_interval) => {}
            }
            if stop_requested(&self.stop) {
                break;
            }
            self.reap(&mut slots).await;
        }

        for (id, slot) in slots.into_iter().enumerate() {
            let Some(handle) = slot else { continue };
            if let Err(err) = handle.await {
                if err.is_panic() {
                    log::error!(target: "posthog", worker = id; "worker panicked while stopping");
                }
            }
        }
    }

    /// Collect finished workers and respawn them, unless stop was signalled in the meantime.
    ///
    /// A reaped worker that is not respawned leaves its slot empty.
    async fn reap(&self, slots: &mut [Option<JoinHandle<()>>]) {
        for (id, slot) in slots.iter_mut().enumerate() {
            if !slot.as_ref().is_some_and(JoinHandle::is_finished) {
                continue;
            }
            let Some(handle) = slot.take() else { continue };
            let panicked = matches!(handle.await, Err(ref err) if err.is_panic());

            // A worker finishing after stop went through Draining.
            if stop_requested(&self.stop) {
                if panicked {
                    log::error!(target: "posthog", worker = id; "worker panicked while stopping");
                }
                continue;
            }

            if panicked {
                log::warn!(target: "posthog", worker = id; "worker panicked, restarting it");
            } else {
                log::warn!(target: "posthog", worker = id; "worker exited unexpectedly, restarting it");
            }
            self.core.stats().record_worker_restart();
            *slot = Some(self.spawn_worker(id));
        }
    }

    fn spawn_worker(&self, id: usize) -> JoinHandle<()> {
        let worker = Worker {
            id,
            core: self.core.clone(),
            intake: self.intake.clone(),
            stop: self.stop.clone(),
        };
        let handle = self.runtime.spawn(worker.run());
        self.workers
            .lock()
            .expect("thread holding worker list lock should not panic")
            .push(handle.abort_handle());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientConfig;

    fn supervisor(client: &crate::Client, stop: watch::Receiver<bool>) -> Supervisor {
        let (_intake, receiver) = mpsc::unbounded_channel();
        Supervisor {
            runtime: Handle::current(),
            core: client.core().clone(),
            intake: Arc::new(Mutex::new(receiver)),
            stop,
            workers: Arc::default(),
        }
    }

    async fn finished(handle: &JoinHandle<()>) {
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
    }

    const POLICY: FlushPolicy = FlushPolicy {
        batch_size: 20,
        batch_interval: Duration::from_secs(60),
    };

    #[test]
    fn nothing_is_due_for_empty_buffer() {
        assert_eq!(POLICY.evaluate(0, Duration::from_secs(3600), true), None);
    }

    #[test]
    fn forced_wins() {
        assert_eq!(
            POLICY.evaluate(1, Duration::ZERO, true),
            Some(FlushReason::Forced)
        );
    }

    #[test]
    fn size_threshold() {
        assert_eq!(POLICY.evaluate(19, Duration::ZERO, false), None);
        assert_eq!(
            POLICY.evaluate(20, Duration::ZERO, false),
            Some(FlushReason::BatchSize)
        );
        assert_eq!(
            POLICY.evaluate(45, Duration::ZERO, false),
            Some(FlushReason::BatchSize)
        );
    }

    #[test]
    fn interval_threshold_sends_partial_batch() {
        assert_eq!(POLICY.evaluate(3, Duration::from_secs(60), false), None);
        assert_eq!(
            POLICY.evaluate(3, Duration::from_secs(61), false),
            Some(FlushReason::Interval)
        );
    }

    #[test]
    fn stop_is_requested_when_sender_is_gone() {
        let (sender, receiver) = watch::channel(false);
        assert!(!stop_requested(&receiver));

        drop(sender);
        assert!(stop_requested(&receiver));
    }

    #[test]
    fn stop_is_requested_when_signalled() {
        let (sender, receiver) = watch::channel(false);
        sender.send(true).unwrap();
        assert!(stop_requested(&receiver));
    }

    #[tokio::test]
    async fn worker_finishing_after_stop_is_not_restarted() {
        let client = ClientConfig::from_api_key("phc_test").to_client();
        let (stop, stop_receiver) = watch::channel(false);
        let supervisor = supervisor(&client, stop_receiver);

        let handle = tokio::spawn(async {});
        finished(&handle).await;
        stop.send(true).unwrap();
        let mut slots = vec![Some(handle)];
        supervisor.reap(&mut slots).await;

        assert!(slots[0].is_none());
        assert_eq!(client.stats().worker_restarts, 0);
    }

    #[tokio::test]
    async fn panicked_worker_is_respawned_while_running() {
        let client = ClientConfig::from_api_key("phc_test").to_client();
        let (stop, stop_receiver) = watch::channel(false);
        let supervisor = supervisor(&client, stop_receiver);

        let handle = tokio::spawn(async { panic!("worker failure injected by test") });
        finished(&handle).await;
        let mut slots = vec![Some(handle)];
        supervisor.reap(&mut slots).await;

        assert_eq!(client.stats().worker_restarts, 1);
        let respawned = slots[0].take().unwrap();
        assert!(!respawned.is_finished());

        stop.send(true).unwrap();
        respawned.await.unwrap();
    }
}
