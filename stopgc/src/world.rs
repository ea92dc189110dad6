//! Stop-the-world coordinator.
//!
//! Per thread the coordinator drives
//! `Running -> SuspendRequested -> Suspended -> Resuming -> Running`, or
//! `Blocked -> BlockedHeld -> Blocked` for threads parked in a blocking
//! section. Between [`World::stop`] and [`World::start`] nothing here
//! allocates, locks the logger or takes a lock a mutator could hold.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    backend::{Delivery, SuspendBackend},
    error::{Fatal, RegisterError, fatal, fatal_stopped},
    threads::{ThreadRecord, ThreadRegistry, ThreadState},
};

const SPIN_ROUNDS: u32 = 64;
const POLL_SLEEP: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    /// Acknowledged the epoch and parked.
    Suspended,
    /// Was blocked in a safe state and is held there.
    Held,
    /// Exited without unregistering.
    Vanished,
}

/// What a stop found, logged once the world runs again.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub epoch: u64,
    pub threads: usize,
    pub acknowledged: usize,
    pub blocked: usize,
    pub vanished: usize,
    pub retries: u32,
    pub waited: Duration,
}

/// Proof that every other registered thread is stopped.
#[derive(Debug)]
#[must_use = "the world must be restarted with World::start"]
pub struct StoppedWorld {
    epoch: u64,
    threads: Vec<Arc<ThreadRecord>>,
    outcomes: Vec<Outcome>,
    report: StopReport,
}

impl StoppedWorld {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Stopped threads whose snapshot must be scanned.
    pub fn stopped_threads(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.threads
            .iter()
            .zip(&self.outcomes)
            .filter(|(_, outcome)| {
                matches!(outcome, Outcome::Suspended | Outcome::Held)
            })
            .map(|(rec, _)| rec.as_ref())
    }
}

#[derive(Debug)]
pub struct World {
    registry: ThreadRegistry,
    backend: Box<dyn SuspendBackend>,
    gate: Mutex<()>,
    released: Condvar,
    epoch: AtomicU64,
    suspend_timeout: Duration,
    retry_interval: Duration,
}

impl World {
    pub fn new(
        backend: Box<dyn SuspendBackend>,
        suspend_timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            registry: ThreadRegistry::new(),
            backend,
            gate: Mutex::new(()),
            released: Condvar::new(),
            epoch: AtomicU64::new(0),
            suspend_timeout,
            retry_interval,
        }
    }

    /// Number of completed or running stops.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.registry.len()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn needs_polling(&self) -> bool {
        self.backend.needs_polling()
    }

    // ── Registration ──────────────────────────────────────────────────

    /// Adds the calling thread. Waits while a stop is in progress.
    pub fn attach(&self, record: &Arc<ThreadRecord>) -> Result<(), RegisterError> {
        self.backend.attach(record)?;
        self.registry.register(record.clone());
        Ok(())
    }

    /// Removes the calling thread. Enters a blocking section first so a
    /// concurrent stop never waits for it. Unregistering waits for a
    /// running stop to end, so a thread never exits while it is stopped
    /// or about to be signalled. Detaching twice is a no-op.
    pub fn detach(&self, record: &Arc<ThreadRecord>) {
        if record.state() == ThreadState::Detached {
            return;
        }
        self.enter_blocking(record);
        self.registry.unregister(record);
        self.backend.detach(record);
        record.set_state(ThreadState::Detached);
    }

    // ── Stop / start ──────────────────────────────────────────────────

    /// Stops every registered thread except `current` and waits until each
    /// has acknowledged the new epoch or is held in a blocking section.
    /// Aborts the process if a thread does neither within the timeout.
    pub fn stop(&self, current: Option<&Arc<ThreadRecord>>) -> StoppedWorld {
        let mut threads = self.registry.begin_stop();
        if let Some(current) = current {
            threads.retain(|rec| !Arc::ptr_eq(rec, current));
        }
        let mut outcomes = vec![Outcome::Pending; threads.len()];
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let started = Instant::now();

        // nothing below allocates until `start`
        for (rec, outcome) in threads.iter().zip(outcomes.iter_mut()) {
            rec.requested_epoch.store(epoch, Ordering::Release);
            *outcome = self.request(rec, started);
        }

        let mut report = StopReport {
            epoch,
            threads: threads.len(),
            ..Default::default()
        };
        self.await_acknowledgments(&threads, &mut outcomes, &mut report, started);

        for (rec, outcome) in threads.iter().zip(&outcomes) {
            let accounted = match outcome {
                Outcome::Suspended => {
                    rec.state() == ThreadState::Suspended
                        && rec.ack_epoch.load(Ordering::Acquire) == epoch
                        && rec.stack_ptr().is_some()
                }
                Outcome::Held => {
                    rec.state() == ThreadState::BlockedHeld
                        && rec.stack_ptr().is_some()
                }
                Outcome::Vanished => true,
                Outcome::Pending => false,
            };
            if !accounted {
                fatal_stopped(Fatal::CorruptionDetected {
                    detail: "thread unaccounted for when marking starts",
                    addr: rec.stack_base,
                });
            }
            match outcome {
                Outcome::Suspended => report.acknowledged += 1,
                Outcome::Held => report.blocked += 1,
                _ => report.vanished += 1,
            }
        }
        report.waited = started.elapsed();

        StoppedWorld {
            epoch,
            threads,
            outcomes,
            report,
        }
    }

    fn request(&self, rec: &ThreadRecord, started: Instant) -> Outcome {
        let mut rounds = 0u32;
        loop {
            match rec.state() {
                ThreadState::Running => {
                    if rec
                        .try_transition(
                            ThreadState::Running,
                            ThreadState::SuspendRequested,
                        )
                        .is_ok()
                    {
                        return match self.backend.request_suspend(rec) {
                            Delivery::Delivered => Outcome::Pending,
                            Delivery::Gone => {
                                rec.set_state(ThreadState::Detached);
                                Outcome::Vanished
                            }
                        };
                    }
                }
                ThreadState::Blocked => {
                    if rec
                        .try_transition(
                            ThreadState::Blocked,
                            ThreadState::BlockedHeld,
                        )
                        .is_ok()
                    {
                        return Outcome::Held;
                    }
                }
                ThreadState::Detached => return Outcome::Vanished,
                // still waking up from the previous stop
                ThreadState::Resuming => {
                    self.check_timeout(rec, started);
                    backoff(&mut rounds);
                }
                ThreadState::SuspendRequested
                | ThreadState::Suspended
                | ThreadState::BlockedHeld => {
                    fatal_stopped(Fatal::CorruptionDetected {
                        detail: "thread already stopped by another stop",
                        addr: rec.stack_base,
                    });
                }
            }
        }
    }

    fn await_acknowledgments(
        &self,
        threads: &[Arc<ThreadRecord>],
        outcomes: &mut [Outcome],
        report: &mut StopReport,
        started: Instant,
    ) {
        let epoch = report.epoch;
        let mut last_retry = started;
        let mut rounds = 0u32;
        loop {
            let mut pending = None;
            for (rec, outcome) in threads.iter().zip(outcomes.iter_mut()) {
                if *outcome != Outcome::Pending {
                    continue;
                }
                if rec.ack_epoch.load(Ordering::Acquire) == epoch {
                    *outcome = Outcome::Suspended;
                } else {
                    pending.get_or_insert(rec);
                }
            }
            let Some(first) = pending else {
                return;
            };
            self.check_timeout(first, started);

            if !self.backend.needs_polling()
                && last_retry.elapsed() >= self.retry_interval
            {
                for (rec, outcome) in threads.iter().zip(outcomes.iter_mut()) {
                    if *outcome == Outcome::Pending
                        && self.backend.retry(rec) == Delivery::Gone
                    {
                        rec.set_state(ThreadState::Detached);
                        *outcome = Outcome::Vanished;
                    }
                }
                report.retries += 1;
                last_retry = Instant::now();
            }
            backoff(&mut rounds);
        }
    }

    fn check_timeout(&self, rec: &ThreadRecord, started: Instant) {
        let waited = started.elapsed();
        if waited > self.suspend_timeout {
            fatal_stopped(Fatal::SuspendTimeout {
                thread: rec.id,
                epoch: self.epoch(),
                waited_ms: waited.as_millis(),
            });
        }
    }

    /// Releases every thread stopped by `stopped`.
    pub fn start(&self, stopped: StoppedWorld) -> StopReport {
        let StoppedWorld {
            epoch,
            threads,
            outcomes,
            report,
        } = stopped;

        for (rec, outcome) in threads.iter().zip(&outcomes) {
            let moved = match outcome {
                Outcome::Suspended => rec
                    .try_transition(ThreadState::Suspended, ThreadState::Resuming),
                Outcome::Held => rec
                    .try_transition(ThreadState::BlockedHeld, ThreadState::Blocked),
                _ => Ok(()),
            };
            if moved.is_err() {
                fatal_stopped(Fatal::CorruptionDetected {
                    detail: "stopped thread changed state during the stop",
                    addr: rec.stack_base,
                });
            }
        }

        {
            let _gate = self.gate.lock();
            for rec in &threads {
                rec.resume_epoch.store(epoch, Ordering::Release);
            }
            self.released.notify_all();
        }
        for (rec, outcome) in threads.iter().zip(&outcomes) {
            if *outcome == Outcome::Suspended {
                self.backend.resume(rec);
            }
        }
        self.registry.end_stop();
        report
    }

    // ── Mutator side ──────────────────────────────────────────────────

    fn mask_requests(&self) -> Masked<'_> {
        self.backend.mask_requests();
        Masked(self.backend.as_ref())
    }

    /// Safepoint. Parks the calling thread if a stop asked it to.
    #[inline(never)]
    pub fn acknowledge_suspend(&self, rec: &ThreadRecord) {
        if !rec.suspend_pending() {
            return;
        }
        let _masked = self.mask_requests();
        rec.capture();
        if rec
            .try_transition(ThreadState::SuspendRequested, ThreadState::Suspended)
            .is_err()
        {
            // a signal handler acknowledged before the mask was set
            rec.clear_snapshot();
            return;
        }
        // the coordinator publishes the epoch before requesting
        let epoch = rec.requested_epoch.load(Ordering::Acquire);
        rec.ack_epoch.store(epoch, Ordering::Release);

        let mut gate = self.gate.lock();
        while rec.resume_epoch.load(Ordering::Acquire) < epoch {
            self.released.wait(&mut gate);
        }
        drop(gate);

        rec.clear_snapshot();
        let _ = rec.try_transition(ThreadState::Resuming, ThreadState::Running);
    }

    /// Saves a snapshot and declares the calling thread safe to scan
    /// without its cooperation. It must not touch the heap until
    /// [`World::leave_blocking`].
    #[inline(never)]
    pub fn enter_blocking(&self, rec: &ThreadRecord) {
        loop {
            // a suspend handler between the capture and the transition
            // would clear the snapshot the blocked state relies on
            let moved = {
                let _masked = self.mask_requests();
                rec.capture();
                rec.try_transition(ThreadState::Running, ThreadState::Blocked)
            };
            match moved {
                Ok(()) => return,
                Err(ThreadState::SuspendRequested) => {
                    self.acknowledge_suspend(rec)
                }
                Err(ThreadState::Blocked) => return,
                Err(state) => fatal(Fatal::CorruptionDetected {
                    detail: match state {
                        ThreadState::Detached => "blocking on a detached thread",
                        _ => "entering a blocking section while stopped",
                    },
                    addr: rec.stack_base,
                }),
            }
        }
    }

    /// Ends a blocking section, waiting for the world to restart if a stop
    /// holds the thread.
    pub fn leave_blocking(&self, rec: &ThreadRecord) {
        loop {
            match rec.try_transition(ThreadState::Blocked, ThreadState::Running) {
                Ok(()) => {
                    rec.clear_snapshot();
                    return;
                }
                Err(ThreadState::BlockedHeld) => {
                    let mut gate = self.gate.lock();
                    while rec.state() == ThreadState::BlockedHeld {
                        self.released.wait(&mut gate);
                    }
                }
                Err(_) => fatal(Fatal::CorruptionDetected {
                    detail: "leaving a blocking section that was never entered",
                    addr: rec.stack_base,
                }),
            }
        }
    }
}

/// Suspend requests to the calling thread are deferred while alive.
struct Masked<'a>(&'a dyn SuspendBackend);

impl Drop for Masked<'_> {
    fn drop(&mut self) {
        self.0.unmask_requests();
    }
}

#[inline]
fn backoff(rounds: &mut u32) {
    if *rounds < SPIN_ROUNDS {
        std::hint::spin_loop();
    } else if *rounds < SPIN_ROUNDS * 2 {
        thread::yield_now();
    } else {
        thread::sleep(POLL_SLEEP);
    }
    *rounds = rounds.saturating_add(1);
}
