//! Mutator thread records and the registry the coordinator stops.

use std::{
    cell::{RefCell, UnsafeCell},
    sync::{
        Arc, Weak,
        atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::{Condvar, Mutex};

use crate::system::{self, SPILL_WORDS};

// ── Thread state ──────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running = 0,
    SuspendRequested = 1,
    Suspended = 2,
    Resuming = 3,
    /// Inside a blocking section with a saved snapshot. Safe to scan.
    Blocked = 4,
    /// Blocked thread counted as stopped by the current stop. It may not
    /// leave the blocking section until the world restarts.
    BlockedHeld = 5,
    Detached = 6,
}

impl From<u8> for ThreadState {
    fn from(val: u8) -> Self {
        match val {
            1 => ThreadState::SuspendRequested,
            2 => ThreadState::Suspended,
            3 => ThreadState::Resuming,
            4 => ThreadState::Blocked,
            5 => ThreadState::BlockedHeld,
            6 => ThreadState::Detached,
            _ => ThreadState::Running,
        }
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

// ── ThreadRecord ──────────────────────────────────────────────────────

/// Per-mutator state shared between the thread and the coordinator.
///
/// `stack_ptr` and `regs` form the snapshot. They are written only by the
/// owning thread and read by the coordinator only while the thread is
/// `Suspended`, `Blocked` or `BlockedHeld`.
#[derive(Debug)]
pub struct ThreadRecord {
    pub id: u64,
    state: AtomicU8,
    /// Epoch the coordinator wants acknowledged.
    pub requested_epoch: AtomicU64,
    /// Last epoch this thread acknowledged.
    pub ack_epoch: AtomicU64,
    /// Highest epoch the coordinator has released.
    pub resume_epoch: AtomicU64,
    /// Highest address of the thread's stack.
    pub stack_base: usize,
    stack_ptr: AtomicUsize,
    regs: UnsafeCell<[usize; SPILL_WORDS]>,
    #[cfg(unix)]
    pub handle: libc::pthread_t,
}

// SAFETY: `regs` is only written by the owning thread before publishing
// `stack_ptr` with release ordering and only read after acquiring it.
unsafe impl Send for ThreadRecord {}
// SAFETY: see above
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    /// Record for the calling thread.
    pub fn for_current(stack_base: usize) -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(ThreadState::Running as u8),
            requested_epoch: AtomicU64::new(0),
            ack_epoch: AtomicU64::new(0),
            resume_epoch: AtomicU64::new(0),
            stack_base,
            stack_ptr: AtomicUsize::new(0),
            regs: UnsafeCell::new([0; SPILL_WORDS]),
            // SAFETY: pthread_self has no preconditions
            #[cfg(unix)]
            handle: unsafe { libc::pthread_self() },
        }
    }

    #[inline(always)]
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`, returns the actual state on failure.
    #[inline]
    pub fn try_transition(
        &self,
        from: ThreadState,
        to: ThreadState,
    ) -> Result<(), ThreadState> {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ThreadState::from)
    }

    pub fn set_state(&self, to: ThreadState) {
        self.state.store(to as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn suspend_pending(&self) -> bool {
        self.state.load(Ordering::Relaxed) == ThreadState::SuspendRequested as u8
    }

    /// Saves registers and the stack pointer of the calling thread, which
    /// must be the owner. Async-signal-safe.
    #[inline(never)]
    pub fn capture(&self) {
        // SAFETY: only the owning thread writes `regs`, and nobody reads
        // them until `stack_ptr` is published below
        let regs = unsafe { &mut *self.regs.get() };
        system::spill_registers(regs);
        self.stack_ptr.store(system::approx_sp(), Ordering::Release);
    }

    pub fn clear_snapshot(&self) {
        self.stack_ptr.store(0, Ordering::Release);
    }

    /// Saved stack pointer, `None` if there is no valid snapshot.
    pub fn stack_ptr(&self) -> Option<usize> {
        match self.stack_ptr.load(Ordering::Acquire) {
            0 => None,
            sp => Some(sp),
        }
    }

    /// Saved register words.
    ///
    /// # Safety
    /// The thread must be stopped with a valid snapshot.
    pub unsafe fn registers(&self) -> &[usize; SPILL_WORDS] {
        // SAFETY: guaranteed by the caller
        unsafe { &*self.regs.get() }
    }
}

// ── ThreadRegistry ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RegistryInner {
    threads: Vec<Arc<ThreadRecord>>,
    stopping: bool,
}

/// Every thread registered with one collector.
///
/// Registration and removal wait while a stop is in progress, so the set
/// of threads is frozen from the moment a stop starts until it ends.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    inner: Mutex<RegistryInner>,
    changed: Condvar,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: Arc<ThreadRecord>) {
        let mut inner = self.inner.lock();
        while inner.stopping {
            self.changed.wait(&mut inner);
        }
        inner.threads.push(record);
    }

    pub fn unregister(&self, record: &Arc<ThreadRecord>) {
        let mut inner = self.inner.lock();
        while inner.stopping {
            self.changed.wait(&mut inner);
        }
        inner.threads.retain(|r| !Arc::ptr_eq(r, record));
    }

    /// Freezes the registry and returns the frozen set.
    pub fn begin_stop(&self) -> Vec<Arc<ThreadRecord>> {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.stopping, "nested stop");
        inner.stopping = true;
        inner.threads.clone()
    }

    pub fn end_stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopping = false;
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Current thread ────────────────────────────────────────────────────

/// Owner of a record that has to learn when its thread exits while still
/// attached, e.g. because the mutator handle was leaked.
pub trait ThreadExit: Send + Sync {
    /// Runs on the exiting thread during thread-local destruction.
    fn thread_exited(&self, record: &Arc<ThreadRecord>);
}

struct Attachment {
    collector: u64,
    record: Arc<ThreadRecord>,
    owner: Weak<dyn ThreadExit>,
}

/// Records of the calling thread, one per collector it joined.
struct Attachments(Vec<Attachment>);

impl Drop for Attachments {
    fn drop(&mut self) {
        for attachment in self.0.drain(..) {
            if let Some(owner) = attachment.owner.upgrade() {
                owner.thread_exited(&attachment.record);
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Attachments> =
        const { RefCell::new(Attachments(Vec::new())) };
}

pub fn current_record(collector: u64) -> Option<Arc<ThreadRecord>> {
    CURRENT
        .try_with(|current| {
            current
                .borrow()
                .0
                .iter()
                .find(|a| a.collector == collector)
                .map(|a| a.record.clone())
        })
        .ok()
        .flatten()
}

/// Attaches `record` to the calling thread. `owner` is told if the thread
/// exits before [`clear_current`].
pub fn set_current(
    collector: u64,
    record: Arc<ThreadRecord>,
    owner: Weak<dyn ThreadExit>,
) {
    CURRENT.with_borrow_mut(|current| {
        current.0.push(Attachment {
            collector,
            record,
            owner,
        })
    });
}

pub fn clear_current(collector: u64) {
    // try_with: may run from a destructor during thread teardown
    let _ = CURRENT.try_with(|current| {
        current.borrow_mut().0.retain(|a| a.collector != collector);
    });
}
