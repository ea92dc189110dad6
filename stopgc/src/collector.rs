//! The collector service object and the per-thread mutator handle.
//!
//! One lock, the heap lock, serializes allocation, root changes and
//! collections. Whoever holds it may stop the world; a registered thread
//! that has to wait for it waits inside a blocking section so that a
//! collector holding the lock never waits for it in turn.

use std::{
    fmt,
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
    backend,
    error::{
        AllocError, Fatal, InitError, RegisterError, RootError, fatal,
    },
    heap::{HeapArena, ObjectKind},
    mark::{Conservative, MarkStack, MarkStats, Marker, PointerFinder},
    roots::{RootRange, RootRegistry},
    settings::CollectorSettings,
    stats::{
        AllocEvent, AllocHook, CollectionReport, CollectorStats,
        HeapResizeHook, OomHook,
    },
    sweep::Sweeper,
    system::{self, SPILL_WORDS},
    threads::{self, ThreadExit, ThreadRecord},
    world::{StoppedWorld, World},
};

static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(1);

// ── Shared state ──────────────────────────────────────────────────────

#[derive(Debug)]
struct HeapState {
    arena: HeapArena,
    roots: RootRegistry,
    mark_stack: MarkStack,
    sweeper: Sweeper,
    last_pause: Duration,
    total_pause: Duration,
}

#[derive(Default)]
struct Hooks {
    alloc: Option<AllocHook>,
    heap_resize: Option<HeapResizeHook>,
    oom: Option<OomHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("alloc", &self.alloc.is_some())
            .field("heap_resize", &self.heap_resize.is_some())
            .field("oom", &self.oom.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct CollectorShared {
    id: u64,
    settings: CollectorSettings,
    heap: Mutex<HeapState>,
    world: World,
    finder: Box<dyn PointerFinder>,
    /// Nesting depth of `disable` calls.
    disabled: AtomicUsize,
    collect_requested: AtomicBool,
    hooks: RwLock<Hooks>,
}

/// Result of an allocation under the heap lock. Hooks fire after the lock
/// is released.
struct Allocated {
    result: Result<(NonNull<u8>, usize), AllocError>,
    resized: Option<(usize, usize)>,
}

// ── Collector ─────────────────────────────────────────────────────────

/// A garbage-collected heap with its own threads, roots and settings.
///
/// Cloning yields another handle to the same collector. Instances are
/// fully isolated from each other.
#[derive(Debug, Clone)]
pub struct Collector(Arc<CollectorShared>);

impl Deref for Collector {
    type Target = CollectorShared;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Collector {
    pub fn new(settings: CollectorSettings) -> Result<Self, InitError> {
        let arena = HeapArena::new(&settings)?;
        let backend =
            backend::create(settings.backend).map_err(InitError::Settings)?;
        let world = World::new(
            backend,
            settings.suspend_timeout,
            settings.retry_interval,
        );
        let id = NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "collector {id}: heap {} of max {} bytes, {} backend, {:?} roots",
            arena.heap_size(),
            settings.max_heap_size,
            world.backend_name(),
            settings.root_policy,
        );
        if world.needs_polling() {
            log::trace!("collector {id}: mutators stop at safepoints only");
        }

        let state = HeapState {
            arena,
            roots: RootRegistry::new(settings.root_policy),
            mark_stack: MarkStack::with_capacity(settings.mark_stack_capacity),
            sweeper: Sweeper {
                unmap_threshold: settings.unmap_threshold,
            },
            last_pause: Duration::ZERO,
            total_pause: Duration::ZERO,
        };

        Ok(Self(Arc::new(CollectorShared {
            id,
            finder: Box::new(Conservative {
                interior_pointers: settings.interior_pointers,
            }),
            disabled: AtomicUsize::new(settings.disabled as usize),
            settings,
            heap: Mutex::new(state),
            world,
            collect_requested: AtomicBool::new(false),
            hooks: RwLock::new(Hooks::default()),
        })))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Registers the calling thread as a mutator. Its stack and registers
    /// are scanned on every collection until the handle is dropped, or
    /// until the thread exits if the handle is leaked.
    pub fn register_current_thread(&self) -> Result<Mutator, RegisterError> {
        if threads::current_record(self.id).is_some() {
            return Err(RegisterError::AlreadyRegistered);
        }
        let bounds =
            system::current_stack_bounds().ok_or(RegisterError::StackBounds)?;
        let record = Arc::new(ThreadRecord::for_current(bounds.base));
        self.world.attach(&record)?;
        let owner: Weak<dyn ThreadExit> = Arc::<CollectorShared>::downgrade(&self.0);
        threads::set_current(self.id, record.clone(), owner);
        log::debug!(
            "collector {}: registered thread {} (stack base {:#x})",
            self.id,
            record.id,
            bounds.base
        );
        Ok(Mutator {
            collector: self.clone(),
            record,
            _not_send: PhantomData,
        })
    }

    fn lock_heap(
        &self,
        current: Option<&Arc<ThreadRecord>>,
    ) -> MutexGuard<'_, HeapState> {
        if let Some(guard) = self.heap.try_lock() {
            return guard;
        }
        match current {
            Some(rec) => {
                self.world.enter_blocking(rec);
                let guard = self.heap.lock();
                self.world.leave_blocking(rec);
                guard
            }
            None => self.heap.lock(),
        }
    }

    // ── Roots ─────────────────────────────────────────────────────────

    /// Adds `[start, end)` to the ranges scanned on every collection.
    pub fn register_root(&self, start: usize, end: usize) -> Result<(), RootError> {
        let current = threads::current_record(self.id);
        self.lock_heap(current.as_ref()).roots.register(start, end)
    }

    pub fn unregister_root(
        &self,
        start: usize,
        end: usize,
    ) -> Result<(), RootError> {
        let current = threads::current_record(self.id);
        self.lock_heap(current.as_ref()).roots.unregister(start, end)
    }

    /// Registers the memory of `roots` as a root range.
    pub fn register_root_slice<T>(&self, roots: &[T]) -> Result<(), RootError> {
        let range = roots.as_ptr_range();
        self.register_root(range.start as usize, range.end as usize)
    }

    pub fn unregister_root_slice<T>(&self, roots: &[T]) -> Result<(), RootError> {
        let range = roots.as_ptr_range();
        self.unregister_root(range.start as usize, range.end as usize)
    }

    pub fn root_ranges(&self) -> Vec<RootRange> {
        let current = threads::current_record(self.id);
        let state = self.lock_heap(current.as_ref());
        let mut ranges = Vec::with_capacity(state.roots.len());
        state.roots.for_each(|range| ranges.push(range));
        ranges
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Runs a full collection now, even while collections are disabled.
    pub fn force_collect(&self) -> CollectionReport {
        let current = threads::current_record(self.id);
        let mut state = self.lock_heap(current.as_ref());
        self.collect_locked(&mut state, current.as_ref())
    }

    /// Asks for a collection at the next allocation or safepoint of any
    /// mutator.
    pub fn request_collection(&self) {
        self.collect_requested.store(true, Ordering::Release);
    }

    fn take_request(&self) -> bool {
        self.collections_enabled()
            && self.collect_requested.swap(false, Ordering::AcqRel)
    }

    pub fn enable(&self) {
        let prev = self
            .disabled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                depth.checked_sub(1)
            });
        if prev.is_err() {
            log::warn!("collector {}: enable without matching disable", self.id);
        }
    }

    pub fn disable(&self) {
        self.disabled.fetch_add(1, Ordering::AcqRel);
    }

    pub fn collections_enabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire) == 0
    }

    /// Number of collections started so far.
    pub fn collection_count(&self) -> u64 {
        self.world.epoch()
    }

    fn collect_locked(
        &self,
        state: &mut HeapState,
        current: Option<&Arc<ThreadRecord>>,
    ) -> CollectionReport {
        let started = Instant::now();
        let stopped = self.world.stop(current);
        let mark = self.mark_phase(state, &stopped, current);
        let stop = self.world.start(stopped);
        let pause = started.elapsed();

        let sweep = state.sweeper.sweep(&mut state.arena);
        state.last_pause = pause;
        state.total_pause += pause;

        let report = CollectionReport {
            stop,
            mark,
            sweep,
            pause,
            heap_size: state.arena.heap_size(),
        };
        self.log_collection(&report);
        report
    }

    /// Marks from roots, stopped threads and the calling thread. Runs with
    /// the world stopped: no allocation and no logging.
    #[inline(never)]
    fn mark_phase(
        &self,
        state: &mut HeapState,
        stopped: &StoppedWorld,
        current: Option<&Arc<ThreadRecord>>,
    ) -> MarkStats {
        let HeapState {
            arena,
            roots,
            mark_stack,
            ..
        } = state;
        let mut marker = Marker::new(arena, &*self.finder, mark_stack);

        roots.for_each(|range| {
            // SAFETY: registered root ranges stay readable until they are
            // unregistered
            unsafe { marker.scan_range(range.start, range.end) }
        });

        for rec in stopped.stopped_threads() {
            // SAFETY: the thread is stopped with a valid snapshot
            marker.scan_words(unsafe { rec.registers() });
            if let Some(sp) = rec.stack_ptr() {
                // SAFETY: [sp, base) is the live part of a stopped stack
                unsafe { marker.scan_range(sp, rec.stack_base) };
            }
        }

        if let Some(current) = current {
            let mut regs = [0usize; SPILL_WORDS];
            system::spill_registers(&mut regs);
            marker.scan_words(&regs);
            let sp = system::approx_sp();
            // SAFETY: our own stack, from below this frame up to its base
            unsafe { marker.scan_range(sp, current.stack_base) };
        }

        marker.finish()
    }

    fn log_collection(&self, report: &CollectionReport) {
        let CollectionReport {
            stop,
            mark,
            sweep,
            pause,
            heap_size,
        } = report;
        log::debug!(
            "collector {} gc #{}: stopped {} threads ({} blocked) in {:?}, \
             marked {} objects ({} bytes), freed {} objects ({} bytes), \
             heap {} bytes, pause {:?}",
            self.id,
            stop.epoch,
            stop.threads,
            stop.blocked,
            stop.waited,
            mark.marked_objects,
            mark.marked_bytes,
            sweep.freed_objects,
            sweep.freed_bytes,
            heap_size,
            pause,
        );
        if stop.vanished > 0 {
            log::warn!(
                "collector {} gc #{}: {} registered threads exited without \
                 unregistering",
                self.id,
                stop.epoch,
                stop.vanished
            );
        }
        if stop.retries > 0 {
            log::debug!("suspend requests were re-sent {} times", stop.retries);
        }
        if mark.overflows > 0 {
            log::debug!(
                "mark stack overflowed {} times, consider a larger \
                 mark_stack_capacity",
                mark.overflows
            );
        }
        if sweep.unmapped_blocks > 0 {
            log::trace!("returned {} idle blocks to the OS", sweep.unmapped_blocks);
        }
    }

    /// Runs `f` with every other registered thread stopped.
    ///
    /// `f` must not use this collector. With the signal backend a thread
    /// may be stopped anywhere, including inside `malloc` or while holding
    /// the logger's lock, so `f` must also not allocate (no `Vec`,
    /// `String` or `format!`), log, or take a lock a mutator might hold.
    pub fn with_world_stopped<R>(&self, f: impl FnOnce() -> R) -> R {
        let current = threads::current_record(self.id);
        let _state = self.lock_heap(current.as_ref());
        let stopped = self.world.stop(current.as_ref());
        let result = f();
        self.world.start(stopped);
        result
    }

    // ── Allocation ────────────────────────────────────────────────────

    fn allocate(
        &self,
        current: &Arc<ThreadRecord>,
        size: usize,
        kind: ObjectKind,
        tag: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        if size > isize::MAX as usize {
            return Err(self.out_of_memory(AllocError::SizeOverflow {
                requested: size,
            }));
        }
        if size > self.settings.max_heap_size {
            return Err(self.out_of_memory(AllocError::OutOfMemory {
                requested: size,
            }));
        }

        let Allocated { result, resized } = {
            let mut state = self.lock_heap(Some(current));
            self.allocate_locked(&mut state, current, size, kind)
        };

        if let Some((old, new)) = resized {
            log::debug!("collector {}: heap grew from {old} to {new} bytes", self.id);
            if let Some(hook) = &self.hooks.read().heap_resize {
                hook(old, new);
            }
        }
        match result {
            Ok((addr, usable)) => {
                if let Some(hook) = &self.hooks.read().alloc {
                    hook(&AllocEvent {
                        tag,
                        addr,
                        size: usable,
                        kind,
                    });
                }
                Ok(addr)
            }
            Err(err) => Err(self.out_of_memory(err)),
        }
    }

    fn out_of_memory(&self, err: AllocError) -> AllocError {
        let requested = match err {
            AllocError::OutOfMemory { requested }
            | AllocError::SizeOverflow { requested } => requested,
        };
        log::warn!("collector {}: {err}", self.id);
        if let Some(hook) = &self.hooks.read().oom {
            hook(requested);
        }
        err
    }

    /// Collect-or-expand: a collection is preferred once enough was
    /// allocated since the last one, the heap grows otherwise, and a failed
    /// growth is followed by up to `max_retries` collect-and-retry rounds.
    fn allocate_locked(
        &self,
        state: &mut HeapState,
        current: &Arc<ThreadRecord>,
        size: usize,
        kind: ObjectKind,
    ) -> Allocated {
        let mut resized: Option<(usize, usize)> = None;
        let small = state.arena.classes().class_for(size).is_some();
        let max_retries = self.settings.max_retries.max(1);
        let mut retries = 0;
        let mut collected = false;

        if self.take_request() {
            self.collect_locked(state, Some(current));
            collected = true;
        }

        loop {
            if let Some((_, ptr, usable)) = state.arena.try_allocate(size, kind)
            {
                return Allocated {
                    result: Ok((ptr, usable)),
                    resized,
                };
            }

            let enabled = self.collections_enabled();
            let threshold =
                state.arena.heap_size() / self.settings.free_space_divisor;
            if enabled
                && !collected
                && state.arena.counters.bytes_since_gc >= threshold
            {
                self.collect_locked(state, Some(current));
                collected = true;
                continue;
            }

            if small && !self.settings.dont_expand {
                let block_size = state.arena.block_size();
                if let Some((old, new)) = state.arena.expand(block_size) {
                    resized = Some((resized.map_or(old, |(o, _)| o), new));
                    continue;
                }
            }

            if enabled && retries < max_retries {
                retries += 1;
                collected = true;
                self.collect_locked(state, Some(current));
                continue;
            }

            return Allocated {
                result: Err(AllocError::OutOfMemory { requested: size }),
                resized,
            };
        }
    }

    fn free(&self, current: &Arc<ThreadRecord>, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let mut state = self.lock_heap(Some(current));
        if state.arena.free(addr).is_some() {
            return;
        }
        let in_blocks = state.arena.in_block_region(addr);
        drop(state);
        if in_blocks && cfg!(debug_assertions) {
            fatal(Fatal::CorruptionDetected {
                detail: "double free or free of an interior pointer",
                addr,
            });
        }
        log::warn!(
            "collector {}: ignoring free of {addr:#x}, not an allocated object",
            self.id
        );
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Start of the allocated object containing `addr`.
    pub fn base(&self, addr: usize) -> Option<NonNull<u8>> {
        let current = threads::current_record(self.id);
        let state = self.lock_heap(current.as_ref());
        let obj = state.arena.lookup(addr, true)?;
        NonNull::new(state.arena.object_range(obj).0 as *mut u8)
    }

    /// Usable size of the object starting at `base`.
    pub fn object_size(&self, base: usize) -> Option<usize> {
        let current = threads::current_record(self.id);
        let state = self.lock_heap(current.as_ref());
        let obj = state.arena.lookup(base, false)?;
        Some(state.arena.object_range(obj).1)
    }

    /// Whether `addr` points into memory managed by this collector.
    pub fn is_heap_ptr(&self, addr: usize) -> bool {
        let current = threads::current_record(self.id);
        self.lock_heap(current.as_ref()).arena.contains(addr)
    }

    /// Slot size serving a request of `size` bytes, `None` for sizes that
    /// are allocated as large objects.
    pub fn size_class_of(&self, size: usize) -> Option<usize> {
        let current = threads::current_record(self.id);
        let state = self.lock_heap(current.as_ref());
        let classes = state.arena.classes();
        classes.class_for(size).map(|class| classes.slot_size(class))
    }

    pub fn stats(&self) -> CollectorStats {
        let current = threads::current_record(self.id);
        let state = self.lock_heap(current.as_ref());
        let arena = &state.arena;
        CollectorStats {
            heap_size: arena.heap_size(),
            free_bytes: arena.free_bytes(),
            unmapped_bytes: arena.counters.unmapped_bytes,
            bytes_since_gc: arena.counters.bytes_since_gc,
            total_bytes: arena.counters.total_bytes,
            live_bytes: arena.counters.live_bytes,
            live_objects: arena.counters.live_objects,
            collections: self.world.epoch(),
            threads: self.world.thread_count(),
            roots: state.roots.len(),
            blocks_in_use: arena.blocks_in_use(),
            large_objects: arena.large_objects(),
            last_pause: state.last_pause,
            total_pause: state.total_pause,
        }
    }

    // ── Hooks ─────────────────────────────────────────────────────────

    pub fn set_alloc_hook(&self, hook: Option<AllocHook>) {
        self.hooks.write().alloc = hook;
    }

    pub fn set_heap_resize_hook(&self, hook: Option<HeapResizeHook>) {
        self.hooks.write().heap_resize = hook;
    }

    pub fn set_oom_hook(&self, hook: Option<OomHook>) {
        self.hooks.write().oom = hook;
    }
}

impl ThreadExit for CollectorShared {
    fn thread_exited(&self, record: &Arc<ThreadRecord>) {
        self.world.detach(record);
        log::debug!(
            "collector {}: thread {} exited while registered",
            self.id,
            record.id
        );
    }
}

/// Process-wide collector configured from the environment on first use.
pub fn global() -> &'static Collector {
    static GLOBAL: OnceLock<Collector> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        Collector::new(CollectorSettings::from_env())
            .expect("invalid collector environment")
    })
}

// ── Mutator ───────────────────────────────────────────────────────────

/// Handle of a registered mutator thread.
///
/// With the cooperative backend the thread must reach a safepoint
/// regularly: allocate, call [`Mutator::safepoint`], or run long
/// computations inside [`Mutator::do_blocking`]. Dropping the handle
/// unregisters the thread. A handle that outlives its thread's
/// thread-local storage, or is leaked, is unregistered when the thread
/// exits, so no request is ever sent to a thread that is gone.
#[derive(Debug)]
pub struct Mutator {
    collector: Collector,
    record: Arc<ThreadRecord>,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn thread_id(&self) -> u64 {
        self.record.id
    }

    #[inline]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with(size, ObjectKind::Normal, 0)
    }

    /// Allocates an object that is never scanned for pointers. Its contents
    /// are not cleared.
    #[inline]
    pub fn allocate_atomic(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with(size, ObjectKind::Atomic, 0)
    }

    /// Allocates with a profiling `tag` passed to the allocation hook.
    pub fn allocate_with(
        &self,
        size: usize,
        kind: ObjectKind,
        tag: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        self.collector.world.acknowledge_suspend(&self.record);
        self.collector.allocate(&self.record, size, kind, tag)
    }

    /// Frees an object before it becomes unreachable.
    pub fn free(&self, ptr: NonNull<u8>) {
        self.collector.free(&self.record, ptr);
    }

    /// Parks the thread if a stop is pending, and runs a requested
    /// collection.
    #[inline]
    pub fn safepoint(&self) {
        self.collector.world.acknowledge_suspend(&self.record);
        if self.collector.collect_requested.load(Ordering::Relaxed) {
            let mut state = self.collector.lock_heap(Some(&self.record));
            if self.collector.take_request() {
                self.collector.collect_locked(&mut state, Some(&self.record));
            }
        }
    }

    /// Collects now, scanning this thread's stack as a root.
    pub fn collect(&self) -> CollectionReport {
        let mut state = self.collector.lock_heap(Some(&self.record));
        self.collector.collect_locked(&mut state, Some(&self.record))
    }

    /// Runs `f` in a blocking section. Collections proceed without waiting
    /// for this thread; `f` must not touch the heap or hold pointers to it
    /// that are not also on the stack outside `f`.
    pub fn do_blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.collector.world.enter_blocking(&self.record);
        let _guard = Blocking {
            world: &self.collector.world,
            record: &self.record,
            enter_on_drop: false,
        };
        f()
    }

    /// Inside [`Mutator::do_blocking`], runs `f` as a normal mutator again.
    /// Outside a blocking section it simply runs `f`.
    pub fn with_gc_active<R>(&self, f: impl FnOnce() -> R) -> R {
        if !matches!(
            self.record.state(),
            threads::ThreadState::Blocked | threads::ThreadState::BlockedHeld
        ) {
            return f();
        }
        self.collector.world.leave_blocking(&self.record);
        let _guard = Blocking {
            world: &self.collector.world,
            record: &self.record,
            enter_on_drop: true,
        };
        f()
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.collector.world.detach(&self.record);
        threads::clear_current(self.collector.id);
        log::debug!(
            "collector {}: unregistered thread {}",
            self.collector.id,
            self.record.id
        );
    }
}

/// Restores the blocking state on scope exit, unwinding included.
struct Blocking<'a> {
    world: &'a World,
    record: &'a ThreadRecord,
    enter_on_drop: bool,
}

impl Drop for Blocking<'_> {
    fn drop(&mut self) {
        if self.enter_on_drop {
            self.world.enter_blocking(self.record);
        } else {
            self.world.leave_blocking(self.record);
        }
    }
}
