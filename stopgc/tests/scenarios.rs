use std::{
    hint::black_box,
    ptr::NonNull,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use stopgc::{
    AllocError, Collector, CollectorSettings, Mutator, ObjectKind, RootError,
    RootPolicy,
};

const WORD: usize = size_of::<usize>();

fn create_test_settings() -> CollectorSettings {
    CollectorSettings {
        block_size: 4096,
        initial_heap_size: 64 << 10,
        max_heap_size: 64 << 20,
        ..Default::default()
    }
}

fn create_test_collector() -> Collector {
    Collector::new(create_test_settings()).expect("collector")
}

/// Binary tree node: left, right, value.
fn build_tree(mutator: &Mutator, depth: u32, value: &mut usize) -> usize {
    if depth == 0 {
        return 0;
    }
    let node = mutator.allocate(3 * WORD).expect("node").cast::<usize>();
    let left = build_tree(mutator, depth - 1, value);
    let right = build_tree(mutator, depth - 1, value);
    *value += 1;
    // SAFETY: three-word node
    unsafe {
        node.as_ptr().write(left);
        node.as_ptr().add(1).write(right);
        node.as_ptr().add(2).write(*value);
    }
    node.as_ptr() as usize
}

/// Node count, checking that every value is unique and in range.
fn check_tree(node: usize, seen: &mut [bool]) -> usize {
    if node == 0 {
        return 0;
    }
    let node = node as *const usize;
    // SAFETY: nodes reachable from a root are never reclaimed
    let (left, right, value) =
        unsafe { (node.read(), node.add(1).read(), node.add(2).read()) };
    assert!(value >= 1 && value <= seen.len(), "corrupted value {value}");
    assert!(!seen[value - 1], "node {value} visited twice");
    seen[value - 1] = true;
    1 + check_tree(left, seen) + check_tree(right, seen)
}

const MASK: usize = 0x5a5a_5a5a_5a5a_5a5a;

/// Allocates, returning only the address hidden behind `MASK` so that the
/// object is not referenced from this frame afterwards.
#[inline(never)]
fn allocate_hidden(mutator: &Mutator, size: usize) -> usize {
    let ptr = mutator.allocate(size).expect("hidden");
    black_box(ptr.as_ptr() as usize ^ MASK)
}

#[inline(never)]
fn clobber_stack() {
    black_box([0usize; 2048]);
}

// ── Reachability ──────────────────────────────────────────────────────

#[test]
fn tree_reachable_from_a_root_survives() {
    let collector = create_test_collector();
    let mutator = collector.register_current_thread().expect("register");

    let mut roots = vec![0usize; 4];
    collector.register_root_slice(&roots).expect("root");
    let mut value = 0;
    roots[0] = build_tree(&mutator, 10, &mut value);

    for _ in 0..3 {
        // garbage between collections
        for _ in 0..5000 {
            mutator.allocate(3 * WORD).expect("garbage");
        }
        mutator.collect();
    }

    let mut seen = vec![false; value];
    assert_eq!(check_tree(roots[0], &mut seen), 1023);
    assert!(seen.iter().all(|&s| s));
    collector.unregister_root_slice(&roots).expect("unroot");
}

#[test]
fn discarded_objects_keep_the_heap_bounded() {
    let collector = create_test_collector();
    let mutator = collector.register_current_thread().expect("register");

    let mut sizes = Vec::new();
    for _ in 0..40 {
        for _ in 0..2000 {
            black_box(mutator.allocate(64).expect("alloc"));
        }
        mutator.collect();
        sizes.push(collector.stats().heap_size);
    }

    // growth stops after the first rounds instead of tracking the
    // 5 MB allocated in total
    let early_peak = sizes[..10].iter().copied().max().unwrap_or(0);
    assert!(sizes[10..].iter().all(|&size| size <= early_peak), "{sizes:?}");
    assert!(early_peak < 2 << 20, "heap grew to {early_peak}");
    let stats = collector.stats();
    assert_eq!(stats.collections, 40);
    assert!(stats.live_objects < 2000);
}

#[test]
fn atomic_contents_are_never_followed() {
    let collector = create_test_collector();
    let mutator = collector.register_current_thread().expect("register");

    let mut holders = vec![0usize; 128];
    collector.register_root_slice(&holders).expect("root");
    let mut hidden = vec![0usize; 128];
    // no implicit collection may recycle a target slot before the check
    collector.disable();
    for (holder, hidden) in holders.iter_mut().zip(hidden.iter_mut()) {
        let atomic = mutator.allocate_atomic(WORD).expect("atomic");
        let target = allocate_hidden(&mutator, 2 * WORD);
        // SAFETY: one-word atomic object
        unsafe { atomic.as_ptr().cast::<usize>().write(target ^ MASK) };
        *holder = atomic.as_ptr() as usize;
        *hidden = target;
    }
    collector.enable();
    clobber_stack();
    mutator.collect();

    let atomics_alive = holders
        .iter()
        .filter(|&&holder| collector.object_size(holder).is_some())
        .count();
    let targets_alive = hidden
        .iter()
        .filter(|&&target| collector.object_size(target ^ MASK).is_some())
        .count();
    assert_eq!(atomics_alive, 128);
    // stray stack words may retain a handful, the atomic objects none
    assert!(targets_alive < 8, "{targets_alive} targets retained");
    collector.unregister_root_slice(&holders).expect("unroot");
}

#[test]
fn interior_pointers_retain_the_whole_object() {
    let collector = create_test_collector();
    let mutator = collector.register_current_thread().expect("register");

    let mut roots = vec![0usize; 1];
    collector.register_root_slice(&roots).expect("root");
    let object = mutator.allocate(256).expect("object");
    // SAFETY: 256 byte object
    unsafe { object.as_ptr().cast::<u64>().write(0xabcd) };
    roots[0] = object.as_ptr() as usize + 200;
    mutator.collect();

    assert_eq!(collector.base(roots[0]), Some(object));
    // SAFETY: still allocated
    assert_eq!(unsafe { object.as_ptr().cast::<u64>().read() }, 0xabcd);
    collector.unregister_root_slice(&roots).expect("unroot");
}

// ── Roots ─────────────────────────────────────────────────────────────

#[test]
fn duplicate_roots_are_collapsed_under_dedup() {
    let collector = create_test_collector();
    let roots = vec![0usize; 8];

    collector.register_root_slice(&roots).expect("first");
    collector.register_root_slice(&roots).expect("second");
    assert_eq!(collector.root_ranges().len(), 1);

    collector.unregister_root_slice(&roots).expect("unregister");
    assert!(collector.root_ranges().is_empty());
    assert!(matches!(
        collector.unregister_root_slice(&roots),
        Err(RootError::NotRegistered { .. })
    ));
}

#[test]
fn duplicate_roots_are_counted_under_counted() {
    let collector = Collector::new(CollectorSettings {
        root_policy: RootPolicy::Counted,
        ..create_test_settings()
    })
    .expect("collector");
    let mutator = collector.register_current_thread().expect("register");

    let mut roots = vec![0usize; 1];
    collector.register_root_slice(&roots).expect("first");
    collector.register_root_slice(&roots).expect("second");
    collector.unregister_root_slice(&roots).expect("once");
    assert_eq!(collector.root_ranges().len(), 1);

    let mut value = 0;
    roots[0] = build_tree(&mutator, 6, &mut value);
    clobber_stack();
    mutator.collect();
    let mut seen = vec![false; value];
    assert_eq!(check_tree(roots[0], &mut seen), 63);

    collector.unregister_root_slice(&roots).expect("twice");
    assert!(collector.root_ranges().is_empty());
}

#[test]
fn malformed_root_ranges_are_rejected() {
    let collector = create_test_collector();
    assert_eq!(
        collector.register_root(0x2000, 0x1000),
        Err(RootError::InvalidRange {
            start: 0x2000,
            end: 0x1000
        })
    );
    assert!(collector.root_ranges().is_empty());
}

// ── Allocation limits ─────────────────────────────────────────────────

#[test]
fn huge_requests_fail_cleanly() {
    let collector = create_test_collector();
    let mutator = collector.register_current_thread().expect("register");

    for size in [usize::MAX / 2 - 1, usize::MAX / 2, usize::MAX / 2 + 1] {
        let err = mutator.allocate(size).expect_err("must not wrap around");
        assert!(matches!(
            err,
            AllocError::OutOfMemory { .. } | AllocError::SizeOverflow { .. }
        ));
    }
    assert_eq!(
        mutator.allocate(usize::MAX),
        Err(AllocError::SizeOverflow {
            requested: usize::MAX
        })
    );
    // the collector is still usable
    mutator.allocate(64).expect("small");
}

#[test]
fn out_of_memory_is_reported_after_collecting() {
    let collector = Collector::new(CollectorSettings {
        initial_heap_size: 4096 * 4,
        max_heap_size: 4096 * 16,
        ..create_test_settings()
    })
    .expect("collector");
    let mutator = collector.register_current_thread().expect("register");

    let mut keep = vec![0usize; 64];
    collector.register_root_slice(&keep).expect("root");
    let mut failed = None;
    for slot in keep.iter_mut() {
        match mutator.allocate(2048) {
            Ok(ptr) => *slot = ptr.as_ptr() as usize,
            Err(err) => {
                failed = Some(err);
                break;
            }
        }
    }

    assert_eq!(failed, Some(AllocError::OutOfMemory { requested: 2048 }));
    assert!(collector.collection_count() > 0);
    assert!(collector.stats().heap_size <= 4096 * 16);
    collector.unregister_root_slice(&keep).expect("unroot");
}

#[test]
fn smash_with_periodic_collections() {
    const OBJECTS: usize = 7000;
    let collector = create_test_collector();
    let mutator = collector.register_current_thread().expect("register");

    // every seventh object stays referenced from the root array
    let mut roots = vec![0usize; OBJECTS / 7];
    collector.register_root_slice(&roots).expect("root");
    for i in 0..OBJECTS {
        let obj = mutator.allocate(40).expect("alloc");
        // SAFETY: 40 byte object
        unsafe { obj.as_ptr().cast::<usize>().write(i) };
        if i % 7 == 0 {
            roots[i / 7] = obj.as_ptr() as usize;
        }
        if i % 3000 == 2999 {
            collector.force_collect();
        }
    }
    clobber_stack();
    let report = mutator.collect();

    for (n, &obj) in roots.iter().enumerate() {
        // SAFETY: rooted objects are alive
        assert_eq!(unsafe { (obj as *const usize).read() }, n * 7);
    }
    // conservative retention may keep a few stray objects
    assert!(report.sweep.live_objects >= OBJECTS / 7);
    assert!(report.sweep.live_objects < OBJECTS / 7 + 64);
    collector.unregister_root_slice(&roots).expect("unroot");
}

#[test]
fn explicit_free_and_large_objects() {
    let collector = create_test_collector();
    let mutator = collector.register_current_thread().expect("register");

    let large = mutator.allocate(100 << 10).expect("large");
    let size = collector.object_size(large.as_ptr() as usize).expect("size");
    assert!(size >= 100 << 10);
    assert!(collector.is_heap_ptr(large.as_ptr() as usize + 50_000));
    assert_eq!(collector.stats().large_objects, 1);

    mutator.free(large);
    assert!(!collector.is_heap_ptr(large.as_ptr() as usize));
    assert_eq!(collector.stats().large_objects, 0);
}

// ── Threads ───────────────────────────────────────────────────────────

/// Allocates a list of `len` two-word cells and returns its head.
fn build_list(mutator: &Mutator, len: usize) -> usize {
    let mut head = 0;
    for value in 0..len {
        let cell = mutator.allocate(2 * WORD).expect("cell").cast::<usize>();
        // SAFETY: two-word cell
        unsafe {
            cell.as_ptr().write(head);
            cell.as_ptr().add(1).write(value);
        }
        head = cell.as_ptr() as usize;
    }
    head
}

fn list_is_intact(head: usize, len: usize) -> bool {
    let mut cell = head as *const usize;
    for expected in (0..len).rev() {
        if cell.is_null() {
            return false;
        }
        // SAFETY: cells on a live list are allocated
        let (next, value) = unsafe { (cell.read(), cell.add(1).read()) };
        if value != expected {
            return false;
        }
        cell = next as *const usize;
    }
    cell.is_null()
}

#[test]
fn polling_threads_survive_concurrent_collections() {
    const THREADS: usize = 4;
    let collector = create_test_collector();
    let done = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(THREADS + 1));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let (collector, done, ready) =
                (collector.clone(), done.clone(), ready.clone());
            thread::spawn(move || {
                let mutator = collector.register_current_thread().expect("register");
                let list = build_list(&mutator, 200);
                ready.wait();
                let mut rounds = 0usize;
                while !done.load(Ordering::Relaxed) {
                    let scratch = build_list(&mutator, 10);
                    assert!(list_is_intact(scratch, 10));
                    rounds += 1;
                }
                assert!(list_is_intact(list, 200), "live list was reclaimed");
                rounds
            })
        })
        .collect();

    ready.wait();
    for _ in 0..25 {
        let report = collector.force_collect();
        assert_eq!(
            report.stop.acknowledged + report.stop.blocked + report.stop.vanished,
            report.stop.threads
        );
        thread::sleep(Duration::from_millis(2));
    }
    done.store(true, Ordering::Relaxed);

    let rounds: usize = workers
        .into_iter()
        .map(|w| w.join().expect("worker"))
        .sum();
    assert!(rounds > 0);
    assert!(collector.collection_count() >= 25);
    assert_eq!(collector.stats().threads, 0);
}

#[test]
fn blocked_threads_do_not_delay_collections() {
    let collector = Collector::new(CollectorSettings {
        suspend_timeout: Duration::from_secs(5),
        ..create_test_settings()
    })
    .expect("collector");
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(AtomicBool::new(false));

    let worker = {
        let (collector, entered, release) =
            (collector.clone(), entered.clone(), release.clone());
        thread::spawn(move || {
            let mutator = collector.register_current_thread().expect("register");
            let list = build_list(&mutator, 50);
            mutator.do_blocking(|| {
                entered.wait();
                while !release.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            });
            // usable again after the blocking section
            mutator.allocate(32).expect("alloc");
            list_is_intact(list, 50)
        })
    };

    entered.wait();
    let report = collector.force_collect();
    assert_eq!(report.stop.threads, 1);
    assert_eq!(report.stop.blocked, 1);
    assert!(report.stop.waited < Duration::from_secs(1));
    release.store(true, Ordering::Release);
    assert!(worker.join().expect("worker"), "list scanned from snapshot");
}

#[test]
fn world_stopped_closure_sees_no_progress() {
    let collector = create_test_collector();
    let progress = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(2));

    let worker = {
        let (collector, progress, done, ready) = (
            collector.clone(),
            progress.clone(),
            done.clone(),
            ready.clone(),
        );
        thread::spawn(move || {
            let mutator = collector.register_current_thread().expect("register");
            ready.wait();
            while !done.load(Ordering::Relaxed) {
                mutator.safepoint();
                progress.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    ready.wait();
    let (before, after) = collector.with_world_stopped(|| {
        let before = progress.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        (before, progress.load(Ordering::Relaxed))
    });
    assert_eq!(before, after);
    done.store(true, Ordering::Relaxed);
    worker.join().expect("worker");
}

#[test]
fn threads_may_come_and_go_during_collections() {
    let collector = create_test_collector();
    let done = Arc::new(AtomicBool::new(false));

    let churners: Vec<_> = (0..3)
        .map(|_| {
            let (collector, done) = (collector.clone(), done.clone());
            thread::spawn(move || {
                let mut registrations = 0;
                while !done.load(Ordering::Relaxed) {
                    let mutator =
                        collector.register_current_thread().expect("register");
                    let list = build_list(&mutator, 20);
                    assert!(list_is_intact(list, 20));
                    drop(mutator);
                    registrations += 1;
                }
                registrations
            })
        })
        .collect();

    for _ in 0..20 {
        collector.force_collect();
        thread::sleep(Duration::from_millis(1));
    }
    done.store(true, Ordering::Relaxed);
    for churner in churners {
        assert!(churner.join().expect("churner") > 0);
    }
    assert_eq!(collector.stats().threads, 0);
}

#[test]
fn requested_collection_runs_at_a_safepoint() {
    let collector = create_test_collector();
    let mutator = collector.register_current_thread().expect("register");
    collector.request_collection();
    mutator.safepoint();
    assert_eq!(collector.collection_count(), 1);
}

#[test]
fn collectors_are_isolated() {
    let first = create_test_collector();
    let second = create_test_collector();
    let m1 = first.register_current_thread().expect("first");
    let m2 = second.register_current_thread().expect("second");

    let a: NonNull<u8> = m1.allocate(64).expect("a");
    let b = m2.allocate_with(64, ObjectKind::Atomic, 1).expect("b");
    assert!(first.is_heap_ptr(a.as_ptr() as usize));
    assert!(!first.is_heap_ptr(b.as_ptr() as usize));
    assert!(second.is_heap_ptr(b.as_ptr() as usize));

    m1.collect();
    assert_eq!(first.collection_count(), 1);
    assert_eq!(second.collection_count(), 0);
    black_box((a, b));
}

#[cfg(target_os = "linux")]
#[test]
fn signal_backend_stops_threads_that_never_poll() {
    use stopgc::BackendKind;

    const THREADS: usize = 3;
    let collector = Collector::new(CollectorSettings {
        backend: BackendKind::Signal,
        ..create_test_settings()
    })
    .expect("collector");
    let done = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(THREADS + 1));

    let spinners: Vec<_> = (0..THREADS)
        .map(|_| {
            let (collector, done, ready) =
                (collector.clone(), done.clone(), ready.clone());
            thread::spawn(move || {
                let mutator = collector.register_current_thread().expect("register");
                let list = build_list(&mutator, 100);
                ready.wait();
                let mut spins = 0u64;
                while !done.load(Ordering::Relaxed) {
                    spins = black_box(spins.wrapping_add(1));
                }
                list_is_intact(black_box(list), 100)
            })
        })
        .collect();

    ready.wait();
    for _ in 0..10 {
        let report = collector.force_collect();
        assert_eq!(report.stop.threads, THREADS);
        assert_eq!(report.stop.acknowledged, THREADS);
    }
    done.store(true, Ordering::Relaxed);
    for spinner in spinners {
        assert!(spinner.join().expect("spinner"), "list survived");
    }
}

// ── Failure paths ─────────────────────────────────────────────────────

/// Runs `test` alone in a child copy of this test binary, with
/// `STOPGC_CHILD` set so the test takes its aborting branch.
fn run_in_child(test: &str) -> std::process::Output {
    let exe = std::env::current_exe().expect("test binary");
    std::process::Command::new(exe)
        .args(["--exact", test, "--nocapture", "--test-threads=1"])
        .env("STOPGC_CHILD", test)
        .output()
        .expect("spawn child")
}

#[test]
fn thread_that_never_polls_aborts_the_collection() {
    if std::env::var_os("STOPGC_CHILD").is_some() {
        let collector = Collector::new(CollectorSettings {
            suspend_timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(10),
            ..create_test_settings()
        })
        .expect("collector");
        let ready = Arc::new(Barrier::new(2));
        {
            let (collector, ready) = (collector.clone(), ready.clone());
            thread::spawn(move || {
                let _mutator =
                    collector.register_current_thread().expect("register");
                ready.wait();
                let mut spins = 0u64;
                loop {
                    spins = black_box(spins.wrapping_add(1));
                }
            });
        }
        ready.wait();
        collector.force_collect();
        return;
    }

    let output = run_in_child("thread_that_never_polls_aborts_the_collection");
    assert!(!output.status.success(), "collection must abort");
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("did not acknowledge suspension"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn leaked_mutators_are_unregistered_when_their_thread_exits() {
    use stopgc::BackendKind;

    let mut backends = vec![BackendKind::Cooperative];
    if cfg!(target_os = "linux") {
        backends.push(BackendKind::Signal);
    }
    for backend in backends {
        let collector = Collector::new(CollectorSettings {
            backend,
            ..create_test_settings()
        })
        .expect("collector");
        let leaker = {
            let collector = collector.clone();
            thread::spawn(move || {
                let mutator =
                    collector.register_current_thread().expect("register");
                black_box(build_list(&mutator, 10));
                std::mem::forget(mutator);
            })
        };
        // joining waits for the thread's thread-local destructors
        leaker.join().expect("leaker");

        assert_eq!(collector.stats().threads, 0);
        let report = collector.force_collect();
        assert_eq!(report.stop.threads, 0);
    }
}

#[cfg(target_os = "linux")]
#[test]
fn world_stopped_closure_runs_while_signalled_threads_spin() {
    use stopgc::BackendKind;

    let collector = Collector::new(CollectorSettings {
        backend: BackendKind::Signal,
        ..create_test_settings()
    })
    .expect("collector");
    let progress = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(2));

    let worker = {
        let (collector, progress, done, ready) = (
            collector.clone(),
            progress.clone(),
            done.clone(),
            ready.clone(),
        );
        thread::spawn(move || {
            let mutator = collector.register_current_thread().expect("register");
            ready.wait();
            while !done.load(Ordering::Relaxed) {
                // may be stopped inside the allocator or the logger
                let cell = mutator.allocate(32).expect("cell");
                log::trace!("cell at {:p}", cell.as_ptr());
                progress.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    ready.wait();
    // atomics and sleeping only inside the closure
    let (before, after) = collector.with_world_stopped(|| {
        let before = progress.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        (before, progress.load(Ordering::Relaxed))
    });
    assert_eq!(before, after);
    done.store(true, Ordering::Relaxed);
    worker.join().expect("worker");
}
