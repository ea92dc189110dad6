use clap::{Parser as ClapParser, Subcommand};
use std::{process, thread, time::Instant};

use stopgc::{Collector, CollectorSettings, Mutator, parse_mem_size};

/// Exercises the collector with synthetic workloads.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Maximum heap size, e.g. 64M. Defaults to the environment setting
    #[arg(long, value_parser = parse_size)]
    max_heap: Option<usize>,

    /// Suspend threads with signals instead of polling
    #[arg(long)]
    signals: bool,

    #[command(subcommand)]
    workload: Workload,
}

#[derive(Subcommand, Debug)]
enum Workload {
    /// Builds short-lived linked lists and keeps a few alive
    Smash {
        #[arg(long, default_value_t = 7000)]
        rounds: usize,
        #[arg(long, default_value_t = 40)]
        length: usize,
    },
    /// Requests objects near the address-space limit, all of which must fail
    Huge,
    /// Several registered threads allocating concurrently
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 20000)]
        allocations: usize,
    },
    /// Mixed small and large objects, half of them freed explicitly
    Churn {
        #[arg(long, default_value_t = 10000)]
        objects: usize,
    },
}

fn parse_size(raw: &str) -> Result<usize, String> {
    parse_mem_size(raw).ok_or_else(|| format!("invalid size '{raw}'"))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = CollectorSettings::from_env();
    if let Some(max) = cli.max_heap {
        settings.max_heap_size = max;
        settings.initial_heap_size = settings.initial_heap_size.min(max);
    }
    if cli.signals {
        settings.backend = stopgc::BackendKind::Signal;
    }

    let collector = match Collector::new(settings) {
        Ok(collector) => collector,
        Err(err) => {
            eprintln!("Error creating collector: {}", err);
            process::exit(1);
        }
    };

    let started = Instant::now();
    let result = match cli.workload {
        Workload::Smash { rounds, length } => smash(&collector, rounds, length),
        Workload::Huge => huge(&collector),
        Workload::Stress {
            threads,
            allocations,
        } => stress(&collector, threads, allocations),
        Workload::Churn { objects } => churn(&collector, objects),
    };
    if let Err(err) = result {
        eprintln!("Error: {}", err);
        process::exit(1);
    }

    let stats = collector.stats();
    println!("finished in {:?}", started.elapsed());
    println!(
        "heap {} bytes, {} free, {} live in {} objects",
        stats.heap_size, stats.free_bytes, stats.live_bytes, stats.live_objects
    );
    println!(
        "{} collections, last pause {:?}, total pause {:?}",
        stats.collections, stats.last_pause, stats.total_pause
    );
}

fn register(collector: &Collector) -> Result<Mutator, String> {
    collector
        .register_current_thread()
        .map_err(|err| err.to_string())
}

/// Allocates a list of `length` two-word cells, newest first. Returns the
/// address of the head cell, 0 for an empty list.
fn build_list(mutator: &Mutator, length: usize) -> Result<usize, String> {
    let mut head = 0usize;
    for value in 0..length {
        let cell = mutator
            .allocate(2 * size_of::<usize>())
            .map_err(|err| err.to_string())?
            .cast::<usize>();
        // SAFETY: fresh two-word cell
        unsafe {
            cell.as_ptr().write(head);
            cell.as_ptr().add(1).write(value);
        }
        head = cell.as_ptr() as usize;
    }
    Ok(head)
}

fn list_len(head: usize) -> usize {
    let mut len = 0;
    let mut cell = head as *const usize;
    while !cell.is_null() {
        len += 1;
        // SAFETY: cells stay reachable while the list is walked
        cell = unsafe { cell.read() } as *const usize;
    }
    len
}

fn smash(collector: &Collector, rounds: usize, length: usize) -> Result<(), String> {
    let mutator = register(collector)?;
    let mut keep = vec![0usize; rounds.div_ceil(1000)];
    collector
        .register_root_slice(&keep)
        .map_err(|err| err.to_string())?;
    for round in 0..rounds {
        let list = build_list(&mutator, length)?;
        if round % 1000 == 0 {
            keep[round / 1000] = list;
        }
    }
    let intact = keep.iter().all(|&list| list_len(list) == length);
    collector
        .unregister_root_slice(&keep)
        .map_err(|err| err.to_string())?;
    if !intact {
        return Err("a kept list lost cells".into());
    }
    Ok(())
}

fn huge(collector: &Collector) -> Result<(), String> {
    let mutator = register(collector)?;
    for size in [usize::MAX / 2 - 1, usize::MAX / 2, usize::MAX / 2 + 1, usize::MAX]
    {
        if mutator.allocate(size).is_ok() {
            return Err(format!("allocation of {size} bytes succeeded"));
        }
    }
    println!("all huge allocations were refused");
    Ok(())
}

fn stress(collector: &Collector, threads: usize, allocations: usize) -> Result<(), String> {
    thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(move || -> Result<(), String> {
                    let mutator = register(collector)?;
                    let list = build_list(&mutator, 64)?;
                    for _ in 0..allocations {
                        mutator
                            .allocate(48)
                            .map_err(|err| err.to_string())?;
                    }
                    if list_len(list) != 64 {
                        return Err("a live list lost cells".into());
                    }
                    Ok(())
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker
                    .join()
                    .unwrap_or_else(|_| Err("worker panicked".into()))
            })
            .collect()
    })
}

fn churn(collector: &Collector, objects: usize) -> Result<(), String> {
    let mutator = register(collector)?;
    for i in 0..objects {
        let size = if i % 97 == 0 { 64 << 10 } else { 16 + i % 400 };
        let ptr = mutator.allocate(size).map_err(|err| err.to_string())?;
        if i % 2 == 0 {
            mutator.free(ptr);
        }
    }
    Ok(())
}
