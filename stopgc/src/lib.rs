//! Conservative stop-the-world mark-sweep garbage collector.
//!
//! A [`Collector`] owns a heap of size-segregated blocks plus a space for
//! large objects. Threads that hold references into the heap register with
//! [`Collector::register_current_thread`]; their stacks and registers are
//! scanned conservatively on every collection, together with explicitly
//! registered root ranges.

mod backend;
mod block;
mod collector;
mod error;
mod heap;
mod large;
mod mark;
mod roots;
mod settings;
mod size_class;
mod stats;
mod sweep;
mod system;
mod threads;
mod world;

pub use collector::{Collector, CollectorShared, Mutator, global};
pub use error::{AllocError, Fatal, InitError, RegisterError, RootError};
pub use heap::ObjectKind;
pub use large::LargeSweep;
pub use mark::MarkStats;
pub use roots::RootRange;
pub use settings::{BackendKind, CollectorSettings, RootPolicy, parse_mem_size};
pub use size_class::GRANULE;
pub use stats::{
    AllocEvent, AllocHook, CollectionReport, CollectorStats, HeapResizeHook,
    OomHook,
};
pub use sweep::SweepReport;
pub use system::OS_PAGE_SIZE;
pub use world::StopReport;
