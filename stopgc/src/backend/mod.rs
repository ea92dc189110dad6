//! Mechanisms that deliver suspend and resume requests to mutators.
//!
//! The epoch handshake itself lives in [`crate::world`]; a backend only
//! decides how a thread learns that it has to stop.

mod cooperative;
#[cfg(unix)]
mod signal;

use std::{fmt::Debug, sync::Arc};

pub use cooperative::Cooperative;
#[cfg(unix)]
pub use signal::Signal;

use crate::{error::RegisterError, settings::BackendKind, threads::ThreadRecord};

/// Outcome of sending a suspend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The target thread no longer exists.
    Gone,
}

pub trait SuspendBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Prepares the calling thread, which owns `record`, for suspension.
    fn attach(&self, record: &Arc<ThreadRecord>) -> Result<(), RegisterError>;

    /// Undoes [`SuspendBackend::attach`] on the owning thread.
    fn detach(&self, record: &ThreadRecord);

    /// Asks a thread in `SuspendRequested` to acknowledge. Runs while other
    /// threads may already be stopped: must not allocate, lock or log.
    fn request_suspend(&self, record: &ThreadRecord) -> Delivery;

    /// Repeats a request that was not acknowledged in time.
    fn retry(&self, record: &ThreadRecord) -> Delivery {
        self.request_suspend(record)
    }

    /// Wakes a thread after its `resume_epoch` was published.
    fn resume(&self, record: &ThreadRecord);

    /// Whether threads only stop at safepoints.
    fn needs_polling(&self) -> bool;

    /// Defers asynchronous requests to the calling thread until
    /// [`SuspendBackend::unmask_requests`]. Requests sent meanwhile stay
    /// pending.
    fn mask_requests(&self) {}

    fn unmask_requests(&self) {}
}

pub fn create(kind: BackendKind) -> Result<Box<dyn SuspendBackend>, &'static str> {
    match kind {
        BackendKind::Cooperative => Ok(Box::new(Cooperative)),
        #[cfg(unix)]
        BackendKind::Signal => Ok(Box::new(Signal::install()?)),
        #[cfg(not(unix))]
        BackendKind::Signal => Err("signal backend requires a unix target"),
    }
}
