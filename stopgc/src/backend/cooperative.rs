use std::sync::Arc;

use super::{Delivery, SuspendBackend};
use crate::{error::RegisterError, threads::ThreadRecord};

/// Threads notice the `SuspendRequested` state at their next safepoint
/// (allocation, [`crate::Mutator::safepoint`], entering a blocking section)
/// and park themselves. The request is the state change itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cooperative;

impl SuspendBackend for Cooperative {
    fn name(&self) -> &'static str {
        "cooperative"
    }

    fn attach(&self, _record: &Arc<ThreadRecord>) -> Result<(), RegisterError> {
        Ok(())
    }

    fn detach(&self, _record: &ThreadRecord) {}

    fn request_suspend(&self, _record: &ThreadRecord) -> Delivery {
        Delivery::Delivered
    }

    fn resume(&self, _record: &ThreadRecord) {}

    fn needs_polling(&self) -> bool {
        true
    }
}
