use std::collections::HashMap;

use ahash::RandomState;

use crate::{error::RootError, settings::RootPolicy};

/// Half-open address range `[start, end)` scanned on every collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootRange {
    pub start: usize,
    pub end: usize,
}

impl RootRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug)]
struct RootEntry {
    range: RootRange,
    count: usize,
}

/// Registered root ranges.
///
/// Overlapping ranges are kept as separate entries. Exact duplicates are
/// collapsed or counted depending on the [`RootPolicy`].
#[derive(Debug)]
pub struct RootRegistry {
    policy: RootPolicy,
    entries: Vec<RootEntry>,
    index: HashMap<RootRange, usize, RandomState>,
}

impl RootRegistry {
    pub fn new(policy: RootPolicy) -> Self {
        Self {
            policy,
            entries: Vec::new(),
            index: HashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn register(&mut self, start: usize, end: usize) -> Result<(), RootError> {
        if end < start {
            return Err(RootError::InvalidRange { start, end });
        }
        let range = RootRange { start, end };
        if range.is_empty() {
            return Ok(());
        }
        match self.index.get(&range) {
            Some(&idx) => {
                if self.policy == RootPolicy::Counted {
                    self.entries[idx].count += 1;
                }
            }
            None => {
                self.index.insert(range, self.entries.len());
                self.entries.push(RootEntry { range, count: 1 });
            }
        }
        Ok(())
    }

    pub fn unregister(&mut self, start: usize, end: usize) -> Result<(), RootError> {
        if end < start {
            return Err(RootError::InvalidRange { start, end });
        }
        let range = RootRange { start, end };
        if range.is_empty() {
            return Ok(());
        }
        let Some(&idx) = self.index.get(&range) else {
            return Err(RootError::NotRegistered { start, end });
        };
        let entry = &mut self.entries[idx];
        entry.count -= 1;
        if entry.count > 0 {
            return Ok(());
        }

        self.index.remove(&range);
        self.entries.swap_remove(idx);
        if let Some(moved) = self.entries.get(idx) {
            self.index.insert(moved.range, idx);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn contains(&self, start: usize, end: usize) -> bool {
        self.index.contains_key(&RootRange { start, end })
    }

    pub fn for_each(&self, mut visit: impl FnMut(RootRange)) {
        for entry in &self.entries {
            visit(entry.range);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
