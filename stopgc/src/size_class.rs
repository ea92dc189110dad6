//! Size-class ladder for small objects.
//!
//! Classes are granule multiples: every granule up to 128 bytes, then four
//! evenly spaced classes per doubling. Anything above half a block is a
//! large object and bypasses the ladder.

/// Allocation granule. Every slot size and slot address is a multiple.
pub const GRANULE: usize = 16;

const LINEAR_LIMIT: usize = 128;
const STEPS_PER_DOUBLING: usize = 4;

#[derive(Debug, Clone)]
pub struct SizeClasses {
    sizes: Vec<usize>,
    /// Class index by granule count, `map[g]` serves sizes up to
    /// `g * GRANULE`.
    map: Vec<u8>,
    max_small: usize,
}

impl SizeClasses {
    pub fn new(block_size: usize) -> Self {
        let max_small = (block_size / 2) / GRANULE * GRANULE;

        let mut sizes = Vec::new();
        let mut size = GRANULE;
        while size <= LINEAR_LIMIT.min(max_small) {
            sizes.push(size);
            size += GRANULE;
        }
        let mut base = LINEAR_LIMIT;
        'ladder: while base < max_small {
            let step = base / STEPS_PER_DOUBLING;
            for i in 1..=STEPS_PER_DOUBLING {
                let size = base + step * i;
                if size > max_small {
                    break 'ladder;
                }
                sizes.push(size);
            }
            base *= 2;
        }
        if sizes.last() != Some(&max_small) {
            sizes.push(max_small);
        }
        debug_assert!(sizes.len() <= u8::MAX as usize);

        let granules = max_small / GRANULE;
        let mut map = vec![0u8; granules + 1];
        let mut class = 0usize;
        for (g, entry) in map.iter_mut().enumerate().skip(1) {
            while sizes[class] < g * GRANULE {
                class += 1;
            }
            *entry = class as u8;
        }

        Self {
            sizes,
            map,
            max_small,
        }
    }

    /// Smallest class that holds `size` bytes, `None` for large objects.
    /// A zero-byte request occupies one granule.
    #[inline]
    pub fn class_for(&self, size: usize) -> Option<usize> {
        if size > self.max_small {
            return None;
        }
        let granules = size.div_ceil(GRANULE).max(1);
        Some(self.map[granules] as usize)
    }

    #[inline]
    pub fn slot_size(&self, class: usize) -> usize {
        self.sizes[class]
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn max_small(&self) -> usize {
        self.max_small
    }
}
