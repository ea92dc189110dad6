use std::time::Duration;

use crate::{OS_PAGE_SIZE, size_class::GRANULE};

/// How exact duplicate root ranges are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootPolicy {
    /// Registering an already registered range is a no-op, a single
    /// unregister removes it.
    Dedup,
    /// Duplicates are counted and the range stays scanned until it has been
    /// unregistered as many times as it was registered.
    Counted,
}

/// Mechanism used to bring mutator threads to a halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Threads stop themselves at safepoints (allocation, explicit polls).
    Cooperative,
    /// Threads are interrupted with a POSIX signal. Unix only.
    Signal,
}

/// Configuration of a collector instance.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Size of a heap block. Must be a multiple of the OS page size.
    pub block_size: usize,
    /// Heap size the collector starts with.
    pub initial_heap_size: usize,
    /// Upper bound for blocks plus large objects. Also the size of the
    /// address space reservation for blocks.
    pub max_heap_size: usize,
    /// A collection is preferred over heap growth once more than
    /// `heap_size / free_space_divisor` bytes were allocated since the last
    /// collection.
    pub free_space_divisor: usize,
    /// Number of collect-then-retry rounds before an allocation fails.
    pub max_retries: u32,
    /// Never grow the heap beyond `initial_heap_size`.
    pub dont_expand: bool,
    /// Treat pointers into the middle of an object as references to it.
    pub interior_pointers: bool,
    pub root_policy: RootPolicy,
    pub backend: BackendKind,
    /// Bound on the wait for suspend acknowledgments. Exceeding it aborts.
    pub suspend_timeout: Duration,
    /// Interval at which the signal backend re-sends unanswered requests.
    pub retry_interval: Duration,
    /// Entries of the mark stack. It is allocated once and never grows.
    pub mark_stack_capacity: usize,
    /// Collections a fully free block stays committed before its pages are
    /// returned to the OS. Zero keeps every page.
    pub unmap_threshold: u32,
    /// Start with implicit collections disabled.
    pub disabled: bool,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            block_size: 16_384,              // 16 KB = 4 pages
            initial_heap_size: 262_144,      // 256 KB
            max_heap_size: 536_870_912,      // 512 MB
            free_space_divisor: 3,
            max_retries: 1,
            dont_expand: false,
            interior_pointers: true,
            root_policy: RootPolicy::Dedup,
            backend: BackendKind::Cooperative,
            suspend_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
            mark_stack_capacity: 16_384,
            unmap_threshold: 6,
            disabled: false,
        }
    }
}

impl CollectorSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.block_size == 0
            || self.initial_heap_size == 0
            || self.max_heap_size == 0
        {
            return Err("Sizes must be > 0");
        }
        if !self.block_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("block_size must match OS page alignment");
        }
        if self.block_size / GRANULE >= u16::MAX as usize {
            return Err("block_size too large for metadata");
        }
        if self.initial_heap_size > self.max_heap_size {
            return Err("initial_heap_size must not exceed max_heap_size");
        }
        if self.max_heap_size < self.block_size {
            return Err("max_heap_size must hold at least one block");
        }
        if self.max_heap_size > isize::MAX as usize / 2 {
            return Err("max_heap_size exceeds the address space");
        }
        if self.free_space_divisor == 0 {
            return Err("free_space_divisor must be > 0");
        }
        if self.mark_stack_capacity < 64 {
            return Err("mark_stack_capacity must be at least 64");
        }
        if self.suspend_timeout.is_zero() {
            return Err("suspend_timeout must be > 0");
        }
        if self.retry_interval > self.suspend_timeout {
            return Err("retry_interval must not exceed suspend_timeout");
        }
        if cfg!(not(unix)) && self.backend == BackendKind::Signal {
            return Err("signal backend requires a unix target");
        }
        Ok(())
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    /// Overlays the classic collector environment variables, looked up
    /// through `lookup`. Malformed values, and values that would make valid
    /// settings fail [`CollectorSettings::validate`], are ignored with a
    /// warning.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let size = |name: &str| -> Option<usize> {
            let raw = lookup(name)?;
            let parsed = parse_mem_size(&raw);
            if parsed.is_none() {
                log::warn!("ignoring bad {name} value {raw:?}");
            }
            parsed
        };
        let number = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            let parsed = raw.trim().parse::<u64>().ok();
            if parsed.is_none() {
                log::warn!("ignoring bad {name} value {raw:?}");
            }
            parsed
        };

        if let Some(initial) = size("GC_INITIAL_HEAP_SIZE") {
            self.overlay("GC_INITIAL_HEAP_SIZE", |s| {
                s.initial_heap_size = initial;
            });
        }
        if let Some(max) = size("GC_MAXIMUM_HEAP_SIZE") {
            self.overlay("GC_MAXIMUM_HEAP_SIZE", |s| {
                s.max_heap_size = max;
                if s.max_retries == 0 {
                    s.max_retries = 2;
                }
            });
        }
        if let Some(divisor) = number("GC_FREE_SPACE_DIVISOR") {
            self.overlay("GC_FREE_SPACE_DIVISOR", |s| {
                s.free_space_divisor = divisor.try_into().unwrap_or(0);
            });
        }
        if let Some(threshold) = number("GC_UNMAP_THRESHOLD") {
            self.unmap_threshold = threshold.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = number("GC_SUSPEND_TIMEOUT_MS") {
            self.overlay("GC_SUSPEND_TIMEOUT_MS", |s| {
                s.suspend_timeout = Duration::from_millis(ms);
            });
        }
        if lookup("GC_DONT_GC").is_some() {
            self.disabled = true;
        }
        if lookup("GC_ALL_INTERIOR_POINTERS").is_some() {
            self.interior_pointers = true;
        }
        self
    }

    /// Applies one variable and reverts it if it breaks valid settings.
    fn overlay(&mut self, name: &str, apply: impl FnOnce(&mut Self)) {
        let previous = self.clone();
        apply(self);
        if let (Err(reason), Ok(())) = (self.validate(), previous.validate()) {
            log::warn!("ignoring {name}: {reason}");
            *self = previous;
        }
    }
}

/// Parses sizes like `65536`, `64k`, `16M` or `1g`.
pub fn parse_mem_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.char_indices().last()? {
        (idx, 'k' | 'K') => (&raw[..idx], 1usize << 10),
        (idx, 'm' | 'M') => (&raw[..idx], 1usize << 20),
        (idx, 'g' | 'G') => (&raw[..idx], 1usize << 30),
        _ => (raw, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        CollectorSettings::default()
            .validate()
            .expect("default settings must validate");
    }

    #[test]
    fn validate_rejects_bad_block_sizes() {
        let unaligned = CollectorSettings {
            block_size: 5000,
            ..Default::default()
        };
        assert_eq!(
            unaligned.validate(),
            Err("block_size must match OS page alignment")
        );

        let huge = CollectorSettings {
            block_size: 4 * 1024 * 1024,
            max_heap_size: 64 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(huge.validate(), Err("block_size too large for metadata"));
    }

    #[test]
    fn validate_rejects_inverted_heap_bounds() {
        let settings = CollectorSettings {
            initial_heap_size: 2 << 20,
            max_heap_size: 1 << 20,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parses_memory_sizes_with_suffixes() {
        assert_eq!(parse_mem_size("4096"), Some(4096));
        assert_eq!(parse_mem_size("64k"), Some(64 * 1024));
        assert_eq!(parse_mem_size("16M"), Some(16 * 1024 * 1024));
        assert_eq!(parse_mem_size(" 1g "), Some(1 << 30));
        assert_eq!(parse_mem_size("lots"), None);
        assert_eq!(parse_mem_size(""), None);
        assert_eq!(parse_mem_size("99999999999999999999g"), None);
    }

    #[test]
    fn environment_overlay_applies_known_variables() {
        let env: HashMap<&str, &str> = [
            ("GC_INITIAL_HEAP_SIZE", "1m"),
            ("GC_MAXIMUM_HEAP_SIZE", "32M"),
            ("GC_FREE_SPACE_DIVISOR", "5"),
            ("GC_DONT_GC", "1"),
            ("GC_SUSPEND_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();

        let settings = CollectorSettings::default()
            .with_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(settings.initial_heap_size, 1 << 20);
        assert_eq!(settings.max_heap_size, 32 << 20);
        assert_eq!(settings.free_space_divisor, 5);
        assert!(settings.disabled);
        assert_eq!(settings.suspend_timeout, Duration::from_millis(250));
        settings.validate().expect("overlay must stay valid");
    }

    #[test]
    fn environment_overlay_ignores_garbage() {
        let settings = CollectorSettings::default().with_env(|name| {
            (name == "GC_MAXIMUM_HEAP_SIZE" || name == "GC_FREE_SPACE_DIVISOR")
                .then(|| "not-a-size".to_string())
        });
        let defaults = CollectorSettings::default();
        assert_eq!(settings.max_heap_size, defaults.max_heap_size);
        assert_eq!(settings.free_space_divisor, defaults.free_space_divisor);
    }

    #[test]
    fn environment_overlay_keeps_settings_valid() {
        let too_big = CollectorSettings::default().with_env(|name| {
            (name == "GC_INITIAL_HEAP_SIZE").then(|| "1g".into())
        });
        assert_eq!(
            too_big.initial_heap_size,
            CollectorSettings::default().initial_heap_size
        );
        too_big.validate().expect("initial size above max is dropped");

        let too_short = CollectorSettings::default().with_env(|name| {
            (name == "GC_SUSPEND_TIMEOUT_MS").then(|| "10".into())
        });
        assert_eq!(too_short.suspend_timeout, Duration::from_secs(10));
        too_short.validate().expect("timeout below retry is dropped");

        let zero = CollectorSettings::default().with_env(|name| {
            (name == "GC_FREE_SPACE_DIVISOR").then(|| "0".into())
        });
        assert_eq!(zero.free_space_divisor, 3);
    }

    #[test]
    fn environment_overlay_checks_variables_in_order() {
        // checked one at a time, in order
        let env: HashMap<&str, &str> = [
            ("GC_INITIAL_HEAP_SIZE", "1g"),
            ("GC_MAXIMUM_HEAP_SIZE", "2g"),
        ]
        .into_iter()
        .collect();
        let settings = CollectorSettings::default()
            .with_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(settings.initial_heap_size, 262_144);
        assert_eq!(settings.max_heap_size, 2 << 30);
        settings.validate().expect("valid");
    }
}
