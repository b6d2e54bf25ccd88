//! Hierarchical traffic statistics.
//!
//! A listener owns its own counters; when attached to a [`NetServer`](super::NetServer)
//! each counter is re-parented under the server's, so every increment is
//! visible at both levels.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// A pair of monotonic counters: number of events and their summed value.
pub struct Statistics {
    total: AtomicU64,
    value: AtomicU64,
    parent: ArcSwapOption<Statistics>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            value: AtomicU64::new(0),
            parent: ArcSwapOption::empty(),
        }
    }

    /// Record one event carrying `value` (bytes, or 0 for plain counts).
    pub fn increment(&self, value: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.value.fetch_add(value, Ordering::Relaxed);
        if let Some(parent) = self.parent.load_full() {
            parent.increment(value);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set_parent(&self, parent: Option<Arc<Statistics>>) {
        self.parent.store(parent);
    }

    pub fn parent(&self) -> Option<Arc<Statistics>> {
        self.parent.load_full()
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statistics")
            .field("total", &self.total())
            .field("value", &self.value())
            .finish()
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.total())?;
        let value = self.value();
        if value > 0 {
            write!(f, " ({} bytes)", value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_propagate_to_parent() {
        let parent = Arc::new(Statistics::new());
        let child = Statistics::new();
        child.set_parent(Some(parent.clone()));

        child.increment(10);
        child.increment(5);

        assert_eq!(child.total(), 2);
        assert_eq!(child.value(), 15);
        assert_eq!(parent.total(), 2);
        assert_eq!(parent.value(), 15);

        child.set_parent(None);
        child.increment(1);
        assert_eq!(parent.total(), 2);
    }

    #[test]
    fn display_includes_bytes_only_when_present() {
        let stat = Statistics::new();
        stat.increment(0);
        assert_eq!(stat.to_string(), "1");
        stat.increment(64);
        assert_eq!(stat.to_string(), "2 (64 bytes)");
    }
}
