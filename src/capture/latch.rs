use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// One-way slot: the first `set` wins, later values are dropped.
#[derive(Debug)]
pub struct Latch<T> {
    resolved: AtomicBool,
    value: OnceLock<T>,
}

impl<T> Latch<T> {
    pub fn new() -> Self {
        Self {
            resolved: AtomicBool::new(false),
            value: OnceLock::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Returns true when this call latched the value
    pub fn set(&self, value: T) -> bool {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.value.set(value).is_ok()
    }

    pub fn get(&self) -> Option<&T> {
        if self.is_set() {
            self.value.get()
        } else {
            None
        }
    }
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}
