//! Global fragment-memory budget
//!
//! One counter tracks the byte total of every fragment held by any ring
//! buffer in the process. Before a ring accepts a new fragment it asks the
//! limiter, which trims that ring's oldest fragments until the new one fits
//! or the ring is empty; a fragment that still does not fit is rejected.
//! Rings debit the counter when they rotate a fragment out and when they
//! are released wholesale on close.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::source::Fragment;

/// Memory limiter configuration
#[derive(Debug, Clone)]
pub struct MemoryLimiterConfig {
    /// True if the limiter is active
    pub enabled: bool,

    /// Budget in bytes
    pub limit: u64,
}

impl Default for MemoryLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 256 * 1024 * 1024,
        }
    }
}

/// Process-wide fragment-memory limiter
///
/// The counter lives under a plain mutex; none of the operations suspend,
/// so the lock is never held across an await point.
#[derive(Debug)]
pub struct MemoryLimiter {
    config: MemoryLimiterConfig,
    usage: Mutex<u64>,
}

impl MemoryLimiter {
    /// Create a new limiter
    pub fn new(config: MemoryLimiterConfig) -> Self {
        Self {
            config,
            usage: Mutex::new(0),
        }
    }

    /// Current usage in bytes
    pub fn usage(&self) -> u64 {
        *self.usage.lock().unwrap()
    }

    /// Check the budget before adding a fragment to a ring buffer
    ///
    /// While over budget, removes the ring's oldest fragments (debiting the
    /// counter for each). Returns true if the fragment fits after trimming,
    /// in which case its size has been charged and the caller must append
    /// it; false leaves the ring as trimmed and the fragment uncharged.
    pub fn check_before_adding(
        &self,
        buffer: &mut VecDeque<Arc<Fragment>>,
        fragment: &Fragment,
    ) -> bool {
        if !self.config.enabled || fragment.is_empty() {
            return true;
        }

        let fragment_len = fragment.len() as u64;
        let mut usage = self.usage.lock().unwrap();

        while *usage + fragment_len > self.config.limit {
            match buffer.pop_front() {
                Some(removed) => {
                    *usage -= removed.len() as u64;
                }
                None => break,
            }
        }

        let can_add = *usage + fragment_len <= self.config.limit;

        if can_add {
            *usage += fragment_len;
        }

        can_add
    }

    /// Debit one fragment rotated out of a full ring
    pub fn on_fragment_release(&self, fragment: &Fragment) {
        if !self.config.enabled || fragment.is_empty() {
            return;
        }

        let mut usage = self.usage.lock().unwrap();
        *usage -= fragment.len() as u64;
    }

    /// Debit a whole ring, called exactly once when its owner closes
    pub fn on_buffer_release(&self, buffer: &VecDeque<Arc<Fragment>>) {
        if !self.config.enabled || buffer.is_empty() {
            return;
        }

        let total: u64 = buffer.iter().map(|f| f.len() as u64).sum();

        let mut usage = self.usage.lock().unwrap();
        *usage -= total;
    }
}
