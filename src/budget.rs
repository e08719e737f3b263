//! Memory Budget
//!
//! Cooperative heap accounting for the sorter's write path. Allocation-heavy
//! code charges the budget as buffers grow and releases on flush; the sorter
//! consults [`MemoryBudget::nearly_full`] to decide whether a small run is
//! worth spilling early.
//!
//! An optional alarm callback fires when usage crosses the limit. The alarm
//! runs with the internal lock released so it may itself charge or release.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Over-limit notification callback
pub type AlarmFn = Box<dyn Fn(usize) + Send + Sync>;

/// Byte-counting budget with an optional soft limit
pub struct MemoryBudget {
    used: AtomicUsize,
    limit: Option<usize>,
    alarm: Mutex<Option<AlarmFn>>,
}

impl MemoryBudget {
    /// Create a budget. `limit = None` disables pressure reporting.
    pub fn new(limit: Option<usize>) -> Self {
        MemoryBudget {
            used: AtomicUsize::new(0),
            limit,
            alarm: Mutex::new(None),
        }
    }

    /// Install the over-limit alarm, replacing any previous one
    pub fn set_alarm(&self, alarm: AlarmFn) {
        *self.alarm.lock() = Some(alarm);
    }

    /// Record `bytes` of new allocation
    pub fn charge(&self, bytes: usize) {
        let now = self.used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Some(limit) = self.limit {
            if now > limit {
                // Take the callback out, drop the lock, then invoke it, so a
                // re-entrant charge() from inside the alarm cannot deadlock.
                let cb = self.alarm.lock().take();
                if let Some(cb) = cb {
                    cb(now);
                    *self.alarm.lock() = Some(cb);
                }
            }
        }
    }

    /// Record `bytes` freed
    pub fn release(&self, bytes: usize) {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(bytes);
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Current accounted usage in bytes
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// True when usage is within a quarter of the limit
    pub fn nearly_full(&self) -> bool {
        match self.limit {
            Some(limit) => self.used() >= limit - limit / 4,
            None => false,
        }
    }
}

impl std::fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("used", &self.used())
            .field("limit", &self.limit)
            .finish()
    }
}
