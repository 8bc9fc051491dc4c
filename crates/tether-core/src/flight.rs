//! Single-flight guard
//!
//! At most one holder at a time; released when the guard drops, including on
//! early return or cancellation of the owning future.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub(crate) struct SingleFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SingleFlight<'a> {
    /// Take the flag, or `None` if another caller holds it
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SingleFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
