//! Single-flight flags.
//!
//! A [`SingleFlight`] admits one holder at a time. Acquisition never waits:
//! a second caller gets `None` and is expected to treat its call as a
//! no-op. The guard releases the flag on drop, including on early return,
//! error, and future cancellation.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct SingleFlight {
    held: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the flag, or returns `None` if someone holds it.
    pub fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flag: &self.held })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases its [`SingleFlight`] when dropped.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
