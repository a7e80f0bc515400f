//! Wall-clock budget and memory-padding probe polled by the refinement loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A countdown over wall-clock time. Without a limit it never expires.
pub struct CountdownTimer {
    start: Instant,
    limit: Option<Duration>,
}

impl CountdownTimer {
    pub fn new(limit: Option<Duration>) -> CountdownTimer {
        CountdownTimer {
            start: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.limit.is_some_and(|limit| self.start.elapsed() >= limit)
    }

    /// Whether more than `numerator/denominator` of the budget is used up.
    /// Always false without a limit.
    pub fn fraction_elapsed(&self, numerator: u32, denominator: u32) -> bool {
        self.limit
            .is_some_and(|limit| self.start.elapsed() * denominator >= limit * numerator)
    }
}

/// A block of memory reserved up front and released when the process runs
/// close to its limit; refinement stops once the padding is gone. Releasing
/// can happen from an allocation-failure path or from a watchdog; the loop
/// merely polls.
pub struct MemoryPadding {
    buffer: Mutex<Option<Vec<u8>>>,
    released: AtomicBool,
}

impl MemoryPadding {
    pub fn reserve(megabytes: usize) -> MemoryPadding {
        MemoryPadding {
            buffer: Mutex::new(Some(vec![0xAB; megabytes * 1024 * 1024])),
            released: AtomicBool::new(false),
        }
    }

    /// Frees the reserved block; every poll afterwards reads "gone".
    pub fn release(&self) {
        *self.buffer.lock().expect("padding lock never poisoned") = None;
        self.released.store(true, Ordering::Relaxed);
    }

    pub fn is_reserved(&self) -> bool {
        !self.released.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_timer_never_expires() {
        let timer = CountdownTimer::new(None);
        assert!(!timer.is_expired());
        assert!(!timer.fraction_elapsed(1, 2));
    }

    #[test]
    fn zero_limit_expires_immediately() {
        let timer = CountdownTimer::new(Some(Duration::ZERO));
        assert!(timer.is_expired());
    }

    #[test]
    fn padding_release_is_observed() {
        let padding = MemoryPadding::reserve(1);
        assert!(padding.is_reserved());
        padding.release();
        assert!(!padding.is_reserved());
    }
}
