use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::ChunkIterationLimitError;

/// Dispatch counter with a hard ceiling.
///
/// Every chat or stream call reserves one slot before it is issued. Once
/// `max` slots are taken, [`reserve`](Self::reserve) fails without
/// incrementing, so the excess call is never made. The count only goes
/// back to zero through [`reset`](Self::reset).
#[derive(Debug)]
pub struct IterationCounter {
    count: AtomicU32,
    max: u32,
}

impl IterationCounter {
    /// A counter allowing `max` dispatches.
    pub fn new(max: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            max,
        }
    }

    /// The configured ceiling.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Dispatches reserved so far.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Takes one slot, returning the new count.
    pub fn reserve(&self) -> Result<u32, ChunkIterationLimitError> {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max).then_some(n + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| ChunkIterationLimitError {
                max_iterations: self.max,
            })
    }

    /// Sets the count back to zero.
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_reserve_up_to_max() {
        let counter = IterationCounter::new(3);
        assert_eq!(counter.reserve().unwrap(), 1);
        assert_eq!(counter.reserve().unwrap(), 2);
        assert_eq!(counter.reserve().unwrap(), 3);
        let err = counter.reserve().unwrap_err();
        assert_eq!(err.max_iterations, 3);
        assert_eq!(counter.count(), 3);
    }

    #[test]
    fn test_reset_reopens() {
        let counter = IterationCounter::new(1);
        counter.reserve().unwrap();
        assert!(counter.reserve().is_err());
        counter.reset();
        assert_eq!(counter.count(), 0);
        assert!(counter.reserve().is_ok());
    }

    #[test]
    fn test_zero_ceiling_rejects_everything() {
        assert!(IterationCounter::new(0).reserve().is_err());
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_max() {
        let counter = Arc::new(IterationCounter::new(50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || (0..20).filter(|_| counter.reserve().is_ok()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
        assert_eq!(counter.count(), 50);
    }
}
