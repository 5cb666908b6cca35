//! One-way latch that halts remote delivery once the target is unusable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Shared, never-resetting kill switch for remote operations.
///
/// Cloning yields another handle to the same latch.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    tripped: Arc<AtomicBool>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the breaker. Returns `true` only for the call that tripped it.
    pub fn trip(&self) -> bool {
        let first = !self.tripped.swap(true, Ordering::SeqCst);
        if first {
            warn!("Circuit breaker tripped, remote delivery halted");
        }
        first
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed() {
        assert!(!CircuitBreaker::new().is_tripped());
    }

    #[test]
    fn test_trip_is_one_way() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.trip());
        assert!(!breaker.trip());
        assert!(breaker.is_tripped());
    }

    #[test]
    fn test_clones_share_state() {
        let breaker = CircuitBreaker::new();
        let handle = breaker.clone();

        handle.trip();
        assert!(breaker.is_tripped());
    }
}
