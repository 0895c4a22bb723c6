//! Thread-safe counter for WebSocket event `order` tags.
//!
//! Each WebSocket connection owns one counter.  The connect event takes
//! order 0, and every subsequent inbound frame or disconnect takes the next
//! value, so an application that consumes its conduit lazily can still
//! reconstruct the order in which events hit the socket.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter for per-connection event ordering.
///
/// Values start at 0 and increment by 1 with each call to [`next`].  The
/// counter wraps around at `u64::MAX` back to 0 without panicking.
///
/// # Examples
///
/// ```rust
/// use bridge_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
///
/// [`next`]: SequenceCounter::next
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next order value and atomically increments the counter.
    ///
    /// `Ordering::Relaxed` is sufficient: the values only order events, they
    /// never synchronise memory between tasks.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the current value without incrementing.  Logging only; the
    /// value may be stale by the time the caller reads it.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_counter_starts_at_zero() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_sequence_counter_wraps_at_u64_max() {
        let counter = SequenceCounter {
            inner: AtomicU64::new(u64::MAX),
        };

        assert_eq!(counter.next(), u64::MAX);
        assert_eq!(counter.next(), 0, "counter must wrap to 0 after u64::MAX");
    }

    #[test]
    fn test_sequence_counter_values_unique_across_threads() {
        let counter = Arc::new(SequenceCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..1000).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all_values: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        all_values.sort_unstable();
        all_values.dedup();
        assert_eq!(
            all_values.len(),
            8 * 1000,
            "every order value must be unique across threads"
        );
    }

    #[test]
    fn test_current_does_not_increment() {
        let counter = SequenceCounter::default();
        counter.next();

        assert_eq!(counter.current(), 1);
        assert_eq!(counter.next(), 1);
    }
}
