//! Cache-line padded monotonic counters that coordinate producers and the consumer.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam::utils::CachePadded;

/// The value every [`Sequence`] starts with: "nothing claimed, published or consumed yet".
pub const INITIAL_VALUE: i64 = -1;

/// A 64-bit monotonic counter marking the last claimed, published or consumed slot
/// of a [`RingBuffer`][crate::RingBuffer].
///
/// The counter lives in its own cache line. [`CachePadded`] aligns the atomic to the start of
/// a cache line (128 bytes on x86-64 to also cover the adjacent-line prefetcher) and pads the
/// remainder, so no neighboring field shares a line with it on either side. Without this, a
/// producer bumping the claim cursor and the consumer bumping its own sequence would keep
/// invalidating each other's caches.
///
/// # Example
///
/// ```rust
/// use ring_loop::Sequence;
///
/// let sequence = Sequence::new();
/// assert_eq!(sequence.get(), -1);
///
/// sequence.set(41);
/// assert_eq!(sequence.increment_and_get(), 42);
/// ```
pub struct Sequence {
    value: CachePadded<AtomicI64>,
}

impl Sequence {
    /// Creates a sequence holding [`INITIAL_VALUE`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_value(INITIAL_VALUE)
    }

    /// Creates a sequence holding `value`.
    #[must_use]
    pub fn with_value(value: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(value)),
        }
    }

    /// Reads the current value.
    ///
    /// Acquire ordering pairs with [`set()`](Self::set), so everything written before the
    /// matching release store is visible after this read.
    #[must_use]
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Sequentially consistent read, the counterpart of [`set_volatile()`](Self::set_volatile).
    #[must_use]
    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Reads the current value without ordering guarantees.
    ///
    /// Only meaningful for the thread that owns the counter.
    #[must_use]
    #[inline]
    pub(crate) fn get_relaxed(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Ordered (release) write.
    ///
    /// This is the store that publishes a slot: writes made to the slot before this call
    /// become visible to any thread that subsequently observes `value` through [`get()`](Self::get).
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Sequentially consistent write.
    ///
    /// Costlier than [`set()`](Self::set); use when the write must also be ordered against
    /// later loads of *other* locations (store-load fence).
    #[inline]
    pub fn set_volatile(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Sets the value to `new` if it currently equals `expected`.
    ///
    /// Returns `true` if the exchange happened.
    #[inline]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
    }

    /// Atomically adds `delta` and returns the new value.
    #[inline]
    pub fn add_and_get(&self, delta: i64) -> i64 {
        self.value
            .fetch_add(delta, Ordering::SeqCst)
            .wrapping_add(delta)
    }

    /// Atomically adds one and returns the new value.
    #[inline]
    pub fn increment_and_get(&self) -> i64 {
        self.add_and_get(1)
    }

    /// Atomically subtracts one and returns the new value.
    #[inline]
    pub fn decrement_and_get(&self) -> i64 {
        self.add_and_get(-1)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sequence").field(&self.get()).finish()
    }
}

/// Returns the smallest value among `sequences`, or `default` if the slice is empty.
#[must_use]
pub fn minimum_sequence(sequences: &[&Sequence], default: i64) -> i64 {
    sequences
        .iter()
        .map(|sequence| sequence.get())
        .min()
        .unwrap_or(default)
}
