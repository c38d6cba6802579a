//! Fixed-capacity circular array of reusable slots, coordinated purely through [`Sequence`]s.
//!
//! The buffer never synchronizes anything itself. A slot may be written only by the producer
//! that claimed its sequence, between the claim and the publish, and read only by the consumer
//! once the publish is visible to it and until the consumer advances past it. The release store
//! in [`RingBuffer::publish()`] paired with the acquire load in
//! [`RingBuffer::highest_published()`] is the sole cross-thread synchronization point.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::thread::{self, ThreadId};

use crossbeam::utils::CachePadded;

use crate::{BackpressureStrategy, ConfigError, INITIAL_VALUE, Sequence};

/// Whether one or many threads claim sequences from a [`RingBuffer`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ProducerType {
    /// Exactly one thread ever claims. Claiming is a plain increment and publishing a single
    /// release store.
    ///
    /// The first thread that claims becomes the owner; a claim from any other thread panics.
    Single,

    /// Any number of threads claim concurrently. Claims are serialized through a CAS loop and
    /// each publish is tracked per slot, so producers may publish out of order.
    #[default]
    Multi,
}

/// A fixed-capacity circular array of slots of type `E`.
///
/// All slots are created up front by a factory and reused for the lifetime of the buffer.
/// The slot for sequence `s` lives at index `s & (capacity - 1)`.
///
/// Producer protocol:
///
/// 1. [`next()`](Self::next) or [`try_next()`](Self::try_next) claims a sequence.
/// 2. [`slot()`](Self::slot) gives access to the claimed slot for in-place writes.
/// 3. [`publish()`](Self::publish) makes the slot visible to the consumer.
///
/// Every claimed sequence must eventually be published, otherwise the consumer stalls at it.
///
/// Consumer protocol: read [`highest_published()`](Self::highest_published), process every slot
/// up to it, then [`mark_consumed()`](Self::mark_consumed). There is exactly one consumer.
pub struct RingBuffer<E> {
    slots: Box<[UnsafeCell<E>]>,

    index_mask: usize,

    /// log2(capacity), to turn a sequence into its lap number.
    index_shift: u32,

    producer_type: ProducerType,

    /// Highest sequence handed out to a producer.
    claimed: Sequence,

    /// Highest sequence published. Only maintained for single producers, whose publishes
    /// are strictly ordered.
    published: Sequence,

    /// For multiple producers: the lap number (`sequence >> index_shift`) of the most recent
    /// publish into each slot. Empty for single producers.
    available: Box<[AtomicI32]>,

    /// Highest sequence the consumer has finished with. Slots up to it may be reclaimed.
    consumed: Sequence,

    /// Producer-side cache of `consumed`, so producers do not touch the consumer's cache line
    /// on every claim.
    consumed_cache: CachePadded<AtomicI64>,

    single_owner: OnceLock<ThreadId>,
}

// SAFETY: Slots are only accessed according to the claim/publish/consume protocol documented
// on the type, which guarantees that at most one thread accesses a slot at any time and that
// hand-over between threads happens through release/acquire pairs. Slot contents move between
// threads, hence the `E: Send` requirement.
unsafe impl<E: Send> Sync for RingBuffer<E> {}

impl<E> RingBuffer<E> {
    /// Creates a buffer with `capacity` slots, each created by `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCapacity`] if `capacity` is below 2 or not a power of two.
    pub fn new(
        capacity: usize,
        producer_type: ProducerType,
        mut factory: impl FnMut() -> E,
    ) -> Result<Self, ConfigError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(ConfigError::InvalidCapacity { capacity });
        }

        if i32::try_from(capacity).is_err() {
            return Err(ConfigError::InvalidCapacity { capacity });
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(factory()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let available = match producer_type {
            ProducerType::Single => Box::default(),
            ProducerType::Multi => (0..capacity)
                .map(|_| AtomicI32::new(-1))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        };

        Ok(Self {
            slots,
            index_mask: capacity.wrapping_sub(1),
            index_shift: capacity.trailing_zeros(),
            producer_type,
            claimed: Sequence::new(),
            published: Sequence::new(),
            available,
            consumed: Sequence::new(),
            consumed_cache: CachePadded::new(AtomicI64::new(INITIAL_VALUE)),
            single_owner: OnceLock::new(),
        })
    }

    /// Number of slots.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The configured producer type.
    #[must_use]
    pub fn producer_type(&self) -> ProducerType {
        self.producer_type
    }

    #[expect(
        clippy::cast_possible_wrap,
        reason = "capacity is checked to fit in i32 at construction"
    )]
    fn capacity_i64(&self) -> i64 {
        self.slots.len() as i64
    }

    #[expect(
        clippy::cast_sign_loss,
        clippy::cast_possible_truncation,
        reason = "masking keeps only the low bits, which is exactly the slot index"
    )]
    #[inline]
    fn index_of(&self, sequence: i64) -> usize {
        (sequence as usize) & self.index_mask
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "the lap number only needs to differ between adjacent laps of one slot"
    )]
    #[inline]
    fn lap_of(&self, sequence: i64) -> i32 {
        (sequence >> self.index_shift) as i32
    }

    /// Tries to claim the next `n` sequences without waiting.
    ///
    /// Returns the highest claimed sequence (the claim covers `result - n + 1 ..= result`), or
    /// `None` if that many slots are not free.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero or exceeds the capacity, or if this is a single-producer buffer
    /// and the caller is not the thread that made the first claim.
    pub fn try_next_n(&self, n: usize) -> Option<i64> {
        assert!(
            n >= 1 && n <= self.capacity(),
            "claim size must be between 1 and the capacity"
        );

        #[expect(
            clippy::cast_possible_wrap,
            reason = "n is bounded by the capacity, which fits in i32"
        )]
        let n = n as i64;

        match self.producer_type {
            ProducerType::Single => self.try_claim_single(n),
            ProducerType::Multi => self.try_claim_multi(n),
        }
    }

    /// Tries to claim the next sequence without waiting.
    ///
    /// Returns `None` if the buffer is full.
    pub fn try_next(&self) -> Option<i64> {
        self.try_next_n(1)
    }

    /// Claims the next sequence, waiting according to `backpressure` while the buffer is full.
    ///
    /// This waits for as long as it takes. Callers that need to give up should loop over
    /// [`try_next()`](Self::try_next) themselves.
    pub fn next(&self, backpressure: BackpressureStrategy) -> i64 {
        loop {
            if let Some(sequence) = self.try_next() {
                return sequence;
            }

            backpressure.back_off();
        }
    }

    fn assert_single_owner(&self) {
        let current = thread::current().id();
        let owner = *self.single_owner.get_or_init(|| current);

        assert!(
            owner == current,
            "a single-producer ring buffer was claimed from a second thread"
        );
    }

    fn has_capacity_for(&self, highest: i64) -> bool {
        let wrap_point = highest.wrapping_sub(self.capacity_i64());

        // The cache is shared between producers. Trusting a value another producer stored must
        // also order our slot writes after the consumer's reads, so the cache forwards the
        // acquire on `consumed` with a release store and an acquire load of its own.
        if wrap_point <= self.consumed_cache.load(Ordering::Acquire) {
            return true;
        }

        let consumed = self.consumed.get();
        self.consumed_cache.store(consumed, Ordering::Release);

        wrap_point <= consumed
    }

    fn try_claim_single(&self, n: i64) -> Option<i64> {
        self.assert_single_owner();

        let highest = self.claimed.get_relaxed().wrapping_add(n);

        if !self.has_capacity_for(highest) {
            return None;
        }

        // Sequentially consistent so that a claim racing with shutdown is ordered against the
        // producer's subsequent read of the loop state.
        self.claimed.set_volatile(highest);
        Some(highest)
    }

    fn try_claim_multi(&self, n: i64) -> Option<i64> {
        loop {
            let current = self.claimed.get();
            let highest = current.wrapping_add(n);

            if !self.has_capacity_for(highest) {
                return None;
            }

            if self.claimed.compare_and_set(current, highest) {
                return Some(highest);
            }
        }
    }

    /// Returns a pointer to the slot for `sequence`.
    ///
    /// Obtaining the pointer is safe; dereferencing it is only valid for the producer that
    /// claimed `sequence` (until it publishes) or for the consumer (after the publish is
    /// visible and before it marks the sequence consumed).
    #[must_use]
    #[inline]
    pub fn slot(&self, sequence: i64) -> *mut E {
        let index = self.index_of(sequence);

        // SAFETY: The index is masked to the slot count, which is the slice length.
        unsafe { self.slots.get_unchecked(index) }.get()
    }

    /// Makes the slot for `sequence` visible to the consumer.
    ///
    /// # Safety
    ///
    /// The caller must have claimed `sequence` from this buffer, must not have published it yet
    /// and must not access the slot afterwards. Once published, the consumer may read the slot
    /// and hand it to a later claim.
    pub unsafe fn publish(&self, sequence: i64) {
        match self.producer_type {
            ProducerType::Single => self.published.set(sequence),
            ProducerType::Multi => self.mark_available(sequence),
        }
    }

    /// Makes the slots for `low..=high` visible to the consumer.
    ///
    /// # Safety
    ///
    /// As for [`publish()`](Self::publish), for every sequence in the range.
    pub unsafe fn publish_range(&self, low: i64, high: i64) {
        match self.producer_type {
            ProducerType::Single => self.published.set(high),
            ProducerType::Multi => {
                let mut sequence = low;
                while sequence <= high {
                    self.mark_available(sequence);
                    sequence = sequence.wrapping_add(1);
                }
            }
        }
    }

    fn mark_available(&self, sequence: i64) {
        let index = self.index_of(sequence);

        // SAFETY: For multi-producer buffers `available` has one entry per slot.
        let flag = unsafe { self.available.get_unchecked(index) };

        // Release pairs with the acquire in `is_available`, carrying the slot writes with it.
        flag.store(self.lap_of(sequence), Ordering::Release);
    }

    fn is_available(&self, sequence: i64) -> bool {
        let index = self.index_of(sequence);

        // SAFETY: For multi-producer buffers `available` has one entry per slot.
        let flag = unsafe { self.available.get_unchecked(index) };

        flag.load(Ordering::Acquire) == self.lap_of(sequence)
    }

    /// Highest sequence claimed by any producer. Published data may lag behind it.
    #[must_use]
    pub fn cursor(&self) -> i64 {
        match self.producer_type {
            ProducerType::Single => self.published.get(),
            ProducerType::Multi => self.claimed.get(),
        }
    }

    /// Highest claimed sequence, published or not.
    ///
    /// Sequentially consistent: a claim that is not visible here was made after this read in
    /// the global order of sequentially consistent operations.
    #[must_use]
    pub fn claimed(&self) -> i64 {
        self.claimed.get_volatile()
    }

    /// Returns the highest sequence in `low..=high` such that every sequence from `low` up to it
    /// is published, or `low - 1` if `low` itself is not published yet.
    ///
    /// `high` is normally [`cursor()`](Self::cursor).
    #[must_use]
    pub fn highest_published(&self, low: i64, high: i64) -> i64 {
        match self.producer_type {
            ProducerType::Single => high.min(self.published.get()),
            ProducerType::Multi => {
                let mut sequence = low;
                while sequence <= high {
                    if !self.is_available(sequence) {
                        return sequence.wrapping_sub(1);
                    }
                    sequence = sequence.wrapping_add(1);
                }
                high
            }
        }
    }

    /// Highest sequence the consumer has finished with.
    #[must_use]
    pub fn consumed(&self) -> i64 {
        self.consumed.get()
    }

    /// Records that the consumer is done with every slot up to and including `sequence`.
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer, for sequences that are published, and the
    /// consumer must not access those slots afterwards. Producers may claim and overwrite them
    /// as soon as this returns.
    pub unsafe fn mark_consumed(&self, sequence: i64) {
        debug_assert!(sequence >= self.consumed.get_relaxed());

        self.consumed.set(sequence);
    }

    /// Number of slots that can be claimed right now without waiting.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        let in_flight = self.claimed.get().wrapping_sub(self.consumed.get());

        usize::try_from(self.capacity_i64().wrapping_sub(in_flight)).unwrap_or(0)
    }
}

impl<E> fmt::Debug for RingBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("producer_type", &self.producer_type)
            .field("claimed", &self.claimed)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(RingBuffer<u64>: Send, Sync);
    assert_not_impl_any!(RingBuffer<std::rc::Rc<u64>>: Sync);

    fn counting_buffer(capacity: usize, producer_type: ProducerType) -> RingBuffer<u64> {
        RingBuffer::new(capacity, producer_type, || 0).unwrap()
    }

    #[test]
    fn rejects_invalid_capacity() {
        assert!(matches!(
            RingBuffer::new(3, ProducerType::Multi, || 0_u8),
            Err(ConfigError::InvalidCapacity { capacity: 3 })
        ));
        assert!(matches!(
            RingBuffer::new(1, ProducerType::Single, || 0_u8),
            Err(ConfigError::InvalidCapacity { capacity: 1 })
        ));
        assert!(RingBuffer::new(2, ProducerType::Single, || 0_u8).is_ok());
    }

    #[test]
    fn slots_wrap_by_mask() {
        let buffer = counting_buffer(4, ProducerType::Multi);

        assert_eq!(buffer.slot(0), buffer.slot(4));
        assert_eq!(buffer.slot(3), buffer.slot(7));
        assert_ne!(buffer.slot(0), buffer.slot(1));
    }

    #[test]
    fn factory_fills_every_slot() {
        let mut next = 0_u64;
        let buffer = RingBuffer::new(8, ProducerType::Single, || {
            next += 1;
            next
        })
        .unwrap();

        let mut seen = (0..8)
            // SAFETY: Nothing else touches the buffer.
            .map(|sequence| unsafe { *buffer.slot(sequence) })
            .collect::<Vec<_>>();
        seen.sort_unstable();

        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn single_producer_claims_until_full() {
        let buffer = counting_buffer(4, ProducerType::Single);

        assert_eq!(buffer.try_next(), Some(0));
        assert_eq!(buffer.try_next(), Some(1));
        assert_eq!(buffer.try_next_n(2), Some(3));
        assert_eq!(buffer.try_next(), None);
        assert_eq!(buffer.remaining_capacity(), 0);

        // SAFETY: Sequences 0..=3 were claimed above; nothing reads the slots.
        unsafe {
            buffer.publish(3);
        }
        // SAFETY: This test is the only consumer.
        unsafe {
            buffer.mark_consumed(1);
        }

        assert_eq!(buffer.remaining_capacity(), 2);
        assert_eq!(buffer.try_next(), Some(4));
    }

    #[test]
    fn single_producer_publish_is_ordered() {
        let buffer = counting_buffer(8, ProducerType::Single);

        let sequence = buffer.try_next_n(3).unwrap();
        assert_eq!(buffer.highest_published(0, buffer.cursor()), -1);

        // SAFETY: The range was claimed above and is not touched afterwards.
        unsafe {
            buffer.publish_range(0, sequence);
        }
        assert_eq!(buffer.cursor(), 2);
        assert_eq!(buffer.highest_published(0, buffer.cursor()), 2);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    #[should_panic]
    fn single_producer_rejects_second_thread() {
        let buffer = Arc::new(counting_buffer(4, ProducerType::Single));
        buffer.try_next();

        let other = Arc::clone(&buffer);
        let result = std::thread::spawn(move || other.try_next()).join();

        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    fn multi_producer_out_of_order_publish_stops_at_gap() {
        let buffer = counting_buffer(8, ProducerType::Multi);

        let first = buffer.try_next().unwrap();
        let second = buffer.try_next().unwrap();
        let third = buffer.try_next().unwrap();

        // SAFETY: Each sequence was claimed above and is published once.
        unsafe {
            buffer.publish(third);
        }
        // SAFETY: As above.
        unsafe {
            buffer.publish(first);
        }

        // Sequence 1 is claimed but unpublished, so only 0 may be consumed.
        assert_eq!(buffer.highest_published(0, buffer.cursor()), 0);

        // SAFETY: As above.
        unsafe {
            buffer.publish(second);
        }
        assert_eq!(buffer.highest_published(0, buffer.cursor()), 2);
    }

    #[test]
    fn multi_producer_availability_distinguishes_laps() {
        let buffer = counting_buffer(2, ProducerType::Multi);

        for sequence in 0..2 {
            assert_eq!(buffer.try_next(), Some(sequence));
            // SAFETY: Claimed on the line above.
            unsafe {
                buffer.publish(sequence);
            }
        }
        // SAFETY: Both sequences are published and nobody reads them.
        unsafe {
            buffer.mark_consumed(1);
        }

        // Sequence 2 reuses slot 0, which still carries the lap-0 flag.
        assert_eq!(buffer.try_next(), Some(2));
        assert_eq!(buffer.highest_published(2, buffer.cursor()), 1);

        // SAFETY: Claimed above.
        unsafe {
            buffer.publish(2);
        }
        assert_eq!(buffer.highest_published(2, buffer.cursor()), 2);
    }

    #[test]
    fn next_waits_for_consumer() {
        let buffer = counting_buffer(2, ProducerType::Multi);

        assert_eq!(buffer.next(BackpressureStrategy::Spin), 0);
        assert_eq!(buffer.next(BackpressureStrategy::Spin), 1);
        // SAFETY: Both sequences were claimed above; nobody reads them.
        unsafe {
            buffer.publish_range(0, 1);
        }
        // SAFETY: This test is the only consumer.
        unsafe {
            buffer.mark_consumed(0);
        }

        assert_eq!(buffer.next(BackpressureStrategy::Yield), 2);
    }

    // Small enough for Miri, which checks that slot writes never race the consumer's reads
    // when one producer trusts a consumer position cached by another.
    #[test]
    fn producers_reuse_slots_only_after_consumer_is_done() {
        const PER_PRODUCER: u64 = 20;
        const TOTAL: i64 = 40;

        let buffer = counting_buffer(2, ProducerType::Multi);

        std::thread::scope(|scope| {
            for producer in 0..2_u64 {
                let buffer = &buffer;
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let sequence = buffer.next(BackpressureStrategy::Yield);
                        // SAFETY: We claimed this sequence and have not published it yet.
                        unsafe {
                            *buffer.slot(sequence) = producer * PER_PRODUCER + i;
                        }
                        // SAFETY: Our own claim, not touched after this.
                        unsafe {
                            buffer.publish(sequence);
                        }
                    }
                });
            }

            let mut total = 0_u64;
            let mut next = 0_i64;
            while next < TOTAL {
                let available = buffer.highest_published(next, buffer.cursor());
                while next <= available {
                    // SAFETY: Published and not yet marked consumed.
                    total += unsafe { *buffer.slot(next) };
                    next += 1;
                }
                // SAFETY: This thread is the only consumer and is done with the slots.
                unsafe {
                    buffer.mark_consumed(next - 1);
                }
                std::thread::yield_now();
            }

            assert_eq!(total, (0..2 * PER_PRODUCER).sum::<u64>());
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn concurrent_producers_never_share_a_sequence() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 2000;

        let buffer = Arc::new(counting_buffer(64, ProducerType::Multi));
        let sum = Arc::new(AtomicU64::new(0));

        let producers = (0..PRODUCERS)
            .map(|producer| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let sequence = buffer.next(BackpressureStrategy::Yield);
                        // SAFETY: We claimed this sequence and have not published it yet.
                        unsafe {
                            *buffer.slot(sequence) = producer * PER_PRODUCER + i;
                        }
                        // SAFETY: Our own claim, not touched after this.
                        unsafe {
                            buffer.publish(sequence);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let consumer = {
            let buffer = Arc::clone(&buffer);
            let sum = Arc::clone(&sum);
            std::thread::spawn(move || {
                let mut seen = HashSet::new();
                let mut next = 0_i64;
                let total = i64::try_from(PRODUCERS * PER_PRODUCER).unwrap();

                while next < total {
                    let available = buffer.highest_published(next, buffer.cursor());
                    while next <= available {
                        // SAFETY: The sequence is published and not yet marked consumed.
                        let value = unsafe { *buffer.slot(next) };
                        assert!(seen.insert(value), "value {value} was delivered twice");
                        sum.fetch_add(value, Ordering::Relaxed);
                        next += 1;
                    }
                    // SAFETY: This thread is the only consumer and is done with the slots.
                    unsafe {
                        buffer.mark_consumed(next - 1);
                    }
                    std::thread::yield_now();
                }

                seen.len()
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        let delivered = consumer.join().unwrap();

        let total = PRODUCERS * PER_PRODUCER;
        assert_eq!(delivered, usize::try_from(total).unwrap());
        assert_eq!(sum.load(Ordering::Relaxed), total * (total - 1) / 2);
    }
}
