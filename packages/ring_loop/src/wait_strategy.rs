//! Policies for what a thread does while it cannot make progress.
//!
//! There are two sides to this: the consumer (loop thread) idling while nothing is published,
//! and a producer backing off while the ring buffer is full. Both are closed sets of options
//! chosen at build time. There is no universally correct choice - every variant trades latency
//! against CPU consumption, and the right pick depends on how many cores the process can burn.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use event_listener::{Event, Listener};

/// How many busy-spin rounds [`WaitStrategy::Yielding`] performs before yielding the thread.
const SPIN_TRIES: u32 = 100;

/// How the loop thread idles while no event is published and no timer is due.
///
/// Every strategy wakes up for the next timer deadline and for shutdown requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum WaitStrategy {
    /// Re-checks in a tight loop.
    ///
    /// Lowest latency, burns a full core even when idle.
    BusySpin,

    /// Spins briefly, then yields the thread to the OS scheduler between checks.
    ///
    /// Low latency, high CPU use while idle, but other threads on the core can make progress.
    Yielding,

    /// Sleeps for the given period between checks.
    ///
    /// Latency is bounded by the sleep period; CPU use while idle is negligible.
    Sleeping(Duration),

    /// Parks the thread until a producer publishes, a timer is due or shutdown is requested.
    ///
    /// Lowest CPU use. Every publish pays for a notification, and wake-up latency is that of
    /// an OS thread wake-up.
    #[default]
    Blocking,
}

impl WaitStrategy {
    /// Whether producers must notify the loop thread after publishing.
    pub(crate) fn requires_notification(self) -> bool {
        matches!(self, Self::Blocking)
    }

    /// Idles once, returning when the caller should re-check its condition.
    ///
    /// `ready` is re-checked after registering for wake-up so that a notification raised
    /// between the caller's own check and the park is not lost.
    pub(crate) fn idle(
        self,
        round: &mut u32,
        wake: &Event,
        deadline: Option<Instant>,
        ready: impl Fn() -> bool,
    ) {
        *round = round.saturating_add(1);

        match self {
            Self::BusySpin => hint::spin_loop(),
            Self::Yielding => {
                if *round < SPIN_TRIES {
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
            Self::Sleeping(period) => {
                let period = deadline.map_or(period, |deadline| {
                    period.min(deadline.saturating_duration_since(Instant::now()))
                });

                thread::sleep(period);
            }
            Self::Blocking => {
                let listener = wake.listen();

                if ready() {
                    return;
                }

                match deadline {
                    Some(deadline) => {
                        // A timeout is just another reason to re-check.
                        _ = listener.wait_deadline(deadline);
                    }
                    None => listener.wait(),
                }
            }
        }
    }
}

/// What a producer does while the ring buffer has no free slot.
///
/// Only [`next_sequence()`][crate::LoopHandle::next_sequence] and the timed
/// [`try_next_sequence()`][crate::LoopHandle::try_next_sequence] wait; the consumer does not
/// signal freed capacity, so every strategy polls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BackpressureStrategy {
    /// Re-checks in a tight loop. Fastest hand-off, burns a core while the buffer is full.
    Spin,

    /// Yields the thread between checks.
    Yield,

    /// Parks the thread for the given period between checks.
    Park(Duration),
}

impl Default for BackpressureStrategy {
    fn default() -> Self {
        Self::Park(Duration::from_micros(100))
    }
}

impl BackpressureStrategy {
    pub(crate) fn back_off(self) {
        match self {
            Self::Spin => hint::spin_loop(),
            Self::Yield => thread::yield_now(),
            Self::Park(period) => thread::park_timeout(period),
        }
    }
}
