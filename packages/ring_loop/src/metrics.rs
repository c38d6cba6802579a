//! Metrics for event loops.
//!
//! Events are per-thread instances; the loop thread is the only one that observes them, so
//! there is no contention on the hot path. Collection and export are left to the application
//! (see the `nm` crate).

use nm::{Event, Magnitude};

/// Histogram buckets for the number of events consumed in one loop iteration.
const BATCH_SIZE_BUCKETS: &[Magnitude] = &[1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];

/// Histogram buckets for how late a timer fired compared to its deadline, in milliseconds.
///
/// On an idle loop this stays near zero; large values mean the loop is saturated by events
/// or by long-running tasks.
const TIMER_LATENESS_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 50, 100, 200, 500, 1000];

/// Histogram buckets for the execution time of one scheduled task invocation.
const TASK_EXECUTION_MS_BUCKETS: &[Magnitude] = &[0, 1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000];

thread_local! {
    /// Number of events consumed per non-empty loop iteration.
    pub(crate) static BATCH_SIZE: Event = Event::builder()
        .name("ring_loop_batch_size")
        .histogram(BATCH_SIZE_BUCKETS)
        .build();

    /// Counts every event consumed, including loop-internal tasks.
    pub(crate) static EVENTS_CONSUMED: Event = Event::builder()
        .name("ring_loop_events_consumed")
        .build();

    /// Delay between a timer's deadline and the moment it actually ran.
    pub(crate) static TIMER_LATENESS_MS: Event = Event::builder()
        .name("ring_loop_timer_lateness_ms")
        .histogram(TIMER_LATENESS_MS_BUCKETS)
        .build();

    /// Execution time of scheduled task invocations.
    pub(crate) static TASK_EXECUTION_MS: Event = Event::builder()
        .name("ring_loop_task_execution_ms")
        .histogram(TASK_EXECUTION_MS_BUCKETS)
        .build();
}
