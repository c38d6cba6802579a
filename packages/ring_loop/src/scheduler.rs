//! Delayed, periodic and time-sharing tasks executed on an event loop thread.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::metrics::TASK_EXECUTION_MS;
use crate::timer::{TimerQueue, TimerTask};
use crate::{
    FutureError, JoinError, LoopHandle, Promise, PromiseState, TimeoutBound, panic_message,
};

/// When a scheduled task runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Trigger {
    /// Once, after `initial_delay`.
    ///
    /// A time-sharing task that asks to continue is invoked again as soon as possible.
    Once {
        /// Delay before the first invocation.
        initial_delay: Duration,
    },

    /// After `initial_delay`, then repeatedly with `delay` between the end of one invocation
    /// and the start of the next.
    FixedDelay {
        /// Delay before the first invocation.
        initial_delay: Duration,

        /// Delay between invocations.
        delay: Duration,
    },
}

impl Trigger {
    fn initial_delay(self) -> Duration {
        match self {
            Self::Once { initial_delay } | Self::FixedDelay { initial_delay, .. } => initial_delay,
        }
    }
}

/// Limits how long a time-sharing task may keep asking to continue.
///
/// Only [`LoopHandle::schedule_time_sharing()`] tasks are subject to timeouts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TimeoutPolicy {
    /// The task may continue indefinitely.
    #[default]
    Never,

    /// The task fails after this many invocations without a terminal result.
    ///
    /// Zero behaves like one: the first non-terminal invocation already fails the task.
    Count(u32),

    /// The task fails once this much time has passed since its first invocation without a
    /// terminal result. Checked after every invocation.
    Duration(Duration),
}

/// Trigger and timeout policy of a scheduled task.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use ring_loop::{ScheduleOptions, TimeoutPolicy};
///
/// let options = ScheduleOptions::fixed_delay(Duration::ZERO, Duration::from_millis(50))
///     .timeout_by_duration(Duration::from_secs(5));
///
/// assert_eq!(
///     options.timeout(),
///     TimeoutPolicy::Duration(Duration::from_secs(5))
/// );
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScheduleOptions {
    trigger: Trigger,
    timeout: TimeoutPolicy,
}

impl ScheduleOptions {
    /// Runs once after `initial_delay`.
    #[must_use]
    pub fn only_once(initial_delay: Duration) -> Self {
        Self {
            trigger: Trigger::Once { initial_delay },
            timeout: TimeoutPolicy::Never,
        }
    }

    /// Runs after `initial_delay`, then with `delay` between invocations.
    #[must_use]
    pub fn fixed_delay(initial_delay: Duration, delay: Duration) -> Self {
        Self {
            trigger: Trigger::FixedDelay {
                initial_delay,
                delay,
            },
            timeout: TimeoutPolicy::Never,
        }
    }

    /// Fails a time-sharing task after `count` invocations without a terminal result.
    #[must_use]
    pub fn timeout_by_count(mut self, count: u32) -> Self {
        self.timeout = TimeoutPolicy::Count(count);
        self
    }

    /// Fails a time-sharing task once `duration` passed since its first invocation without a
    /// terminal result.
    #[must_use]
    pub fn timeout_by_duration(mut self, duration: Duration) -> Self {
        self.timeout = TimeoutPolicy::Duration(duration);
        self
    }

    /// The trigger.
    #[must_use]
    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// The timeout policy.
    #[must_use]
    pub fn timeout(&self) -> TimeoutPolicy {
        self.timeout
    }
}

/// What one invocation of a time-sharing task produced.
#[derive(Debug)]
#[non_exhaustive]
pub enum Step<T> {
    /// Not done yet; invoke again per the trigger.
    Continue,

    /// Done, completing the task's future with the value.
    Success(T),

    /// Done, failing the task's future with the cause.
    Failure(FutureError),
}

/// Invocation bookkeeping handed to a time-sharing task.
#[derive(Debug, Default)]
pub struct TimeSharingContext {
    invocations: u32,
    first_invocation: Option<Instant>,
}

impl TimeSharingContext {
    /// Number of invocations so far, counting the current one.
    #[must_use]
    pub fn invocations(&self) -> u32 {
        self.invocations
    }

    /// Whether this is the first invocation.
    #[must_use]
    pub fn is_first_invocation(&self) -> bool {
        self.invocations == 1
    }

    /// Time since the start of the first invocation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.first_invocation
            .map_or(Duration::ZERO, |first| first.elapsed())
    }

    fn begin_invocation(&mut self, now: Instant) {
        self.invocations = self.invocations.saturating_add(1);
        self.first_invocation.get_or_insert(now);
    }
}

/// Lifecycle state of a scheduled task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TaskState {
    /// Not invoked yet.
    Pending,

    /// Invoked at least once, no terminal result yet.
    Running,

    /// Completed with a value.
    Success,

    /// Completed with a cause other than cancellation.
    Failed,

    /// Cancelled.
    Cancelled,
}

#[derive(Debug, Default)]
struct TaskControl {
    cancel_requested: AtomicBool,
    started: AtomicBool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TaskKind {
    Runnable,
    Callable,
    TimeSharing,
}

type StepFn<T> = Box<dyn FnMut(&TimeSharingContext) -> Step<T> + Send>;

/// A scheduled task as the timer queue sees it.
struct ScheduledTask<T>
where
    T: Send + Sync + 'static,
{
    kind: TaskKind,
    options: ScheduleOptions,
    step: StepFn<T>,
    context: TimeSharingContext,
    promise: Promise<T>,
    control: Arc<TaskControl>,
    loop_name: Arc<str>,
}

impl<T> ScheduledTask<T>
where
    T: Send + Sync + 'static,
{
    fn timed_out(&self) -> Option<TimeoutBound> {
        if self.kind != TaskKind::TimeSharing {
            return None;
        }

        match self.options.timeout {
            TimeoutPolicy::Never => None,
            TimeoutPolicy::Count(count) => {
                (self.context.invocations >= count.max(1)).then_some(TimeoutBound::Count(count))
            }
            TimeoutPolicy::Duration(duration) => {
                (self.context.elapsed() >= duration).then_some(TimeoutBound::Duration(duration))
            }
        }
    }
}

impl<T> TimerTask for ScheduledTask<T>
where
    T: Send + Sync + 'static,
{
    fn run(&mut self) -> Option<Instant> {
        if self.promise.is_done() {
            return None;
        }

        if self.control.cancel_requested.load(Ordering::Acquire) {
            self.promise.complete_exceptionally(FutureError::Cancelled);
            return None;
        }

        self.control.started.store(true, Ordering::Release);
        self.context.begin_invocation(Instant::now());

        let step = &mut self.step;
        let context = &self.context;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            TASK_EXECUTION_MS.with(|event| event.observe_duration_millis(|| step(context)))
        }));

        match outcome {
            Ok(Step::Success(value)) => {
                self.promise.complete(value);
                None
            }
            Ok(Step::Failure(cause)) => {
                self.promise.complete_exceptionally(cause);
                None
            }
            Ok(Step::Continue) => {
                if self.promise.is_done() {
                    return None;
                }

                if let Some(bound) = self.timed_out() {
                    self.promise
                        .complete_exceptionally(FutureError::TimeSharingTimeout { bound });
                    return None;
                }

                let now = Instant::now();
                Some(match self.options.trigger {
                    Trigger::Once { .. } => now,
                    Trigger::FixedDelay { delay, .. } => deadline_after(now, delay),
                })
            }
            Err(payload) => {
                warn!(
                    loop_name = %self.loop_name,
                    panic = %panic_message(payload.as_ref()),
                    "scheduled task panicked"
                );
                self.promise
                    .complete_exceptionally(FutureError::from_panic(payload.as_ref()));
                None
            }
        }
    }

    fn abort(&mut self, cause: FutureError) {
        self.promise.complete_exceptionally(cause);
    }
}

impl<T> Drop for ScheduledTask<T>
where
    T: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Dropped without ever being finalized: the registration never reached the loop.
        self.promise.complete_exceptionally(FutureError::Rejected);
    }
}

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(Duration::from_secs(u64::from(u32::MAX))))
        .unwrap_or(now)
}

/// Handle to the result of a scheduled task.
///
/// The task's [`Promise`] is completed on the loop thread. Use [`promise()`](Self::promise) to
/// attach continuations, or wait with [`join()`](Self::join) from any thread except the loop
/// thread. The handle can also be `.await`ed.
pub struct ScheduledFuture<T> {
    promise: Promise<T>,
    control: Arc<TaskControl>,
}

impl<T> ScheduledFuture<T>
where
    T: Send + Sync + 'static,
{
    /// The promise completed with the task's result.
    #[must_use]
    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    /// Requests cancellation.
    ///
    /// The request is a fence observed on the loop thread the next time the task is due: from
    /// then on the task is never invoked again and its future fails with
    /// [`FutureError::Cancelled`]. An invocation already in progress finishes normally.
    ///
    /// Returns `false` if the task already completed or cancellation was already requested.
    pub fn cancel(&self) -> bool {
        if self.promise.is_done() {
            return false;
        }

        !self.control.cancel_requested.swap(true, Ordering::AcqRel)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        match self.promise.state() {
            PromiseState::Success => TaskState::Success,
            PromiseState::Failed => TaskState::Failed,
            PromiseState::Cancelled => TaskState::Cancelled,
            _ if self.control.started.load(Ordering::Acquire) => TaskState::Running,
            _ => TaskState::Pending,
        }
    }

    /// Whether the task reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.promise.is_done()
    }

    /// Whether the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.promise.is_cancelled()
    }

    /// The failure cause, if the task failed or was cancelled.
    #[must_use]
    pub fn cause(&self) -> Option<FutureError> {
        self.promise.cause()
    }

    /// Blocks until the task completes.
    ///
    /// # Errors
    ///
    /// Returns the failure cause if the task did not complete with a value.
    ///
    /// # Panics
    ///
    /// In debug builds, panics when called on the loop thread, where it would deadlock.
    pub fn join(&self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        self.promise.join()
    }

    /// Blocks until the task completes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::TimedOut`] if the task is still pending after `timeout`, otherwise
    /// the failure cause if it did not complete with a value.
    pub fn join_timeout(&self, timeout: Duration) -> Result<T, JoinError>
    where
        T: Clone,
    {
        self.promise.join_timeout(timeout)
    }

    /// Blocks until the task completes or `timeout` elapses, returning whether it completed.
    pub fn await_uninterruptibly(&self, timeout: Duration) -> bool {
        self.promise.await_uninterruptibly(timeout)
    }
}

impl<T> Future for ScheduledFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, FutureError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.promise).poll(cx)
    }
}

impl<T> fmt::Debug for ScheduledFuture<T>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledFuture")
            .field("state", &self.state())
            .field(
                "cancel_requested",
                &self.control.cancel_requested.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Scheduling of tasks on the loop thread.
///
/// Every task runs on the loop thread, interleaved with event processing. A task registered
/// for the same deadline as another runs after it. After shutdown began, scheduling returns a
/// future that already failed with [`FutureError::Rejected`]; tasks still pending when the
/// loop terminates fail with [`FutureError::Cancelled`].
///
/// Panics in task bodies are caught and fail the task's future with
/// [`FutureError::Panicked`].
impl LoopHandle {
    /// Schedules `task` per `options`.
    ///
    /// With [`Trigger::Once`] the task runs once and the future completes afterwards. With
    /// [`Trigger::FixedDelay`] it repeats until cancelled or until it panics. Timeout policies
    /// do not apply.
    pub fn schedule_runnable<F>(
        &self,
        options: ScheduleOptions,
        mut task: F,
    ) -> ScheduledFuture<()>
    where
        F: FnMut() + Send + 'static,
    {
        let repeat = matches!(options.trigger, Trigger::FixedDelay { .. });

        self.schedule_step(
            TaskKind::Runnable,
            options,
            Box::new(move |_: &TimeSharingContext| {
                task();

                if repeat { Step::Continue } else { Step::Success(()) }
            }),
        )
    }

    /// Schedules `task` to produce a value, which completes the future.
    ///
    /// The task is invoked once, on the first trigger. Timeout policies do not apply.
    pub fn schedule_callable<T, F>(
        &self,
        options: ScheduleOptions,
        mut task: F,
    ) -> ScheduledFuture<T>
    where
        T: Send + Sync + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        self.schedule_step(
            TaskKind::Callable,
            options,
            Box::new(move |_: &TimeSharingContext| Step::Success(task())),
        )
    }

    /// Schedules a time-sharing task: a computation split into slices, each invocation doing a
    /// bounded amount of work and returning [`Step::Continue`] until it has a result.
    ///
    /// Continuing tasks are invoked again per the trigger, subject to the timeout policy.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::time::Duration;
    ///
    /// use ring_loop::{EventLoop, IdleAgent, ScheduleOptions, Step};
    ///
    /// let event_loop = EventLoop::builder().build(IdleAgent).unwrap();
    ///
    /// let mut total = 0_u64;
    /// let sum = event_loop.schedule_time_sharing(
    ///     ScheduleOptions::only_once(Duration::ZERO).timeout_by_count(100),
    ///     move |context| {
    ///         total += u64::from(context.invocations());
    ///
    ///         if context.invocations() == 10 {
    ///             Step::Success(total)
    ///         } else {
    ///             Step::Continue
    ///         }
    ///     },
    /// );
    ///
    /// assert_eq!(sum.join().unwrap(), 55);
    /// ```
    pub fn schedule_time_sharing<T, F>(
        &self,
        options: ScheduleOptions,
        task: F,
    ) -> ScheduledFuture<T>
    where
        T: Send + Sync + 'static,
        F: FnMut(&TimeSharingContext) -> Step<T> + Send + 'static,
    {
        self.schedule_step(TaskKind::TimeSharing, options, Box::new(task))
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledFuture<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Some(task);

        self.schedule_runnable(ScheduleOptions::only_once(delay), move || {
            if let Some(task) = task.take() {
                task();
            }
        })
    }

    /// Runs `task` after `initial_delay`, then with `delay` between invocations, until
    /// cancelled.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        task: F,
    ) -> ScheduledFuture<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_runnable(ScheduleOptions::fixed_delay(initial_delay, delay), task)
    }

    /// Runs `task` on the loop thread as soon as possible and completes the future with its
    /// result.
    pub fn submit<T, F>(&self, task: F) -> ScheduledFuture<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let mut task = Some(task);

        self.schedule_step(
            TaskKind::Callable,
            ScheduleOptions::only_once(Duration::ZERO),
            Box::new(move |_: &TimeSharingContext| match task.take() {
                Some(task) => Step::Success(task()),
                None => Step::Failure(FutureError::Cancelled),
            }),
        )
    }

    fn schedule_step<T>(
        &self,
        kind: TaskKind,
        options: ScheduleOptions,
        step: StepFn<T>,
    ) -> ScheduledFuture<T>
    where
        T: Send + Sync + 'static,
    {
        self.start();

        let promise = match self.thread_id() {
            Some(owner) => Promise::with_owner(owner),
            None => Promise::new(),
        };
        let control = Arc::new(TaskControl::default());

        let future = ScheduledFuture {
            promise: promise.clone(),
            control: Arc::clone(&control),
        };

        let deadline = deadline_after(Instant::now(), options.trigger.initial_delay());
        let task = ScheduledTask {
            kind,
            options,
            step,
            context: TimeSharingContext::default(),
            promise,
            control,
            loop_name: Arc::from(self.name()),
        };

        // On rejection the registration is dropped unrun, which fails the future.
        _ = self.submit_task(Box::new(move |timers: &mut TimerQueue| {
            timers.push(deadline, Box::new(task));
        }));

        future
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ScheduledFuture<u32>: Send, Sync);
    assert_impl_all!(ScheduleOptions: Send, Sync, Copy);

    fn task<T>(
        kind: TaskKind,
        options: ScheduleOptions,
        step: StepFn<T>,
    ) -> (ScheduledTask<T>, ScheduledFuture<T>)
    where
        T: Send + Sync + 'static,
    {
        let promise = Promise::new();
        let control = Arc::new(TaskControl::default());

        let future = ScheduledFuture {
            promise: promise.clone(),
            control: Arc::clone(&control),
        };

        let task = ScheduledTask {
            kind,
            options,
            step,
            context: TimeSharingContext::default(),
            promise,
            control,
            loop_name: Arc::from("test"),
        };

        (task, future)
    }

    #[test]
    fn options_builders() {
        let options = ScheduleOptions::only_once(Duration::from_millis(5)).timeout_by_count(3);

        assert_eq!(
            options.trigger(),
            Trigger::Once {
                initial_delay: Duration::from_millis(5)
            }
        );
        assert_eq!(options.timeout(), TimeoutPolicy::Count(3));
        assert_eq!(options.trigger().initial_delay(), Duration::from_millis(5));
    }

    #[test]
    fn context_counts_invocations() {
        let mut context = TimeSharingContext::default();
        assert_eq!(context.elapsed(), Duration::ZERO);

        context.begin_invocation(Instant::now());
        assert!(context.is_first_invocation());

        context.begin_invocation(Instant::now());
        assert!(!context.is_first_invocation());
        assert_eq!(context.invocations(), 2);
    }

    #[test]
    fn time_sharing_fails_after_count() {
        let (mut task, future) = task::<u32>(
            TaskKind::TimeSharing,
            ScheduleOptions::only_once(Duration::ZERO).timeout_by_count(2),
            Box::new(|_| Step::Continue),
        );

        assert!(task.run().is_some());
        assert_eq!(future.state(), TaskState::Running);

        assert!(task.run().is_none());
        assert!(matches!(
            future.cause(),
            Some(FutureError::TimeSharingTimeout {
                bound: TimeoutBound::Count(2)
            })
        ));
        assert_eq!(future.state(), TaskState::Failed);
    }

    #[test]
    fn count_zero_behaves_like_one() {
        let (mut task, future) = task::<u32>(
            TaskKind::TimeSharing,
            ScheduleOptions::only_once(Duration::ZERO).timeout_by_count(0),
            Box::new(|_| Step::Continue),
        );

        assert!(task.run().is_none());
        assert!(future.cause().is_some_and(|cause| cause.is_timeout()));
    }

    #[test]
    fn success_on_first_invocation_ignores_timeout() {
        let (mut task, future) = task(
            TaskKind::TimeSharing,
            ScheduleOptions::only_once(Duration::ZERO).timeout_by_count(0),
            Box::new(|_| Step::Success("done")),
        );

        assert!(task.run().is_none());
        assert_eq!(future.join().unwrap(), "done");
    }

    #[test]
    fn periodic_runnable_ignores_timeout() {
        let runs = Arc::new(AtomicU32::new(0));
        let (mut task, future) = task::<()>(
            TaskKind::Runnable,
            ScheduleOptions::fixed_delay(Duration::ZERO, Duration::from_millis(10))
                .timeout_by_count(1),
            Box::new({
                let runs = Arc::clone(&runs);
                move |_| {
                    runs.fetch_add(1, Ordering::Relaxed);
                    Step::Continue
                }
            }),
        );

        let before = Instant::now();
        for _ in 0..5 {
            let next = task.run().unwrap();
            assert!(next >= before + Duration::from_millis(10));
        }

        assert_eq!(runs.load(Ordering::Relaxed), 5);
        assert!(!future.is_done());
    }

    #[test]
    fn cancel_is_observed_on_next_run() {
        let runs = Arc::new(AtomicU32::new(0));
        let (mut task, future) = task::<()>(
            TaskKind::Runnable,
            ScheduleOptions::fixed_delay(Duration::ZERO, Duration::ZERO),
            Box::new({
                let runs = Arc::clone(&runs);
                move |_| {
                    runs.fetch_add(1, Ordering::Relaxed);
                    Step::Continue
                }
            }),
        );

        assert!(task.run().is_some());

        assert!(future.cancel());
        assert!(!future.cancel());
        assert!(!future.is_done());

        assert!(task.run().is_none());
        assert!(future.is_cancelled());
        assert_eq!(future.state(), TaskState::Cancelled);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panic_fails_future() {
        let (mut task, future) = task::<()>(
            TaskKind::Runnable,
            ScheduleOptions::fixed_delay(Duration::ZERO, Duration::ZERO),
            Box::new(|_| panic!("boom")),
        );

        assert!(task.run().is_none());
        assert!(matches!(
            future.cause(),
            Some(FutureError::Panicked { message }) if message == "boom"
        ));
    }

    #[test]
    fn dropped_registration_is_rejected() {
        let (task, future) = task::<()>(
            TaskKind::Callable,
            ScheduleOptions::only_once(Duration::ZERO),
            Box::new(|_| Step::Success(())),
        );

        drop(task);

        assert!(matches!(future.cause(), Some(FutureError::Rejected)));
    }

    #[test]
    fn abort_cancels() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut task, future) = task::<()>(
            TaskKind::Callable,
            ScheduleOptions::only_once(Duration::from_secs(60)),
            Box::new(|_| Step::Success(())),
        );

        future.promise().when_complete({
            let log = Arc::clone(&log);
            move |outcome| log.lock().unwrap().push(outcome.is_err())
        });

        task.abort(FutureError::Cancelled);
        drop(task);

        assert!(future.is_cancelled());
        assert_eq!(*log.lock().unwrap(), vec![true]);
    }
}
