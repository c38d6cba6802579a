//! Event loop lifecycle and the producer-side API.

mod worker;

use std::any::type_name;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle as ThreadJoinHandle, ThreadId};
use std::time::{Duration, Instant};

use event_listener::Event;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    Agent, BackpressureStrategy, ConfigError, ProducerType, Promise, Rejected, RingBuffer,
    RingEvent, WaitStrategy,
};

pub(crate) use worker::LoopTask;

const DEFAULT_NAME: &str = "ring-loop";
const DEFAULT_CAPACITY: usize = 8192;
const DEFAULT_BATCH_SIZE: usize = 1024;

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_TERMINATED: u8 = 3;

/// Lifecycle state of an event loop.
///
/// States only ever move forward: `New` → `Running` → `ShuttingDown` → `Terminated`, or
/// straight from `New` to `Terminated` when a loop that never started is shut down.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum LoopState {
    /// Built, thread not started yet.
    New,

    /// The loop thread is running and accepting events.
    Running,

    /// Shutdown was requested. New claims are rejected; already claimed events are drained.
    ShuttingDown,

    /// The loop thread has finished.
    Terminated,
}

impl LoopState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_NEW => Self::New,
            STATE_RUNNING => Self::Running,
            STATE_SHUTTING_DOWN => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }
}

pub(crate) struct LoopInner {
    pub(crate) name: String,
    pub(crate) ring: RingBuffer<RingEvent>,
    pub(crate) wait_strategy: WaitStrategy,
    backpressure: BackpressureStrategy,
    pub(crate) batch_size: usize,

    state: AtomicU8,

    /// Producers notify this after publishing when the loop parks in
    /// [`WaitStrategy::Blocking`]. Shutdown always notifies it.
    pub(crate) wake: Event,

    thread_id: OnceLock<ThreadId>,
    thread: Mutex<Option<ThreadJoinHandle<()>>>,

    /// The agent, until the loop thread takes ownership of it.
    agent: Mutex<Option<Box<dyn Agent>>>,

    pub(crate) termination: Promise<()>,
}

impl fmt::Debug for LoopInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("name", &self.name)
            .field("state", &self.state())
            .field("ring", &self.ring)
            .field("wait_strategy", &self.wait_strategy)
            .field("backpressure", &self.backpressure)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl LoopInner {
    pub(crate) fn state(&self) -> LoopState {
        LoopState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// Whether shutdown has begun (or the loop has already terminated).
    ///
    /// Sequentially consistent: producers call this after claiming, and the loop thread reads
    /// the claim cursor after observing `true`. Either the producer sees the shutdown or the
    /// loop sees the claim.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_SHUTTING_DOWN
    }

    pub(crate) fn mark_terminated(&self) {
        self.state.store(STATE_TERMINATED, Ordering::SeqCst);
    }

    pub(crate) fn bind_current_thread(&self) {
        let id = thread::current().id();
        _ = self.thread_id.set(id);
        self.termination.bind_owner(id);
    }

    fn in_event_loop(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// Spawns the loop thread if the loop is still new.
    fn ensure_started(self: &Arc<Self>) {
        if self.state.load(Ordering::Acquire) != STATE_NEW {
            return;
        }

        // Exactly one caller wins NEW -> RUNNING. `shutdown()` races on the same transition
        // (NEW -> TERMINATED), so a loop that was shut down before starting never starts.
        if self
            .state
            .compare_exchange(
                STATE_NEW,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let Some(agent) = self.agent.lock().take() else {
            return;
        };

        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker::run(inner, agent))
            .expect("failed to spawn event loop thread: thread spawning failure is not supported");

        let id = handle.thread().id();
        _ = self.thread_id.set(id);
        self.termination.bind_owner(id);

        *self.thread.lock() = Some(handle);
    }

    /// Requests shutdown. Idempotent.
    pub(crate) fn shutdown(&self) {
        let mut current = self.state.load(Ordering::SeqCst);

        loop {
            let next = match current {
                STATE_NEW => STATE_TERMINATED,
                STATE_RUNNING => STATE_SHUTTING_DOWN,
                _ => return,
            };

            match self
                .state
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == STATE_NEW {
            // Never started: nobody will ever consume, so finish right here.
            drop(self.agent.lock().take());
            debug!(loop_name = %self.name, "event loop shut down before it started");
            self.termination.complete(());
        } else {
            debug!(loop_name = %self.name, "event loop shutdown requested");
            self.wake.notify(usize::MAX);
        }
    }

    /// Accepts a fresh claim, or publishes it as a no-op if shutdown began in the meantime.
    fn admit(&self, sequence: i64) -> Result<i64, Rejected> {
        if !self.is_shutting_down() {
            return Ok(sequence);
        }

        // SAFETY: We claimed `sequence` and have not published it, so we own the slot.
        let event = unsafe { &mut *self.ring.slot(sequence) };
        event.discarded = true;

        // SAFETY: Our own claim, published once. The slot is not touched afterwards.
        unsafe {
            self.publish(sequence);
        }

        trace!(loop_name = %self.name, sequence, "claim rejected after shutdown began");
        Err(Rejected)
    }

    /// # Safety
    ///
    /// Same contract as [`RingBuffer::publish()`].
    unsafe fn publish(&self, sequence: i64) {
        // SAFETY: Forwarded to the caller.
        unsafe {
            self.ring.publish(sequence);
        }

        if self.wait_strategy.requires_notification() {
            self.wake.notify(1);
        }
    }

    fn join_thread(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            // Dropped from within the loop itself; the thread finishes on its own.
            return;
        }

        if let Err(payload) = handle.join() {
            // User code runs inside panic traps on the loop thread. A panic escaping them
            // means the loop itself is broken, which must not go unnoticed.
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }
}

/// A cloneable handle to an event loop.
///
/// Handles are how everything interacts with a loop: producers claim and publish events,
/// any thread schedules tasks, and the loop's own [`Agent`] can keep one (it receives one in
/// [`Agent::on_start()`]). A handle does not keep the loop thread alive: once the owning
/// [`EventLoop`] is dropped, the loop shuts down and every handle sees a terminated loop.
///
/// # Producing events
///
/// ```rust
/// use ring_loop::{EventLoop, FnAgent};
///
/// let event_loop = EventLoop::builder()
///     .capacity(1024)
///     .build(FnAgent::new(|event| {
///         assert_eq!(event.kind, 3);
///         Ok(())
///     }))
///     .unwrap();
///
/// // Claim, fill in place, publish.
/// let sequence = event_loop.publish_event(|event| {
///     event.kind = 3;
///     event.long_a = 99;
/// });
/// assert!(sequence.is_ok());
///
/// event_loop.shutdown();
/// assert!(event_loop.await_termination(std::time::Duration::from_secs(10)));
/// ```
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<LoopInner>,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("inner", &self.inner)
            .finish()
    }
}

impl LoopHandle {
    /// The name of the loop, which is also the name of its thread.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of slots in the ring buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.ring.capacity()
    }

    /// Number of slots that can be claimed right now without waiting.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.inner.ring.remaining_capacity()
    }

    /// Starts the loop thread. Does nothing if the loop already started or was shut down.
    ///
    /// Calling this is optional: the loop also starts on the first claim or scheduled task.
    pub fn start(&self) {
        self.inner.ensure_started();
    }

    /// Claims the next sequence, waiting according to the loop's [`BackpressureStrategy`]
    /// while the ring buffer is full.
    ///
    /// The claim must be followed by [`publish()`](Self::publish), even if the caller decides
    /// not to send anything. Prefer [`claim()`](Self::claim), which cannot forget to publish
    /// and needs no `unsafe`.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] once shutdown has begun, including while waiting for capacity.
    pub fn next_sequence(&self) -> Result<i64, Rejected> {
        self.inner.ensure_started();

        loop {
            if self.inner.is_shutting_down() {
                trace!(loop_name = %self.inner.name, "claim rejected after shutdown began");
                return Err(Rejected);
            }

            if let Some(sequence) = self.inner.ring.try_next() {
                return self.inner.admit(sequence);
            }

            self.inner.backpressure.back_off();
        }
    }

    /// Claims the next sequence, giving up after `timeout` if the ring buffer stays full.
    ///
    /// Returns `Ok(None)` when no slot became free in time. A full buffer is backpressure, not
    /// an error. A zero `timeout` makes exactly one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] once shutdown has begun.
    pub fn try_next_sequence(&self, timeout: Duration) -> Result<Option<i64>, Rejected> {
        self.inner.ensure_started();

        let deadline = Instant::now().checked_add(timeout);

        loop {
            if self.inner.is_shutting_down() {
                trace!(loop_name = %self.inner.name, "claim rejected after shutdown began");
                return Err(Rejected);
            }

            if let Some(sequence) = self.inner.ring.try_next() {
                return self.inner.admit(sequence).map(Some);
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }

            self.inner.backpressure.back_off();
        }
    }

    /// Returns a pointer to the slot for `sequence`.
    ///
    /// Dereferencing it is only valid between claiming `sequence` and publishing it. See
    /// [`with_event()`](Self::with_event) for a scoped alternative.
    #[must_use]
    pub fn get_event(&self, sequence: i64) -> *mut RingEvent {
        self.inner.ring.slot(sequence)
    }

    /// Gives `f` access to the slot for `sequence`.
    ///
    /// # Safety
    ///
    /// The caller must have claimed `sequence` through this loop and not yet published it.
    pub unsafe fn with_event<R>(&self, sequence: i64, f: impl FnOnce(&mut RingEvent) -> R) -> R {
        // SAFETY: Forwarded to the caller; between claim and publish the claimer owns the slot.
        f(unsafe { &mut *self.inner.ring.slot(sequence) })
    }

    /// Makes the claimed slot for `sequence` visible to the loop.
    ///
    /// Every claimed sequence must be published exactly once, in any order. The safe
    /// alternatives are [`claim()`](Self::claim) and [`publish_event()`](Self::publish_event),
    /// which publish for you.
    ///
    /// # Safety
    ///
    /// The caller must have claimed `sequence` through [`next_sequence()`](Self::next_sequence)
    /// or [`try_next_sequence()`](Self::try_next_sequence) on this loop, must not have published
    /// it yet and must not access the slot afterwards. Publishing a sequence owned by someone
    /// else, such as a live [`Claim`], lets the slot be written and read at the same time.
    ///
    /// ```rust,compile_fail
    /// use ring_loop::{EventLoop, IdleAgent};
    ///
    /// let event_loop = EventLoop::builder().build(IdleAgent).unwrap();
    /// let claim = event_loop.claim().unwrap();
    ///
    /// // Publishing behind the back of a live claim needs `unsafe`.
    /// event_loop.publish(claim.sequence());
    /// ```
    pub unsafe fn publish(&self, sequence: i64) {
        // SAFETY: Forwarded to the caller.
        unsafe {
            self.inner.publish(sequence);
        }
    }

    /// Claims the next slot, waiting while the ring buffer is full.
    ///
    /// The returned guard dereferences to the slot and publishes it when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] once shutdown has begun.
    pub fn claim(&self) -> Result<Claim<'_>, Rejected> {
        let sequence = self.next_sequence()?;

        Ok(Claim {
            handle: self,
            sequence,
        })
    }

    /// Claims the next slot, giving up after `timeout` if the ring buffer stays full.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] once shutdown has begun.
    pub fn try_claim(&self, timeout: Duration) -> Result<Option<Claim<'_>>, Rejected> {
        Ok(self
            .try_next_sequence(timeout)?
            .map(|sequence| Claim {
                handle: self,
                sequence,
            }))
    }

    /// Claims a slot, lets `fill` write the event and publishes it.
    ///
    /// Returns the sequence of the published event.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] once shutdown has begun; `fill` is not called then.
    pub fn publish_event(&self, fill: impl FnOnce(&mut RingEvent)) -> Result<i64, Rejected> {
        let mut claim = self.claim()?;
        fill(&mut claim);
        Ok(claim.sequence())
    }

    /// Like [`publish_event()`](Self::publish_event) but gives up after `timeout` if the ring
    /// buffer stays full, returning `Ok(None)` without calling `fill`.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] once shutdown has begun.
    pub fn try_publish_event(
        &self,
        timeout: Duration,
        fill: impl FnOnce(&mut RingEvent),
    ) -> Result<Option<i64>, Rejected> {
        let Some(mut claim) = self.try_claim(timeout)? else {
            return Ok(None);
        };

        fill(&mut claim);
        Ok(Some(claim.sequence()))
    }

    /// Runs `f` on the loop thread.
    ///
    /// From the loop thread itself, `f` is queued locally and runs later in the current or next
    /// iteration; it never waits for ring buffer capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] once shutdown has begun. `f` is dropped without running.
    pub fn execute<F>(&self, f: F) -> Result<(), Rejected>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_task(Box::new(move |_| f()))
    }

    pub(crate) fn submit_task(&self, task: LoopTask) -> Result<(), Rejected> {
        if self.inner.in_event_loop() {
            if self.inner.is_shutting_down() {
                return Err(Rejected);
            }

            worker::push_local(task);
            return Ok(());
        }

        let mut claim = self.claim()?;
        claim.task = Some(task);

        Ok(())
    }

    /// Thread id of the loop thread, once it has started.
    pub(crate) fn thread_id(&self) -> Option<ThreadId> {
        self.inner.thread_id.get().copied()
    }

    /// Requests shutdown. Idempotent.
    ///
    /// New claims are rejected from now on, while everything already claimed is still
    /// delivered. Pending scheduled tasks are cancelled. A loop that never started terminates
    /// immediately.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// A promise that completes once the loop thread has finished all work.
    ///
    /// It completes as the last step of the loop thread's function: every claimed event has
    /// been handled, pending timers are cancelled, the agent is dropped and
    /// [`state()`](Self::state) reads [`LoopState::Terminated`]. The OS thread may still be
    /// tearing down its thread-local storage at that point. Dropping the owning [`EventLoop`]
    /// waits for the thread to exit completely.
    ///
    /// It fails with [`FutureError::Fatal`][crate::FutureError::Fatal] if the loop terminated
    /// because of a fatal agent error.
    #[must_use]
    pub fn termination_future(&self) -> Promise<()> {
        self.inner.termination.clone()
    }

    /// Blocks until the loop has terminated or `timeout` elapsed.
    ///
    /// Returns whether the loop terminated.
    ///
    /// # Panics
    ///
    /// In debug builds, panics when called on the loop thread, where it would deadlock.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.termination.await_uninterruptibly(timeout)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.inner.state()
    }

    /// Whether shutdown has been requested (the loop may still be draining).
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Whether the loop has finished.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.state() == LoopState::Terminated
    }

    /// Whether the calling thread is this loop's thread.
    #[must_use]
    pub fn in_event_loop(&self) -> bool {
        self.inner.in_event_loop()
    }
}

/// A claimed ring buffer slot, published when dropped.
///
/// Dereferences to the [`RingEvent`] so it can be filled in place.
pub struct Claim<'a> {
    handle: &'a LoopHandle,
    sequence: i64,
}

impl Claim<'_> {
    /// The claimed sequence.
    #[must_use]
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Publishes the slot. Same as dropping the claim.
    pub fn publish(self) {
        drop(self);
    }
}

impl Deref for Claim<'_> {
    type Target = RingEvent;

    fn deref(&self) -> &RingEvent {
        // SAFETY: The claim owns the slot until it is published on drop.
        unsafe { &*self.handle.inner.ring.slot(self.sequence) }
    }
}

impl DerefMut for Claim<'_> {
    fn deref_mut(&mut self) -> &mut RingEvent {
        // SAFETY: The claim owns the slot until it is published on drop.
        unsafe { &mut *self.handle.inner.ring.slot(self.sequence) }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        // SAFETY: The claim owns its sequence, publishes it only here and is gone afterwards.
        unsafe {
            self.handle.inner.publish(self.sequence);
        }
    }
}

impl fmt::Debug for Claim<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// An event loop: one dedicated thread consuming a ring buffer of [`RingEvent`]s and running
/// scheduled tasks, with one [`Agent`] processing the events.
///
/// The loop thread starts lazily, on the first claim or scheduled task, or on
/// [`start()`](LoopHandle::start). Everything that talks to the loop does so through
/// [`LoopHandle`], which this type dereferences to.
///
/// # Lifetime
///
/// Dropping the `EventLoop` shuts the loop down and blocks until its thread has drained every
/// claimed event and exited.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use ring_loop::{EventLoop, IdleAgent};
///
/// let event_loop = EventLoop::builder().name("example").build(IdleAgent).unwrap();
///
/// let answer = event_loop.submit(|| 6 * 7);
/// assert_eq!(answer.join().unwrap(), 42);
/// ```
#[derive(Debug)]
pub struct EventLoop {
    handle: LoopHandle,
}

impl EventLoop {
    /// Creates a builder for configuring an event loop.
    #[must_use]
    pub fn builder() -> EventLoopBuilder {
        EventLoopBuilder::new()
    }

    /// Returns a handle that can be cloned and shared across threads.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Deref for EventLoop {
    type Target = LoopHandle;

    fn deref(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.handle.inner.shutdown();
        self.handle.inner.join_thread();
    }
}

/// Builder for configuring an [`EventLoop`].
#[derive(Debug)]
pub struct EventLoopBuilder {
    name: String,
    capacity: usize,
    producer_type: ProducerType,
    wait_strategy: WaitStrategy,
    backpressure: BackpressureStrategy,
    batch_size: usize,
}

impl EventLoopBuilder {
    fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            producer_type: ProducerType::default(),
            wait_strategy: WaitStrategy::default(),
            backpressure: BackpressureStrategy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the loop name, used for the thread name and in log events.
    ///
    /// Default is `ring-loop`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the ring buffer capacity. Must be a power of two, at least 2.
    ///
    /// Default is 8192.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets whether one or many threads publish events.
    ///
    /// With [`ProducerType::Single`], scheduling tasks from a thread other than the loop
    /// thread also counts as producing. Default is [`ProducerType::Multi`].
    #[must_use]
    pub fn producer_type(mut self, producer_type: ProducerType) -> Self {
        self.producer_type = producer_type;
        self
    }

    /// Sets how the loop thread idles when there is nothing to do.
    ///
    /// Default is [`WaitStrategy::Blocking`].
    #[must_use]
    pub fn wait_strategy(mut self, wait_strategy: WaitStrategy) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    /// Sets how producers wait while the ring buffer is full.
    #[must_use]
    pub fn backpressure(mut self, backpressure: BackpressureStrategy) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Sets the maximum number of events consumed per loop iteration.
    ///
    /// Smaller batches let timers and [`Agent::update()`] run more often under heavy load.
    /// Default is 1024.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builds the loop around `agent`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the capacity or batch size is invalid.
    pub fn build<A>(self, agent: A) -> Result<EventLoop, ConfigError>
    where
        A: Agent,
    {
        self.build_with(|_| agent)
    }

    /// Builds the loop, creating the agent from a handle to the loop being built.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the capacity or batch size is invalid.
    pub fn build_with<A, F>(self, create_agent: F) -> Result<EventLoop, ConfigError>
    where
        A: Agent,
        F: FnOnce(&LoopHandle) -> A,
    {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        let ring = RingBuffer::new(self.capacity, self.producer_type, RingEvent::default)?;

        let handle = LoopHandle {
            inner: Arc::new(LoopInner {
                name: self.name,
                ring,
                wait_strategy: self.wait_strategy,
                backpressure: self.backpressure,
                batch_size: self.batch_size,
                state: AtomicU8::new(STATE_NEW),
                wake: Event::new(),
                thread_id: OnceLock::new(),
                thread: Mutex::new(None),
                agent: Mutex::new(None),
                termination: Promise::new(),
            }),
        };

        let agent = create_agent(&handle);
        *handle.inner.agent.lock() = Some(Box::new(agent));

        Ok(EventLoop { handle })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;
    use testing::CallLog;

    use super::*;
    use crate::agent::MockAgent;
    use crate::{FnAgent, IdleAgent};

    assert_impl_all!(LoopHandle: Send, Sync, Clone);
    assert_impl_all!(EventLoop: Send, Sync);

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn builder_rejects_invalid_configuration() {
        assert_eq!(
            EventLoop::builder().capacity(1000).build(IdleAgent).err(),
            Some(ConfigError::InvalidCapacity { capacity: 1000 })
        );

        assert_eq!(
            EventLoop::builder().batch_size(0).build(IdleAgent).err(),
            Some(ConfigError::InvalidBatchSize)
        );
    }

    #[test]
    fn new_loop_is_not_started() {
        let event_loop = EventLoop::builder().capacity(8).build(IdleAgent).unwrap();

        assert_eq!(event_loop.state(), LoopState::New);
        assert!(!event_loop.in_event_loop());
        assert_eq!(event_loop.capacity(), 8);
        assert_eq!(event_loop.remaining_capacity(), 8);
    }

    #[test]
    fn shutdown_before_start_terminates_immediately() {
        let event_loop = EventLoop::builder().build(IdleAgent).unwrap();

        event_loop.shutdown();

        assert_eq!(event_loop.state(), LoopState::Terminated);
        assert!(event_loop.termination_future().is_succeeded());
        assert_eq!(event_loop.next_sequence(), Err(Rejected));

        // Still terminated, start is a no-op now.
        event_loop.start();
        assert!(event_loop.is_terminated());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn claim_publishes_on_drop() {
        let seen = Arc::new(AtomicUsize::new(0));
        let event_loop = EventLoop::builder()
            .capacity(16)
            .build(FnAgent::new({
                let seen = Arc::clone(&seen);
                move |event: &mut RingEvent| {
                    assert_eq!(event.kind, 5);
                    seen.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }))
            .unwrap();

        {
            let mut claim = event_loop.claim().unwrap();
            claim.kind = 5;
            assert_eq!(claim.sequence(), 0);
        }

        let sequence = event_loop.next_sequence().unwrap();
        // SAFETY: We claimed the sequence and have not published it.
        unsafe {
            event_loop.with_event(sequence, |event| event.kind = 5);
        }
        // SAFETY: Our own claim, published once and not touched afterwards.
        unsafe {
            event_loop.publish(sequence);
        }

        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn try_next_sequence_reports_full_buffer() {
        let event_loop = EventLoop::builder()
            .capacity(2)
            .build_with(|_| {
                FnAgent::new(|_: &mut RingEvent| {
                    // Hold up the consumer so the buffer fills.
                    thread::sleep(Duration::from_millis(100));
                    Ok(())
                })
            })
            .unwrap();

        let mut full = false;
        for _ in 0..8 {
            match event_loop.try_publish_event(Duration::ZERO, |event| event.kind = 1) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    full = true;
                    break;
                }
                Err(Rejected) => panic!("loop is running"),
            }
        }

        assert!(full);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn live_claim_keeps_its_slot_until_dropped() {
        let log = CallLog::new();
        let event_loop = EventLoop::builder()
            .capacity(2)
            .build(FnAgent::new({
                let log = log.clone();
                move |event: &mut RingEvent| {
                    log.record(event.long_a);
                    Ok(())
                }
            }))
            .unwrap();

        let mut first = event_loop.claim().unwrap();
        first.long_a = 10;

        event_loop.publish_event(|event| event.long_a = 20).unwrap();

        // The only free slot would be the one `first` still holds.
        assert!(matches!(event_loop.try_claim(Duration::ZERO), Ok(None)));
        assert_eq!(first.long_a, 10);

        drop(first);

        let mut third = event_loop.try_claim(WAIT).unwrap().unwrap();
        assert_eq!(third.sequence(), 2);
        third.long_a = 30;
        drop(third);

        event_loop.shutdown();
        assert!(event_loop.await_termination(WAIT));
        assert_eq!(log.entries(), vec![10, 20, 30]);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn in_event_loop_only_on_loop_thread() {
        let event_loop = EventLoop::builder().build(IdleAgent).unwrap();
        let handle = event_loop.handle();

        let inside = event_loop.submit(move || handle.in_event_loop());

        assert!(inside.join().unwrap());
        assert!(!event_loop.in_event_loop());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn agent_callbacks_follow_lifecycle() {
        let mut sequence = mockall::Sequence::new();
        let mut agent = MockAgent::new();

        agent
            .expect_on_start()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        agent
            .expect_on_event()
            .withf(|event| event.kind == 9)
            .times(3)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        agent
            .expect_on_shutdown()
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(());
        agent.expect_update().return_const(());

        let event_loop = EventLoop::builder().build(agent).unwrap();

        for _ in 0..3 {
            event_loop.publish_event(|event| event.kind = 9).unwrap();
        }

        event_loop.shutdown();
        // Unmet expectations panic when the mock is dropped on the loop thread.
        event_loop.termination_future().join().unwrap();
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn drop_joins_loop_thread() {
        let event_loop = EventLoop::builder().build(IdleAgent).unwrap();
        event_loop.start();

        let handle = event_loop.handle();
        drop(event_loop);

        assert!(handle.is_terminated());
        assert_eq!(handle.next_sequence(), Err(Rejected));
    }
}
