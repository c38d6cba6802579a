//! The loop thread: consumes the ring buffer, runs timers and drives the agent.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::event_loop::{LoopHandle, LoopInner};
use crate::metrics::{BATCH_SIZE, EVENTS_CONSUMED, TIMER_LATENESS_MS};
use crate::timer::TimerQueue;
use crate::{Agent, AgentError, FutureError, RingEvent, panic_message};

/// Work the loop runs on its own thread, with access to its timer queue.
pub(crate) type LoopTask = Box<dyn FnOnce(&mut TimerQueue) + Send>;

thread_local! {
    /// Tasks submitted from the loop thread itself. They bypass the ring buffer, so the loop
    /// never waits on its own full buffer.
    static LOCAL_TASKS: RefCell<VecDeque<LoopTask>> = const { RefCell::new(VecDeque::new()) };
}

pub(crate) fn push_local(task: LoopTask) {
    LOCAL_TASKS.with_borrow_mut(|tasks| tasks.push_back(task));
}

fn has_local_tasks() -> bool {
    LOCAL_TASKS.with_borrow(|tasks| !tasks.is_empty())
}

/// Entry point of the loop thread.
pub(crate) fn run(inner: Arc<LoopInner>, agent: Box<dyn Agent>) {
    inner.bind_current_thread();
    debug!(loop_name = %inner.name, "event loop thread started");

    // Whatever happens below, the loop ends up terminated and its termination future completed.
    // If something unwinds through here, this default outcome is what waiters see.
    let mut outcome = scopeguard::guard(
        Err(FutureError::fatal("event loop thread panicked")),
        |outcome: Result<(), FutureError>| {
            inner.mark_terminated();
            debug!(loop_name = %inner.name, "event loop thread exiting");

            match outcome {
                Ok(()) => inner.termination.complete(()),
                Err(cause) => {
                    error!(loop_name = %inner.name, %cause, "event loop terminated by a fatal error");
                    inner.termination.complete_exceptionally(cause)
                }
            };
        },
    );

    let mut worker = Worker::new(Arc::clone(&inner), agent);

    let result = worker.run();

    worker.finish();

    *outcome = result;
}

struct Worker {
    inner: Arc<LoopInner>,
    handle: LoopHandle,
    agent: Box<dyn Agent>,
    timers: TimerQueue,

    /// Next sequence to consume.
    next: i64,

    /// Whether `on_start()` succeeded.
    started: bool,
}

impl Worker {
    fn new(inner: Arc<LoopInner>, agent: Box<dyn Agent>) -> Self {
        let next = inner.ring.consumed().wrapping_add(1);

        Self {
            handle: LoopHandle {
                inner: Arc::clone(&inner),
            },
            inner,
            agent,
            timers: TimerQueue::new(),
            next,
            started: false,
        }
    }

    /// Runs until shutdown has drained every claimed event, or until a fatal error.
    fn run(&mut self) -> Result<(), FutureError> {
        self.start()?;

        // Set once shutdown is observed: the highest claim that may still carry an event.
        // Claims made after it see the shutdown themselves and are published as no-ops.
        let mut drain_target: Option<i64> = None;

        loop {
            if drain_target.is_none() && self.inner.is_shutting_down() {
                drain_target = Some(self.inner.ring.claimed());
            }

            match drain_target {
                Some(target) if self.next > target => return Ok(()),
                Some(_) => {}
                None => self.wait_for_work(),
            }

            let consumed = self.consume_batch()?;
            self.run_local_tasks();
            self.run_due_timers();
            self.update();

            if drain_target.is_some() && consumed == 0 {
                // A producer claimed before shutdown but has not published yet.
                thread::yield_now();
            }
        }
    }

    fn start(&mut self) -> Result<(), FutureError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.agent.on_start(&self.handle))) {
            Ok(Ok(())) => {
                self.started = true;
                Ok(())
            }
            Ok(Err(error)) => Err(FutureError::Fatal(Arc::new(error))),
            Err(payload) => Err(FutureError::from_panic(payload.as_ref())),
        }
    }

    fn has_work(&self) -> bool {
        self.is_published(self.next)
            || has_local_tasks()
            || self.inner.is_shutting_down()
            || self
                .timers
                .next_deadline()
                .is_some_and(|deadline| deadline <= Instant::now())
    }

    fn is_published(&self, sequence: i64) -> bool {
        self.inner.ring.highest_published(sequence, sequence) >= sequence
    }

    fn wait_for_work(&self) {
        let mut round = 0_u32;

        while !self.has_work() {
            self.inner.wait_strategy.idle(
                &mut round,
                &self.inner.wake,
                self.timers.next_deadline(),
                || self.has_work(),
            );
        }
    }

    /// Delivers up to one batch of published events. Returns how many were consumed.
    fn consume_batch(&mut self) -> Result<usize, FutureError> {
        let ring = &self.inner.ring;
        let first = self.next;

        let span = i64::try_from(self.inner.batch_size)
            .unwrap_or(i64::MAX)
            .saturating_sub(1);
        let high = ring.cursor().min(first.saturating_add(span));

        if high < first {
            return Ok(0);
        }

        let available = ring.highest_published(first, high);
        if available < first {
            return Ok(0);
        }

        let mut sequence = first;
        let mut fatal = None;

        while sequence <= available {
            // SAFETY: `sequence` is published and not yet marked consumed, so only the loop
            // thread may touch the slot until `mark_consumed` below.
            let event = unsafe { &mut *ring.slot(sequence) };

            let result = dispatch(
                &mut *self.agent,
                &mut self.timers,
                &self.inner.name,
                sequence,
                event,
            );
            event.reset();

            if let Err(cause) = result {
                fatal = Some(cause);
                break;
            }

            sequence = sequence.wrapping_add(1);
        }

        let last = if fatal.is_some() { sequence } else { available };
        // SAFETY: The loop thread is the only consumer, every slot up to `last` is published
        // and the slots were reset above and are not touched again.
        unsafe {
            ring.mark_consumed(last);
        }
        self.next = last.wrapping_add(1);

        let count = usize::try_from(last.wrapping_sub(first).wrapping_add(1)).unwrap_or(0);
        EVENTS_CONSUMED.with(|event| event.batch(count).observe_once());
        BATCH_SIZE.with(|event| event.observe(count));

        fatal.map_or(Ok(count), Err)
    }

    fn run_local_tasks(&mut self) {
        // Only what is queued now; tasks queued by these tasks wait for the next iteration.
        let pending = LOCAL_TASKS.with_borrow(VecDeque::len);

        for _ in 0..pending {
            let Some(task) = LOCAL_TASKS.with_borrow_mut(VecDeque::pop_front) else {
                break;
            };

            run_task(task, &mut self.timers, &self.inner.name);
        }
    }

    fn run_due_timers(&mut self) {
        let now = Instant::now();
        let mut rescheduled = Vec::new();

        while let Some((deadline, mut task)) = self.timers.pop_due(now) {
            TIMER_LATENESS_MS
                .with(|event| event.observe_millis(now.saturating_duration_since(deadline)));

            if let Some(next) = task.run() {
                rescheduled.push((next, task));
            }
        }

        // Re-queued after the pass so a task that asks to run again "now" cannot monopolize it.
        for (deadline, task) in rescheduled {
            self.timers.push(deadline, task);
        }
    }

    fn update(&mut self) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.agent.update())) {
            error!(
                loop_name = %self.inner.name,
                panic = %panic_message(payload.as_ref()),
                "agent panicked in update"
            );
        }
    }

    /// Resets every slot claimed so far that was not delivered, which fails tasks among them.
    ///
    /// Only does anything after a fatal error; an orderly shutdown has already drained these.
    fn discard_undelivered(&mut self) {
        let target = self.inner.ring.claimed();

        while self.next <= target {
            if !self.is_published(self.next) {
                // Claimed before shutdown was visible; every claim is published shortly after.
                thread::yield_now();
                continue;
            }

            // SAFETY: Published and not yet marked consumed, so the slot is ours.
            let event = unsafe { &mut *self.inner.ring.slot(self.next) };
            event.reset();

            // SAFETY: Only consumer, slot published and reset above.
            unsafe {
                self.inner.ring.mark_consumed(self.next);
            }
            self.next = self.next.wrapping_add(1);
        }
    }

    /// Releases everything the loop owns. The caller marks the loop terminated afterwards.
    fn finish(mut self) {
        // A fatal error skips the orderly drain; stop producers right away.
        self.inner.shutdown();
        self.discard_undelivered();

        debug!(
            loop_name = %self.inner.name,
            pending = self.timers.len(),
            "cancelling pending timers"
        );

        for mut task in self.timers.drain() {
            task.abort(FutureError::Cancelled);
        }

        if self.started {
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| self.agent.on_shutdown()))
            {
                error!(
                    loop_name = %self.inner.name,
                    panic = %panic_message(payload.as_ref()),
                    "agent panicked in on_shutdown"
                );
            }
        }

        // Anything still queued locally was submitted after shutdown began and never runs.
        drop(LOCAL_TASKS.with_borrow_mut(mem::take));

        drop(self);
    }
}

fn dispatch(
    agent: &mut dyn Agent,
    timers: &mut TimerQueue,
    loop_name: &str,
    sequence: i64,
    event: &mut RingEvent,
) -> Result<(), FutureError> {
    if event.is_internal() {
        if let Some(task) = event.task.take() {
            run_task(task, timers, loop_name);
        }
        return Ok(());
    }

    match panic::catch_unwind(AssertUnwindSafe(|| agent.on_event(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(AgentError::Failed(error))) => {
            error!(loop_name, sequence, %error, "agent failed to process event");
            Ok(())
        }
        Ok(Err(AgentError::Fatal(error))) => Err(FutureError::Fatal(Arc::from(error))),
        Err(payload) => {
            error!(
                loop_name,
                sequence,
                panic = %panic_message(payload.as_ref()),
                "agent panicked while processing event"
            );
            Ok(())
        }
    }
}

fn run_task(task: LoopTask, timers: &mut TimerQueue, loop_name: &str) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(timers))) {
        warn!(
            loop_name,
            panic = %panic_message(payload.as_ref()),
            "loop task panicked"
        );
    }
}
