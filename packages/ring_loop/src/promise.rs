//! Single-assignment completion cells with ordered continuations.

use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{FutureError, JoinError, panic_message};

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const SUCCESS: u8 = 2;
const FAILED: u8 = 3;
const CANCELLED: u8 = 4;

/// Process-wide default for [`CallbackOrder`]; `false` means FIFO.
static LIFO_BY_DEFAULT: AtomicBool = AtomicBool::new(false);

/// The order in which continuations queued on a pending promise run once it completes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum CallbackOrder {
    /// Registration order: the continuation registered first runs first.
    #[default]
    Fifo,

    /// Reverse registration order.
    ///
    /// This reproduces the behavior of older callers that pushed continuations onto a stack.
    /// It is kept exactly as such for compatibility and must be opted into.
    Lifo,
}

impl CallbackOrder {
    /// The process-wide default applied to promises that do not choose an order explicitly.
    #[must_use]
    pub fn process_default() -> Self {
        if LIFO_BY_DEFAULT.load(Ordering::Relaxed) {
            Self::Lifo
        } else {
            Self::Fifo
        }
    }
}

/// Changes the process-wide default [`CallbackOrder`].
///
/// Only affects promises created afterwards. The default is [`CallbackOrder::Fifo`].
pub fn set_default_callback_order(order: CallbackOrder) {
    LIFO_BY_DEFAULT.store(order == CallbackOrder::Lifo, Ordering::Relaxed);
}

/// Lifecycle state of a [`Promise`]. Once it leaves `Pending` it never changes again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PromiseState {
    /// Not completed yet.
    Pending,

    /// Completed with a value.
    Success,

    /// Completed with a cause other than cancellation.
    Failed,

    /// Cancelled.
    Cancelled,
}

type Outcome<T> = Result<T, FutureError>;
type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

struct Waiters<T> {
    continuations: Vec<Continuation<T>>,
    wakers: Vec<Waker>,

    /// Set (under the lock) once the outcome is stored. From then on, nothing is queued.
    drained: bool,
}

struct Shared<T> {
    state: AtomicU8,
    outcome: OnceLock<Outcome<T>>,
    waiters: Mutex<Waiters<T>>,
    completed: Condvar,
    order: CallbackOrder,

    /// The thread expected to complete this promise (normally an event loop thread). Blocking
    /// on the promise from that thread would deadlock.
    owner: OnceLock<ThreadId>,
}

/// A single-assignment completion cell.
///
/// A promise moves from pending to exactly one terminal state - success with a value, failure
/// with a [`FutureError`], or cancellation. The transition is a compare-and-set, so when several
/// parties race to complete the promise exactly one wins; the others are told so through the
/// `false` return value and are otherwise ignored.
///
/// # Continuations
///
/// Continuations registered while the promise is pending are queued and run synchronously on the
/// thread that completes it, in [`CallbackOrder`] (FIFO unless configured otherwise).
/// Continuations registered after completion run immediately on the registering thread.
/// A panicking continuation is logged and does not prevent the others from running.
///
/// # Waiting
///
/// [`join()`](Self::join) blocks the calling thread. Promises can also be `.await`ed.
///
/// Cloning a promise is cheap and yields another handle to the same cell.
///
/// # Example
///
/// ```rust
/// use std::sync::{Arc, Mutex};
///
/// use ring_loop::Promise;
///
/// let promise = Promise::<u32>::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
///
/// for index in 0..3 {
///     let seen = Arc::clone(&seen);
///     promise.then_accept(move |_| seen.lock().unwrap().push(index));
/// }
///
/// assert!(promise.complete(7));
/// assert!(!promise.complete(8));
///
/// assert_eq!(promise.join().unwrap(), 7);
/// assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
/// ```
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Promise<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a pending promise using the process-wide default callback order.
    #[must_use]
    pub fn new() -> Self {
        Self::with_order(CallbackOrder::process_default())
    }

    /// Creates a pending promise with an explicit callback order.
    #[must_use]
    pub fn with_order(order: CallbackOrder) -> Self {
        Self::build(order, None)
    }

    /// Creates a pending promise that is expected to be completed on `owner`.
    pub(crate) fn with_owner(owner: ThreadId) -> Self {
        Self::build(CallbackOrder::process_default(), Some(owner))
    }

    fn build(order: CallbackOrder, owner: Option<ThreadId>) -> Self {
        let owner_cell = OnceLock::new();
        if let Some(owner) = owner {
            _ = owner_cell.set(owner);
        }

        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(PENDING),
                outcome: OnceLock::new(),
                waiters: Mutex::new(Waiters {
                    continuations: Vec::new(),
                    wakers: Vec::new(),
                    drained: false,
                }),
                completed: Condvar::new(),
                order,
                owner: owner_cell,
            }),
        }
    }

    /// Creates a promise that already succeeded with `value`.
    #[must_use]
    pub fn completed(value: T) -> Self {
        let promise = Self::new();
        promise.complete(value);
        promise
    }

    /// Creates a promise that already failed with `cause`.
    #[must_use]
    pub fn failed(cause: FutureError) -> Self {
        let promise = Self::new();
        promise.complete_exceptionally(cause);
        promise
    }

    /// A new pending promise with the same owner and callback order, for derived stages.
    fn derive<U>(&self) -> Promise<U>
    where
        U: Send + Sync + 'static,
    {
        Promise::build(self.shared.order, self.shared.owner.get().copied())
    }

    /// Records the thread expected to complete this promise, if none was recorded yet.
    pub(crate) fn bind_owner(&self, owner: ThreadId) {
        _ = self.shared.owner.set(owner);
    }

    /// The callback order of this promise.
    #[must_use]
    pub fn callback_order(&self) -> CallbackOrder {
        self.shared.order
    }

    /// Completes the promise with `value`.
    ///
    /// Returns `false` (and drops `value`) if the promise was already completed.
    pub fn complete(&self, value: T) -> bool {
        self.complete_with(Ok(value))
    }

    /// Completes the promise with `cause`.
    ///
    /// Returns `false` if the promise was already completed.
    pub fn complete_exceptionally(&self, cause: FutureError) -> bool {
        self.complete_with(Err(cause))
    }

    /// Cancels the promise, completing it with [`FutureError::Cancelled`] on this thread.
    ///
    /// Returns `false` if the promise was already completed.
    pub fn try_cancel(&self) -> bool {
        self.complete_with(Err(FutureError::Cancelled))
    }

    pub(crate) fn complete_with(&self, outcome: Outcome<T>) -> bool {
        let shared = &*self.shared;

        if shared
            .state
            .compare_exchange(PENDING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let terminal = match &outcome {
            Ok(_) => SUCCESS,
            Err(FutureError::Cancelled) => CANCELLED,
            Err(_) => FAILED,
        };

        // We won the state transition, so nobody else can be setting the outcome.
        drop(shared.outcome.set(outcome));
        shared.state.store(terminal, Ordering::Release);

        let (continuations, wakers) = {
            let mut waiters = shared.waiters.lock();
            waiters.drained = true;
            (
                mem::take(&mut waiters.continuations),
                mem::take(&mut waiters.wakers),
            )
        };

        shared.completed.notify_all();

        let outcome = self.outcome_ref();

        match shared.order {
            CallbackOrder::Fifo => {
                for continuation in continuations {
                    run_continuation(continuation, outcome);
                }
            }
            CallbackOrder::Lifo => {
                for continuation in continuations.into_iter().rev() {
                    run_continuation(continuation, outcome);
                }
            }
        }

        for waker in wakers {
            waker.wake();
        }

        true
    }

    fn outcome_ref(&self) -> &Outcome<T> {
        self.shared
            .outcome
            .get()
            .expect("outcome is always stored before the promise is observed as completed")
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PromiseState {
        match self.shared.state.load(Ordering::Acquire) {
            SUCCESS => PromiseState::Success,
            FAILED => PromiseState::Failed,
            CANCELLED => PromiseState::Cancelled,
            _ => PromiseState::Pending,
        }
    }

    /// Whether the promise reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state() != PromiseState::Pending
    }

    /// Whether the promise completed with a value.
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.state() == PromiseState::Success
    }

    /// Whether the promise was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == PromiseState::Cancelled
    }

    /// The failure or cancellation cause, if the promise completed without a value.
    #[must_use]
    pub fn cause(&self) -> Option<FutureError> {
        if !self.is_done() {
            return None;
        }

        self.outcome_ref().as_ref().err().cloned()
    }

    /// Registers `continuation` to observe the outcome.
    ///
    /// Runs immediately on this thread if the promise is already completed, otherwise on the
    /// completing thread.
    pub fn when_complete<F>(&self, continuation: F)
    where
        F: FnOnce(&Result<T, FutureError>) + Send + 'static,
    {
        let mut waiters = self.shared.waiters.lock();

        if !waiters.drained {
            waiters.continuations.push(Box::new(continuation));
            return;
        }

        drop(waiters);
        run_continuation(Box::new(continuation), self.outcome_ref());
    }

    /// Returns a promise completed with `f(&value)` once this one succeeds, or with this
    /// promise's cause if it does not.
    ///
    /// If `f` panics, the returned promise fails with [`FutureError::Panicked`].
    pub fn then_apply<U, F>(&self, f: F) -> Promise<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let next = self.derive::<U>();
        let target = next.clone();

        self.when_complete(move |outcome| match outcome {
            Ok(value) => match panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
                Ok(mapped) => {
                    target.complete(mapped);
                }
                Err(payload) => {
                    target.complete_exceptionally(FutureError::from_panic(payload.as_ref()));
                }
            },
            Err(cause) => {
                target.complete_exceptionally(cause.clone());
            }
        });

        next
    }

    /// Returns a promise that completes after `f(&value)` ran on success, or with this
    /// promise's cause if it does not succeed.
    pub fn then_accept<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.then_apply(f)
    }

    /// Returns a promise that completes after `f()` ran on success, or with this promise's
    /// cause if it does not succeed.
    pub fn then_run<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.then_apply(move |_| f())
    }

    fn debug_assert_not_owner(&self) {
        debug_assert!(
            self.shared.owner.get() != Some(&thread::current().id()),
            "blocking on a promise from the thread that completes it would deadlock"
        );
    }

    /// Blocks until the promise completes and returns the value or cause.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if called on the thread this promise is expected to be completed
    /// on (its event loop thread), as that would deadlock.
    pub fn join(&self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        self.debug_assert_not_owner();

        let mut waiters = self.shared.waiters.lock();
        while !waiters.drained {
            self.shared.completed.wait(&mut waiters);
        }
        drop(waiters);

        self.outcome_ref().clone()
    }

    /// Blocks until the promise completes or `timeout` passes.
    ///
    /// # Errors
    ///
    /// [`JoinError::TimedOut`] if the promise is still pending after `timeout`,
    /// [`JoinError::Completed`] if it completed without a value.
    ///
    /// # Panics
    ///
    /// Same as [`join()`](Self::join).
    pub fn join_timeout(&self, timeout: Duration) -> Result<T, JoinError>
    where
        T: Clone,
    {
        if self.await_uninterruptibly(timeout) {
            Ok(self.outcome_ref().clone()?)
        } else {
            Err(JoinError::TimedOut)
        }
    }

    /// Blocks until the promise completes or `timeout` passes, returning whether it completed.
    ///
    /// # Panics
    ///
    /// Same as [`join()`](Self::join).
    pub fn await_uninterruptibly(&self, timeout: Duration) -> bool {
        self.debug_assert_not_owner();

        let deadline = Instant::now().checked_add(timeout);

        let mut waiters = self.shared.waiters.lock();
        while !waiters.drained {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .completed
                        .wait_until(&mut waiters, deadline)
                        .timed_out()
                    {
                        return waiters.drained;
                    }
                }
                None => self.shared.completed.wait(&mut waiters),
            }
        }

        true
    }

    /// The value, if the promise already succeeded.
    #[must_use]
    pub fn result_now(&self) -> Option<T>
    where
        T: Clone,
    {
        if !self.is_done() {
            return None;
        }

        self.outcome_ref().as_ref().ok().cloned()
    }
}

impl<T> Default for Promise<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn run_continuation<T>(continuation: Continuation<T>, outcome: &Outcome<T>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| continuation(outcome))) {
        warn!(
            panic_message = %panic_message(payload.as_ref()),
            "promise continuation panicked"
        );
    }
}

impl<T> Future for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, FutureError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut waiters = self.shared.waiters.lock();

        if waiters.drained {
            drop(waiters);
            return Poll::Ready(self.outcome_ref().clone());
        }

        if !waiters.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            waiters.wakers.push(cx.waker().clone());
        }

        Poll::Pending
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.state.load(Ordering::Acquire) {
            SUCCESS => "Success",
            FAILED => "Failed",
            CANCELLED => "Cancelled",
            _ => "Pending",
        };

        f.debug_struct("Promise")
            .field("state", &state)
            .field("order", &self.shared.order)
            .finish_non_exhaustive()
    }
}
