#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A single-threaded event loop core for game servers: a preallocated ring buffer feeding one
//! dedicated thread, timers and time-sliced tasks on the same thread, and promises whose
//! continuations run in a deterministic order.
//!
//! Work reaches the loop thread two ways:
//!
//! * **Events** are claimed in a [`RingBuffer`] slot, filled in place and published. The loop
//!   hands each event to its [`Agent`]. Slots are reused, so the steady state allocates nothing.
//! * **Tasks** are closures scheduled through a [`LoopHandle`] to run once, periodically or as a
//!   time-sharing computation split into slices. Every task yields a [`ScheduledFuture`].
//!
//! Because all of this runs on one thread, the agent and the tasks share state without locks.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use std::time::Duration;
//!
//! use ring_loop::{EventLoop, FnAgent};
//!
//! let total = Arc::new(AtomicI64::new(0));
//!
//! let event_loop = EventLoop::builder()
//!     .name("game")
//!     .capacity(1024)
//!     .build(FnAgent::new({
//!         let total = Arc::clone(&total);
//!         move |event| {
//!             total.fetch_add(event.long_a, Ordering::Relaxed);
//!             Ok(())
//!         }
//!     }))
//!     .unwrap();
//!
//! for value in 1..=10 {
//!     event_loop
//!         .publish_event(|event| {
//!             event.kind = 1;
//!             event.long_a = value;
//!         })
//!         .unwrap();
//! }
//!
//! // Tasks run on the loop thread after everything published before them.
//! let seen = event_loop.submit({
//!     let total = Arc::clone(&total);
//!     move || total.load(Ordering::Relaxed)
//! });
//! assert_eq!(seen.join().unwrap(), 55);
//!
//! event_loop.shutdown();
//! assert!(event_loop.await_termination(Duration::from_secs(10)));
//! ```
//!
//! # Shutdown
//!
//! [`LoopHandle::shutdown()`] stops admitting new events and tasks but still delivers every
//! event claimed before it. Scheduled tasks that are still pending are cancelled. The
//! [`termination future`](LoopHandle::termination_future) completes once the loop thread has
//! finished. Dropping the [`EventLoop`] shuts down and waits for the thread.
//!
//! # Failures
//!
//! Errors and panics of the agent are contained to the event that caused them and logged via
//! `tracing`. Panics in tasks fail the task's future. Only [`AgentError::Fatal`] terminates the
//! loop, failing its termination future.

mod agent;
mod error;
mod event;
mod event_loop;
mod metrics;
mod promise;
mod ring_buffer;
mod scheduler;
mod sequence;
mod timer;
mod wait_strategy;

pub use agent::*;
pub use error::*;
pub(crate) use error::panic_message;
pub use event::*;
pub use event_loop::*;
pub use promise::*;
pub use ring_buffer::*;
pub use scheduler::*;
pub use sequence::*;
pub use wait_strategy::*;
