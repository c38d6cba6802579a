//! The per-loop consumer callback.

use std::fmt;

use crate::{AgentError, LoopHandle, RingEvent};

/// The consumer of an event loop's ring buffer.
///
/// Exactly one agent is bound to a loop for the loop's whole lifetime. All methods run on the
/// loop thread, so the agent can keep any state it likes without synchronization.
///
/// Errors and panics from [`on_event()`](Self::on_event) are isolated to the event that caused
/// them: they are logged and the loop moves on to the next event. Only [`AgentError::Fatal`]
/// returned from [`on_event()`](Self::on_event), or any failure of
/// [`on_start()`](Self::on_start), terminates the loop. [`update()`](Self::update) and
/// [`on_shutdown()`](Self::on_shutdown) cannot fail; panics in them are logged.
#[cfg_attr(test, mockall::automock)]
pub trait Agent: Send + 'static {
    /// Called once on the loop thread before any event is delivered.
    ///
    /// The handle can be cloned and kept to schedule work or publish events later.
    ///
    /// # Errors
    ///
    /// Any error is fatal: the loop terminates without delivering events.
    fn on_start(&mut self, handle: &LoopHandle) -> Result<(), AgentError> {
        _ = handle;
        Ok(())
    }

    /// Processes one published event.
    ///
    /// The loop resets the slot after this returns; take ownership of `obj_*` payloads if they
    /// need to outlive the call.
    ///
    /// # Errors
    ///
    /// [`AgentError::Failed`] is logged and skipped, [`AgentError::Fatal`] terminates the loop.
    fn on_event(&mut self, event: &mut RingEvent) -> Result<(), AgentError>;

    /// Called once per loop iteration, after the iteration's events and due timers.
    fn update(&mut self) {}

    /// Called once on the loop thread after the last event was delivered.
    fn on_shutdown(&mut self) {}
}

/// An [`Agent`] that delegates [`on_event()`](Agent::on_event) to a closure.
///
/// # Example
///
/// ```rust
/// use ring_loop::{EventLoop, FnAgent};
///
/// let event_loop = EventLoop::builder()
///     .build(FnAgent::new(|event| {
///         println!("got event of kind {}", event.kind);
///         Ok(())
///     }))
///     .unwrap();
/// # drop(event_loop);
/// ```
pub struct FnAgent<F> {
    on_event: F,
}

impl<F> FnAgent<F>
where
    F: FnMut(&mut RingEvent) -> Result<(), AgentError> + Send + 'static,
{
    /// Wraps `on_event`.
    pub fn new(on_event: F) -> Self {
        Self { on_event }
    }
}

impl<F> Agent for FnAgent<F>
where
    F: FnMut(&mut RingEvent) -> Result<(), AgentError> + Send + 'static,
{
    fn on_event(&mut self, event: &mut RingEvent) -> Result<(), AgentError> {
        (self.on_event)(event)
    }
}

impl<F> fmt::Debug for FnAgent<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAgent").finish_non_exhaustive()
    }
}

/// An [`Agent`] that ignores every event, for loops used only to run scheduled tasks.
#[derive(Debug, Default)]
pub struct IdleAgent;

impl Agent for IdleAgent {
    fn on_event(&mut self, _event: &mut RingEvent) -> Result<(), AgentError> {
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;

    #[test]
    fn fn_agent_delegates() {
        let total = Arc::new(AtomicI64::new(0));
        let mut agent = FnAgent::new({
            let total = Arc::clone(&total);
            move |event: &mut RingEvent| {
                if event.kind == 0 {
                    return Err(AgentError::failed("kind zero"));
                }
                total.fetch_add(event.long_a, Ordering::Relaxed);
                Ok(())
            }
        });

        let mut event = RingEvent {
            kind: 1,
            long_a: 40,
            ..RingEvent::default()
        };
        agent.on_event(&mut event).unwrap();
        event.long_a = 2;
        agent.on_event(&mut event).unwrap();

        event.kind = 0;
        assert!(matches!(
            agent.on_event(&mut event),
            Err(AgentError::Failed(_))
        ));

        assert_eq!(total.load(Ordering::Relaxed), 42);
    }

    #[test]
    fn idle_agent_accepts_everything() {
        let mut agent = IdleAgent;
        let mut event = RingEvent::default();

        agent.update();
        assert!(agent.on_event(&mut event).is_ok());
        agent.on_shutdown();
    }
}
