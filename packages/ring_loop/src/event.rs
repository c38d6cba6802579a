//! The reusable slot type stored in an event loop's ring buffer.

use std::any::Any;
use std::fmt;

use crate::event_loop::LoopTask;

/// One slot of an event loop's ring buffer.
///
/// Slots are created once and reused. A producer writes the fields between claiming and
/// publishing; the agent reads them in [`Agent::on_event()`][crate::Agent::on_event]; the loop
/// [`reset()`](Self::reset)s the slot afterwards, before any producer can claim it again.
///
/// The payload is a small fixed set of scalar and object fields so that the common case - a
/// type tag plus a few numbers - needs no heap allocation per event. Anything larger goes into
/// the `obj_*` fields.
///
/// Every value of `kind` belongs to the application. Work the loop sends to itself travels in
/// private fields of the slot and is never shown to the agent.
///
/// # Example
///
/// ```rust
/// use ring_loop::RingEvent;
///
/// let mut event = RingEvent::default();
/// event.kind = 7;
/// event.long_a = 1234;
/// event.obj_a = Some(Box::new(String::from("payload")));
///
/// assert_eq!(event.obj_a_ref::<String>().map(String::as_str), Some("payload"));
///
/// event.reset();
/// assert_eq!(event.kind, 0);
/// assert!(event.obj_a.is_none());
/// ```
#[derive(Default)]
#[expect(
    clippy::struct_field_names,
    reason = "short field names keep producer code compact"
)]
pub struct RingEvent {
    /// Application-defined event type tag.
    pub kind: i32,

    /// First integer field.
    pub int_a: i32,

    /// Second integer field.
    pub int_b: i32,

    /// First long field.
    pub long_a: i64,

    /// Second long field.
    pub long_b: i64,

    /// First object field.
    pub obj_a: Option<Box<dyn Any + Send>>,

    /// Second object field.
    pub obj_b: Option<Box<dyn Any + Send>>,

    /// Work for the loop itself. A slot carrying a task is never delivered to the agent.
    pub(crate) task: Option<LoopTask>,

    /// Set on a claim refused after shutdown began, which is published only to keep the
    /// consumer moving.
    pub(crate) discarded: bool,
}

impl RingEvent {
    /// Clears every field back to its default.
    pub fn reset(&mut self) {
        self.kind = 0;
        self.int_a = 0;
        self.int_b = 0;
        self.long_a = 0;
        self.long_b = 0;
        self.obj_a = None;
        self.obj_b = None;
        self.task = None;
        self.discarded = false;
    }

    /// Borrows `obj_a` as `T`, if present and of that type.
    #[must_use]
    pub fn obj_a_ref<T: Any>(&self) -> Option<&T> {
        self.obj_a.as_deref().and_then(|obj| obj.downcast_ref())
    }

    /// Borrows `obj_b` as `T`, if present and of that type.
    #[must_use]
    pub fn obj_b_ref<T: Any>(&self) -> Option<&T> {
        self.obj_b.as_deref().and_then(|obj| obj.downcast_ref())
    }

    /// Takes `obj_a` out of the slot as `T`.
    ///
    /// Leaves the field untouched and returns `None` if it holds something else.
    pub fn take_obj_a<T: Any>(&mut self) -> Option<Box<T>> {
        take_typed(&mut self.obj_a)
    }

    /// Takes `obj_b` out of the slot as `T`.
    ///
    /// Leaves the field untouched and returns `None` if it holds something else.
    pub fn take_obj_b<T: Any>(&mut self) -> Option<Box<T>> {
        take_typed(&mut self.obj_b)
    }

    /// Whether the slot is loop bookkeeping rather than an application event.
    pub(crate) fn is_internal(&self) -> bool {
        self.task.is_some() || self.discarded
    }
}

fn take_typed<T: Any>(field: &mut Option<Box<dyn Any + Send>>) -> Option<Box<T>> {
    match field.take()?.downcast::<T>() {
        Ok(value) => Some(value),
        Err(other) => {
            *field = Some(other);
            None
        }
    }
}

impl fmt::Debug for RingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingEvent")
            .field("kind", &self.kind)
            .field("int_a", &self.int_a)
            .field("int_b", &self.int_b)
            .field("long_a", &self.long_a)
            .field("long_b", &self.long_b)
            .field("obj_a", &self.obj_a.is_some())
            .field("obj_b", &self.obj_b.is_some())
            .field("task", &self.task.is_some())
            .field("discarded", &self.discarded)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::timer::TimerQueue;

    assert_impl_all!(RingEvent: Send, Default);

    #[test]
    fn take_wrong_type_leaves_field() {
        let mut event = RingEvent {
            obj_b: Some(Box::new(5_u32)),
            ..RingEvent::default()
        };

        assert!(event.take_obj_b::<String>().is_none());
        assert!(event.obj_b.is_some());

        assert_eq!(event.take_obj_b::<u32>().map(|value| *value), Some(5));
        assert!(event.obj_b.is_none());
    }

    #[test]
    fn any_kind_is_an_application_event() {
        for kind in [i32::MIN, -2, -1, 0, 1, i32::MAX] {
            let event = RingEvent {
                kind,
                ..RingEvent::default()
            };
            assert!(!event.is_internal(), "kind {kind} was treated as internal");
        }
    }

    #[test]
    fn reset_clears_internal_markers() {
        let mut event = RingEvent {
            long_b: 9,
            task: Some(Box::new(|_: &mut TimerQueue| {})),
            ..RingEvent::default()
        };
        assert!(event.is_internal());

        event.reset();

        assert_eq!(event.long_b, 0);
        assert!(event.task.is_none());
        assert!(!event.is_internal());

        event.discarded = true;
        assert!(event.is_internal());

        event.reset();
        assert!(!event.is_internal());
    }
}
