//! Deadline-ordered queue of scheduled work, owned by one loop thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Instant;

use crate::FutureError;

/// Something the timer queue runs when it becomes due.
pub(crate) trait TimerTask: Send {
    /// Runs the task. Returns the next deadline for tasks that want to run again.
    fn run(&mut self) -> Option<Instant>;

    /// Finalizes a task that will never run again (loop shutdown).
    fn abort(&mut self, cause: FutureError);
}

struct Entry {
    deadline: Instant,

    /// Registration order; breaks ties between equal deadlines so they fire first-in-first-out.
    id: u64,

    task: Box<dyn TimerTask>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the earliest (deadline, id) is on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Min-heap of tasks keyed by `(deadline, registration id)`.
///
/// Not thread-safe by design: only the loop thread ever touches it.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds `task` to fire at `deadline`, behind every task already registered for the same
    /// deadline.
    pub(crate) fn push(&mut self, deadline: Instant, task: Box<dyn TimerTask>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.heap.push(Entry { deadline, id, task });
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// The earliest deadline in the queue.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Removes and returns the earliest task if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(Instant, Box<dyn TimerTask>)> {
        if self.heap.peek()?.deadline > now {
            return None;
        }

        self.heap.pop().map(|entry| (entry.deadline, entry.task))
    }

    /// Removes every task, earliest first.
    pub(crate) fn drain(&mut self) -> Vec<Box<dyn TimerTask>> {
        let mut tasks = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            tasks.push(entry.task);
        }
        tasks
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("len", &self.heap.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl TimerTask for Recording {
        fn run(&mut self) -> Option<Instant> {
            self.log.lock().unwrap().push(self.label);
            None
        }

        fn abort(&mut self, _cause: FutureError) {
            self.log.lock().unwrap().push("aborted");
        }
    }

    fn recording(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Box<dyn TimerTask> {
        Box::new(Recording {
            label,
            log: Arc::clone(log),
        })
    }

    fn run_all_due(queue: &mut TimerQueue, now: Instant) {
        while let Some((_, mut task)) = queue.pop_due(now) {
            task.run();
        }
    }

    #[test]
    fn earliest_deadline_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TimerQueue::new();
        let base = Instant::now();

        queue.push(base + Duration::from_millis(30), recording("c", &log));
        queue.push(base + Duration::from_millis(10), recording("a", &log));
        queue.push(base + Duration::from_millis(20), recording("b", &log));

        assert_eq!(queue.next_deadline(), Some(base + Duration::from_millis(10)));

        run_all_due(&mut queue, base + Duration::from_millis(60));

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn equal_deadlines_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TimerQueue::new();
        let deadline = Instant::now();

        for label in ["first", "second", "third", "fourth"] {
            queue.push(deadline, recording(label, &log));
        }

        run_all_due(&mut queue, deadline);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first", "second", "third", "fourth"]
        );
    }

    #[test]
    fn future_deadlines_are_not_due() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TimerQueue::new();
        let now = Instant::now();

        queue.push(now + Duration::from_secs(60), recording("later", &log));

        assert!(queue.pop_due(now).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_empties_queue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TimerQueue::new();
        let now = Instant::now();

        queue.push(now, recording("x", &log));
        queue.push(now + Duration::from_secs(1), recording("y", &log));

        for mut task in queue.drain() {
            task.abort(FutureError::Cancelled);
        }

        assert_eq!(queue.len(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["aborted", "aborted"]);
    }
}
