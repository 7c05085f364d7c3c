use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Result;

pub type TimerCallback = Box<dyn FnOnce() -> Result<()>>;

type Slot = Rc<RefCell<Option<TimerCallback>>>;

/// When a timeout should fire: at an absolute instant, or relative to the
/// moment it is scheduled. Relative deadlines are converted to absolute on
/// insertion, against the monotonic clock.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    At(Instant),
    In(Duration),
}

impl Deadline {
    pub(crate) fn resolve(self, now: Instant) -> Instant {
        match self {
            Deadline::At(at) => at,
            Deadline::In(dur) => now + dur,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Deadline {
        Deadline::At(at)
    }
}

impl From<Duration> for Deadline {
    fn from(dur: Duration) -> Deadline {
        Deadline::In(dur)
    }
}

/// Cancellation handle returned by `add_timeout`.
///
/// Cancelling clears the callback slot; the heap entry stays behind and is
/// discarded when it bubbles up to the root.
pub struct TimeoutHandle {
    slot: Slot,
}

impl TimeoutHandle {
    pub fn cancel(&self) {
        self.slot.borrow_mut().take();
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    slot: Slot,
}

// Reversed so that the std max-heap yields the earliest (deadline, seq)
// first. Equal deadlines fire in insertion order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// What the reactor should do next with the timer heap.
pub(crate) enum TimerStep {
    /// Nothing pending.
    Idle,
    /// A due entry was popped; run its callback.
    Run(TimerCallback),
    /// The earliest live entry is in the future; wait at most until then.
    WaitUntil(Instant),
}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn add(&mut self, deadline: Deadline, callback: TimerCallback) -> TimeoutHandle {
        let seq = self.seq;
        self.seq += 1;

        let slot: Slot = Rc::new(RefCell::new(Some(callback)));

        self.heap.push(TimerEntry {
            deadline: deadline.resolve(Instant::now()),
            seq,
            slot: slot.clone(),
        });

        TimeoutHandle { slot }
    }

    /// Pop cancelled entries off the root, then either hand out the next
    /// due callback or report how long the reactor may sleep.
    pub fn step(&mut self, now: Instant) -> TimerStep {
        while let Some(top) = self.heap.peek() {
            if top.slot.borrow().is_none() {
                // Cancelled; lazily dropped now that it reached the root.
                self.heap.pop();
                continue;
            }

            if top.deadline > now {
                return TimerStep::WaitUntil(top.deadline);
            }

            let entry = self.heap.pop().expect("peeked entry vanished");
            let taken = entry.slot.borrow_mut().take();
            match taken {
                Some(callback) => return TimerStep::Run(callback),
                None => continue,
            }
        }

        TimerStep::Idle
    }
}
