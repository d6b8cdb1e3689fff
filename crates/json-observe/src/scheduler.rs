//! Delivery policy, clocks and the deferred task queue.
//!
//! The engine never spawns anything. Batched flushes and grace-window
//! reclamation are pushed onto a [`TaskQueue`] owned by the registry, and the
//! host drains it with [`Registry::run_due_tasks`](crate::Registry::run_due_tasks),
//! using [`Registry::next_deadline`](crate::Registry::next_deadline) to know
//! when to wake up. Both task kinds are self-superseding, so nothing is ever
//! cancelled.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::context::ContextId;
use crate::value::Container;

/// How a context hands pending records to its observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Flush synchronously at the end of every mutating call.
    #[default]
    Immediate,
    /// Coalesce records and flush once after a delay; `None` uses the
    /// configured default.
    Batched(Option<Duration>),
}

impl DeliveryMode {
    pub(crate) fn resolve(self, default_delay: Duration) -> Self {
        match self {
            DeliveryMode::Batched(None) => DeliveryMode::Batched(Some(default_delay)),
            other => other,
        }
    }
}

impl From<bool> for DeliveryMode {
    fn from(batched: bool) -> Self {
        if batched {
            DeliveryMode::Batched(None)
        } else {
            DeliveryMode::Immediate
        }
    }
}

/// Milliseconds; zero falls back to the configured default delay.
impl From<u64> for DeliveryMode {
    fn from(ms: u64) -> Self {
        match ms {
            0 => DeliveryMode::Batched(None),
            ms => DeliveryMode::Batched(Some(Duration::from_millis(ms))),
        }
    }
}

impl From<Duration> for DeliveryMode {
    fn from(delay: Duration) -> Self {
        if delay.is_zero() {
            DeliveryMode::Batched(None)
        } else {
            DeliveryMode::Batched(Some(delay))
        }
    }
}

impl From<Option<u64>> for DeliveryMode {
    fn from(ms: Option<u64>) -> Self {
        ms.map(DeliveryMode::from).unwrap_or_default()
    }
}

// ── Clocks ─────────────────────────────────────────────────────────────────

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

// ── Tasks ──────────────────────────────────────────────────────────────────

pub(crate) enum Task {
    Flush(ContextId),
    Reclaim {
        context: ContextId,
        container: Container,
    },
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Flush(context) => write!(f, "Flush({context})"),
            Task::Reclaim { context, container } => {
                write!(f, "Reclaim({context}, {:?})", container.identity())
            }
        }
    }
}

/// Deadline-ordered queue; tasks with equal deadlines run in schedule order.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    tasks: BTreeMap<(Instant, u64), Task>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn schedule(&mut self, due: Instant, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert((due, seq), task);
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<Task> {
        let (&(due, _), _) = self.tasks.first_key_value()?;
        if due > now {
            return None;
        }
        self.tasks.pop_first().map(|(_, task)| task)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.keys().next().map(|(due, _)| *due)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
