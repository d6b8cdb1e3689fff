//! Observation contexts and their pending-change queues.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{error, trace};

use crate::record::ChangeRecord;
use crate::scheduler::DeliveryMode;
use crate::value::Container;
use crate::wrapper::Wrapper;

/// Callback receiving every record of one flush, in call order.
pub type Observer = Rc<dyn Fn(&[ChangeRecord])>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

struct Pending {
    record: ChangeRecord,
    /// Enqueued while delivery was paused; dropped at the next flush.
    suppressed: bool,
}

pub(crate) struct Context {
    pub id: ContextId,
    pub root: Container,
    pub root_wrapper: Wrapper,
    pub observers: Vec<Observer>,
    pub paused: bool,
    pub changes_paused: bool,
    pub mode: DeliveryMode,
    pub flush_scheduled: bool,
    pending: Vec<Pending>,
}

impl Context {
    pub fn new(id: ContextId, root_wrapper: Wrapper, mode: DeliveryMode) -> Self {
        Self {
            id,
            root: root_wrapper.target(),
            root_wrapper,
            observers: Vec::new(),
            paused: false,
            changes_paused: false,
            mode,
            flush_scheduled: false,
            pending: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, record: ChangeRecord) {
        trace!(
            context = %self.id,
            kind = %record.kind,
            path = %record.dotted_path,
            "change recorded"
        );
        self.pending.push(Pending {
            record,
            suppressed: self.paused,
        });
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drains the queue. Returns the deliverable records together with a
    /// snapshot of the observer list, or `None` when nothing is left to
    /// deliver.
    pub fn take_dispatch(&mut self) -> Option<Dispatch> {
        let records: Vec<ChangeRecord> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|p| !p.suppressed)
            .map(|p| p.record)
            .collect();
        if records.is_empty() || self.observers.is_empty() {
            return None;
        }
        Some(Dispatch {
            context: self.id,
            observers: self.observers.clone(),
            records,
        })
    }
}

/// Records ready to be handed to observers once no engine borrow is held.
pub(crate) struct Dispatch {
    context: ContextId,
    observers: Vec<Observer>,
    records: Vec<ChangeRecord>,
}

impl Dispatch {
    pub fn deliver(self) {
        trace!(
            context = %self.context,
            records = self.records.len(),
            observers = self.observers.len(),
            "flushing changes"
        );
        for observer in &self.observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer(&self.records)));
            if let Err(payload) = outcome {
                error!(
                    context = %self.context,
                    panic = panic_message(payload.as_ref()),
                    "observer panicked; continuing with remaining observers"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
