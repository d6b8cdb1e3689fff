//! Public entry point: observation contexts over shared container graphs.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::context::{Context, Observer};
use crate::engine::EngineState;
use crate::error::{ObserveError, Result};
use crate::record::ChangeRecord;
use crate::scheduler::{Clock, DeliveryMode, SystemClock};
use crate::value::{Container, Value};
use crate::wrapper::Wrapper;

/// Boxes a closure as an [`Observer`].
pub fn observer(f: impl Fn(&[ChangeRecord]) + 'static) -> Observer {
    Rc::new(f)
}

/// Owns every observation context, the identity bookkeeping they share and
/// the deferred task queue.
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use json_observe::{observer, Container, Registry};
/// use serde_json::json;
///
/// let registry = Registry::new();
/// let doc = Container::from_json(&json!({"a": {"b": {"c": 1}}})).unwrap();
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let sink = Rc::clone(&seen);
/// let root = registry
///     .create(&doc, false, Some(observer(move |changes| {
///         sink.borrow_mut().extend(changes.iter().map(|c| c.pointer_path.clone()));
///     })))
///     .unwrap();
///
/// let b = root.get("a").unwrap().as_wrapper().unwrap().get("b").unwrap();
/// b.as_wrapper().unwrap().set("c", 2).unwrap();
/// assert_eq!(*seen.borrow(), ["/a/b/c"]);
/// ```
pub struct Registry {
    state: Rc<RefCell<EngineState>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    pub fn with_clock(config: EngineConfig, clock: impl Clock + 'static) -> Self {
        Self {
            state: EngineState::new_shared(config, Rc::new(clock)),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.state.borrow().config.clone()
    }

    /// Starts observing `container` in a new context and returns its root
    /// wrapper. A wrapper is accepted and observed through its container.
    pub fn create(
        &self,
        container: impl Into<Value>,
        delivery: impl Into<DeliveryMode>,
        observer: Option<Observer>,
    ) -> Result<Wrapper> {
        let container: Container = container
            .into()
            .as_container()
            .ok_or(ObserveError::InvalidContainer)?;
        let mut state = self.state.borrow_mut();
        let root = state.create_context(container, delivery.into());
        if let Some(observer) = observer {
            if let Some(context) = state.contexts.get_mut(&root.context()) {
                context.observers.push(observer);
            }
        }
        Ok(root)
    }

    /// Adds an observer to the context owning `root`.
    pub fn observe(&self, root: &Wrapper, f: impl Fn(&[ChangeRecord]) + 'static) -> Result<()> {
        self.with_context(root, |context| context.observers.push(Rc::new(f)))
    }

    /// Stops delivering records to observers; mutations still apply.
    pub fn pause(&self, root: &Wrapper) -> Result<()> {
        self.with_context(root, |context| context.paused = true)
    }

    pub fn resume(&self, root: &Wrapper) -> Result<()> {
        self.with_context(root, |context| context.paused = false)
    }

    /// Stops writing through this context; mutations are still recorded.
    pub fn pause_changes(&self, root: &Wrapper) -> Result<()> {
        self.with_context(root, |context| context.changes_paused = true)
    }

    pub fn resume_changes(&self, root: &Wrapper) -> Result<()> {
        self.with_context(root, |context| context.changes_paused = false)
    }

    /// Tears down the context owning `root`. Returns `false` if it was not
    /// registered.
    pub fn remove(&self, root: &Wrapper) -> bool {
        let mut state = self.state.borrow_mut();
        let owns = state
            .root_wrapper(root.context())
            .is_some_and(|r| r.ptr_eq(root));
        owns && state.remove_context(root.context())
    }

    /// Records waiting in the context owning `root`.
    pub fn pending_changes(&self, root: &Wrapper) -> Result<usize> {
        self.with_context(root, |context| context.pending_len())
    }

    /// Runs every deferred task whose deadline has passed and delivers the
    /// resulting flushes. Returns how many tasks ran.
    pub fn run_due_tasks(&self) -> usize {
        let mut ran = 0;
        loop {
            let dispatches = {
                let mut state = self.state.borrow_mut();
                let now = state.now();
                let Some(task) = state.tasks.pop_due(now) else {
                    break;
                };
                let mut out = Vec::new();
                state.run_task(task, &mut out);
                out
            };
            for dispatch in dispatches {
                dispatch.deliver();
            }
            ran += 1;
        }
        ran
    }

    /// Deadline of the earliest deferred task.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.borrow().tasks.next_deadline()
    }

    pub fn pending_tasks(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    /// Number of live contexts.
    pub fn contexts(&self) -> usize {
        self.state.borrow().contexts.len()
    }

    /// `true` while at least one context holds a wrapper for `container`.
    pub fn is_tracked(&self, container: &Container) -> bool {
        self.state.borrow().identities.is_active(container)
    }

    /// Number of wrappers (one per context) held for `container`.
    pub fn tracked_wrappers(&self, container: &Container) -> usize {
        self.state.borrow().identities.entry_count(container)
    }

    /// Number of containers with at least one live wrapper.
    pub fn tracked_containers(&self) -> usize {
        self.state.borrow().identities.active_slots()
    }

    fn with_context<R>(&self, root: &Wrapper, f: impl FnOnce(&mut Context) -> R) -> Result<R> {
        let mut state = self.state.borrow_mut();
        match state.contexts.get_mut(&root.context()) {
            Some(context) if context.root_wrapper.ptr_eq(root) => Ok(f(context)),
            _ => Err(ObserveError::ContextNotFound),
        }
    }
}
