//! Interception engine: reads, writes, deletes, fan-out and reclamation.
//!
//! Everything here runs inside one `RefCell` borrow of [`EngineState`].
//! Mutating calls only enqueue records and remember which contexts they
//! touched; [`EngineState::finish_call`] turns that into dispatches which the
//! caller delivers after releasing the borrow, so observers are free to read
//! and mutate the graph again.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::context::{Context, ContextId, Dispatch};
use crate::error::{ObserveError, Result};
use crate::identity::{IdentityRegistry, Propagation};
use crate::path::{self, PathSegment};
use crate::record::{ChangeKind, ChangeRecord};
use crate::scheduler::{Clock, DeliveryMode, Task, TaskQueue};
use crate::value::{Container, Key, Prop, Value};
use crate::wrapper::Wrapper;

pub(crate) struct EngineState {
    pub config: EngineConfig,
    clock: Rc<dyn Clock>,
    pub identities: IdentityRegistry,
    pub contexts: BTreeMap<ContextId, Context>,
    pub tasks: TaskQueue,
    next_context: u64,
    /// Contexts that received records during the current call, in order.
    touched: Vec<ContextId>,
    this: Weak<RefCell<EngineState>>,
}

impl EngineState {
    pub fn new_shared(config: EngineConfig, clock: Rc<dyn Clock>) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                config,
                clock,
                identities: IdentityRegistry::default(),
                contexts: BTreeMap::new(),
                tasks: TaskQueue::default(),
                next_context: 1,
                touched: Vec::new(),
                this: this.clone(),
            })
        })
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn root_wrapper(&self, context: ContextId) -> Option<Wrapper> {
        self.contexts.get(&context).map(|c| c.root_wrapper.clone())
    }

    // ── Contexts ───────────────────────────────────────────────────────────

    pub fn create_context(&mut self, container: Container, mode: DeliveryMode) -> Wrapper {
        let id = ContextId(self.next_context);
        self.next_context += 1;

        let chain = vec![PathSegment::root(container.clone())];
        let root = self.wrap(&container, id, chain);
        let mode = mode.resolve(self.config.batch_delay());
        self.contexts
            .insert(id, Context::new(id, root.clone(), mode));
        if self.config.previsit {
            self.previsit(&root);
        }
        debug!(context = %id, ?mode, identity = ?container.identity(), "observation context created");
        root
    }

    pub fn remove_context(&mut self, id: ContextId) -> bool {
        let Some(context) = self.contexts.remove(&id) else {
            return false;
        };
        let evicted = self.identities.remove_context(id);
        debug!(
            context = %id,
            evicted,
            dropped_changes = context.pending_len(),
            "observation context removed"
        );
        true
    }

    /// Wraps every container reachable from `root` so that later observation
    /// does not depend on which parts of the graph were read first.
    fn previsit(&mut self, root: &Wrapper) {
        let mut seen = HashSet::new();
        seen.insert(root.target().addr());
        let mut stack = vec![root.clone()];
        while let Some(parent) = stack.pop() {
            for (key, child) in parent.target().children() {
                if !seen.insert(child.addr()) {
                    continue;
                }
                stack.push(self.child_wrapper(&parent, &child, key));
            }
        }
    }

    // ── Wrapper construction ───────────────────────────────────────────────

    fn wrap(&mut self, container: &Container, context: ContextId, chain: Vec<PathSegment>) -> Wrapper {
        if let Some(existing) = self.identities.lookup(container, context) {
            return existing;
        }
        if container.is_list() && self.identities.entry_count(container) == 0 {
            container.set_shadow_len(container.len());
        }
        let wrapper = Wrapper::new(container.clone(), context, chain, self.this.clone());
        self.identities
            .register_entry(container, wrapper.clone(), context);
        trace!(context = %context, path = %wrapper.path(), "wrapper created");
        wrapper
    }

    fn child_wrapper(&mut self, parent: &Wrapper, child: &Container, key: Key) -> Wrapper {
        if let Some(existing) = self.identities.lookup(child, parent.context()) {
            return existing;
        }
        let mut chain = parent.chain().to_vec();
        chain.push(PathSegment {
            container: child.clone(),
            key: Some(key),
        });
        self.wrap(child, parent.context(), chain)
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    pub fn read(&mut self, wrapper: &Wrapper, key: &Key) -> Option<Value> {
        let container = wrapper.target();
        let prop = container.resolve(key).ok()?;
        let value = container.read(&prop)?;
        if !self.contexts.contains_key(&wrapper.context()) {
            return Some(value);
        }
        match value {
            Value::Container(child) => Some(Value::Wrapped(self.child_wrapper(
                wrapper,
                &child,
                prop.key(),
            ))),
            other => Some(other),
        }
    }

    // ── Writes ─────────────────────────────────────────────────────────────

    pub fn write(&mut self, wrapper: &Wrapper, key: &Key, value: Value) -> Result<()> {
        let ctx_id = wrapper.context();
        let Some(changes_paused) = self.contexts.get(&ctx_id).map(|c| c.changes_paused) else {
            return Ok(());
        };
        let container = wrapper.target();
        let value = value.into_stored();
        let prop = container.resolve(key)?;

        let marker = self.identities.propagation(&container).cloned();
        let original = marker.is_none();
        let (kind, previous, orphans) = match marker {
            Some(marker) => (marker.kind, marker.previous, marker.orphans),
            None => {
                let current = container.read(&prop);
                let length_changed =
                    prop == Prop::Length && value.as_length() != Some(container.shadow_len());
                if current.as_ref() == Some(&value) && !length_changed {
                    return Ok(());
                }
                if let Err(err) = container.check_write(&prop, &value) {
                    warn!(context = %ctx_id, property = %prop.name(), %err, "write rejected by storage");
                    return Err(err);
                }
                let kind = if current.is_none() {
                    ChangeKind::Add
                } else {
                    ChangeKind::Update
                };
                let previous = if length_changed {
                    Some(Value::from(container.shadow_len()))
                } else {
                    current.clone()
                };
                let mut orphans: Vec<Container> =
                    current.as_ref().and_then(Value::as_container).into_iter().collect();
                if prop == Prop::Length {
                    orphans.extend(truncated_containers(&container, &value));
                }
                (kind, previous, orphans)
            }
        };

        self.record(wrapper, &prop, kind, value.clone(), previous.clone());

        if original {
            if !changes_paused {
                container.write(&prop, value.clone())?;
                if prop == Prop::Length {
                    if let Some(len) = value.as_length() {
                        container.set_shadow_len(len);
                    }
                }
            }
            let marker = Propagation {
                kind,
                previous,
                orphans: orphans.clone(),
            };
            self.fan_out(wrapper, marker, |state, sibling| {
                state.write(sibling, key, value.clone())
            });
        }

        for orphan in orphans {
            self.consider_reclaim(ctx_id, orphan);
        }
        self.touch(ctx_id);
        Ok(())
    }

    pub fn delete(&mut self, wrapper: &Wrapper, key: &Key) -> Result<()> {
        let ctx_id = wrapper.context();
        let Some(changes_paused) = self.contexts.get(&ctx_id).map(|c| c.changes_paused) else {
            return Ok(());
        };
        let container = wrapper.target();
        let prop = container.resolve(key)?;

        let marker = self.identities.propagation(&container).cloned();
        let original = marker.is_none();
        let (previous, orphans) = match marker {
            Some(marker) => (marker.previous, marker.orphans),
            None => {
                if let Err(err) = container.check_delete(&prop) {
                    warn!(context = %ctx_id, property = %prop.name(), %err, "delete rejected by storage");
                    return Err(err);
                }
                let previous = container.read(&prop);
                let orphans = previous.as_ref().and_then(Value::as_container).into_iter().collect();
                (previous, orphans)
            }
        };

        self.record(wrapper, &prop, ChangeKind::Delete, Value::Null, previous.clone());

        if original {
            if !changes_paused {
                container.remove(&prop)?;
            }
            let marker = Propagation {
                kind: ChangeKind::Delete,
                previous,
                orphans: orphans.clone(),
            };
            self.fan_out(wrapper, marker, |state, sibling| state.delete(sibling, key));
        }

        for orphan in orphans {
            self.consider_reclaim(ctx_id, orphan);
        }
        self.touch(ctx_id);
        Ok(())
    }

    fn record(
        &mut self,
        wrapper: &Wrapper,
        prop: &Prop,
        kind: ChangeKind,
        new_value: Value,
        previous_value: Option<Value>,
    ) {
        let property = prop.name();
        let (dotted_path, pointer_path) = path::property_paths(wrapper.chain(), &property);
        let record = ChangeRecord {
            kind,
            container: wrapper.target(),
            property,
            wrapper: wrapper.clone(),
            new_value,
            previous_value,
            dotted_path,
            pointer_path,
        };
        if let Some(context) = self.contexts.get_mut(&wrapper.context()) {
            context.enqueue(record);
        }
    }

    /// Replays one mutation on every other context wrapping the same
    /// container. The slot marker makes those calls non-original, so they
    /// record without writing or fanning out again.
    fn fan_out(
        &mut self,
        origin: &Wrapper,
        marker: Propagation,
        mut apply: impl FnMut(&mut Self, &Wrapper) -> Result<()>,
    ) {
        let container = origin.target();
        let siblings = self.identities.siblings(&container, origin.context());
        if siblings.is_empty() {
            return;
        }
        self.identities.begin_propagation(&container, marker);
        for sibling in &siblings {
            if let Err(err) = apply(self, sibling) {
                warn!(context = %sibling.context(), %err, "fan-out to sibling context failed");
            }
        }
        self.identities.end_propagation(&container);
    }

    // ── List helpers ───────────────────────────────────────────────────────

    fn require_list(wrapper: &Wrapper, op: &str) -> Result<()> {
        if wrapper.is_list() {
            Ok(())
        } else {
            Err(ObserveError::InvalidKey(op.to_owned()))
        }
    }

    /// Index writes that append outside a helper grow storage without a
    /// `length` record; catch the shadow up before the helper's own records.
    fn sync_shadow(wrapper: &Wrapper) -> usize {
        let container = wrapper.target();
        let len = container.len();
        container.set_shadow_len(len);
        len
    }

    pub fn push(&mut self, wrapper: &Wrapper, value: Value) -> Result<()> {
        Self::require_list(wrapper, "push")?;
        let len = Self::sync_shadow(wrapper);
        self.write(wrapper, &Key::Index(len), value)?;
        self.write(wrapper, &length_key(), Value::from(len + 1))
    }

    pub fn pop(&mut self, wrapper: &Wrapper) -> Result<Option<Value>> {
        Self::require_list(wrapper, "pop")?;
        let len = Self::sync_shadow(wrapper);
        if len == 0 {
            self.write(wrapper, &length_key(), Value::from(0))?;
            return Ok(None);
        }
        let last = wrapper.target().get(len - 1);
        self.delete(wrapper, &Key::Index(len - 1))?;
        self.write(wrapper, &length_key(), Value::from(len - 1))?;
        Ok(last)
    }

    pub fn insert(&mut self, wrapper: &Wrapper, index: usize, value: Value) -> Result<()> {
        Self::require_list(wrapper, "insert")?;
        let container = wrapper.target();
        let len = Self::sync_shadow(wrapper);
        if index > len {
            return Err(ObserveError::IndexOutOfBounds { index, len });
        }
        for k in (index + 1..=len).rev() {
            let moved = container.get(k - 1).unwrap_or_default();
            self.write(wrapper, &Key::Index(k), moved)?;
        }
        self.write(wrapper, &Key::Index(index), value)?;
        self.write(wrapper, &length_key(), Value::from(len + 1))
    }

    pub fn remove(&mut self, wrapper: &Wrapper, index: usize) -> Result<Option<Value>> {
        Self::require_list(wrapper, "remove")?;
        let container = wrapper.target();
        let len = Self::sync_shadow(wrapper);
        if index >= len {
            return Ok(None);
        }
        let removed = container.get(index);
        for k in index..len - 1 {
            let moved = container.get(k + 1).unwrap_or_default();
            self.write(wrapper, &Key::Index(k), moved)?;
        }
        self.delete(wrapper, &Key::Index(len - 1))?;
        self.write(wrapper, &length_key(), Value::from(len - 1))?;
        Ok(removed)
    }

    // ── Notification ───────────────────────────────────────────────────────

    fn touch(&mut self, context: ContextId) {
        if !self.touched.contains(&context) {
            self.touched.push(context);
        }
    }

    /// Ends a mutating call: flushes immediate contexts and schedules
    /// batched ones. The returned dispatches must be delivered after the
    /// engine borrow is released.
    pub fn finish_call(&mut self) -> Vec<Dispatch> {
        let mut out = Vec::new();
        for id in std::mem::take(&mut self.touched) {
            self.notify(id, &mut out);
        }
        out
    }

    fn notify(&mut self, id: ContextId, out: &mut Vec<Dispatch>) {
        let now = self.clock.now();
        let default_delay = self.config.batch_delay();
        let Some(context) = self.contexts.get_mut(&id) else {
            return;
        };
        if context.paused {
            return;
        }
        match context.mode {
            DeliveryMode::Immediate => out.extend(context.take_dispatch()),
            DeliveryMode::Batched(delay) => {
                if !context.flush_scheduled {
                    context.flush_scheduled = true;
                    let due = now + delay.unwrap_or(default_delay);
                    self.tasks.schedule(due, Task::Flush(id));
                }
            }
        }
    }

    pub fn run_task(&mut self, task: Task, out: &mut Vec<Dispatch>) {
        match task {
            Task::Flush(id) => {
                let Some(context) = self.contexts.get_mut(&id) else {
                    return;
                };
                context.flush_scheduled = false;
                if context.paused {
                    return;
                }
                out.extend(context.take_dispatch());
            }
            Task::Reclaim { context, container } => {
                self.reclaim(context, &container);
            }
        }
    }

    // ── Reclamation ────────────────────────────────────────────────────────

    fn consider_reclaim(&mut self, id: ContextId, orphan: Container) {
        let Some(context) = self.contexts.get(&id) else {
            return;
        };
        if reachable(&context.root).contains(&orphan.addr()) {
            trace!(context = %id, identity = ?orphan.identity(), "replaced container still reachable");
            return;
        }
        let due = self.clock.now() + self.config.grace_window();
        debug!(context = %id, identity = ?orphan.identity(), "container orphaned; reclaim scheduled");
        self.tasks.schedule(
            due,
            Task::Reclaim {
                context: id,
                container: orphan,
            },
        );
    }

    /// Evicts `orphan` and everything only reachable through it from the
    /// bookkeeping of context `id`, unless it became reachable again.
    pub fn reclaim(&mut self, id: ContextId, orphan: &Container) -> usize {
        let Some(context) = self.contexts.get(&id) else {
            return 0;
        };
        let live = reachable(&context.root);
        if live.contains(&orphan.addr()) {
            debug!(context = %id, identity = ?orphan.identity(), "orphan reattached; keeping");
            return 0;
        }
        let mut evicted = 0;
        let mut seen = HashSet::new();
        let mut stack = vec![orphan.clone()];
        while let Some(node) = stack.pop() {
            if live.contains(&node.addr()) || !seen.insert(node.addr()) {
                continue;
            }
            if self.identities.evict(&node, id) {
                evicted += 1;
            }
            stack.extend(node.children().into_iter().map(|(_, child)| child));
        }
        debug!(context = %id, evicted, "orphaned subtree reclaimed");
        evicted
    }
}

fn length_key() -> Key {
    Key::from("length")
}

/// Containers a `length` write would cut off the end of a list.
fn truncated_containers(list: &Container, new_len: &Value) -> Vec<Container> {
    let Some(new_len) = new_len.as_length() else {
        return Vec::new();
    };
    list.children()
        .into_iter()
        .filter_map(|(key, child)| match key {
            Key::Index(i) if i >= new_len => Some(child),
            _ => None,
        })
        .collect()
}

/// Addresses of every container reachable from `root`, `root` included.
fn reachable(root: &Container) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(node) = stack.pop() {
        if !seen.insert(node.addr()) {
            continue;
        }
        stack.extend(node.children().into_iter().map(|(_, child)| child));
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reachable_handles_cycles() {
        let root = Container::from_json(&json!({"a": {"b": []}})).unwrap();
        let a = root.get("a").and_then(|v| v.as_container()).unwrap();
        a.set("back", &root).unwrap();
        let live = reachable(&root);
        assert_eq!(live.len(), 3);
        assert!(live.contains(&a.addr()));
    }

    #[test]
    fn truncation_collects_cut_containers() {
        let list = Container::from_json(&json!([{"x": 1}, 2, [3]])).unwrap();
        let cut = truncated_containers(&list, &Value::from(1));
        assert_eq!(cut.len(), 1);
        assert!(cut[0].is_list());
        assert!(truncated_containers(&list, &Value::from("x")).is_empty());
    }
}
