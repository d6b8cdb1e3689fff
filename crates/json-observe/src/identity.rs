//! Identity registry: container identity -> wrappers per context.
//!
//! Slots are keyed by [`Identity`], which lives on the container itself and
//! is never reused, so a slot can never be confused with a container that
//! happened to be allocated at a recycled address. Slots hold no strong
//! reference of their own; the wrappers in their entries do.

use std::collections::HashMap;

use crate::context::ContextId;
use crate::record::ChangeKind;
use crate::value::{Container, Identity, Value};
use crate::wrapper::Wrapper;

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub wrapper: Wrapper,
    pub context: ContextId,
}

/// Set on a slot while one write fans out to the sibling contexts. Carries
/// what the originating call observed before storage changed.
#[derive(Debug, Clone)]
pub(crate) struct Propagation {
    pub kind: ChangeKind,
    pub previous: Option<Value>,
    /// Containers the mutation detached from the graph.
    pub orphans: Vec<Container>,
}

#[derive(Debug, Default)]
struct Slot {
    entries: Vec<Entry>,
    propagating: Option<Propagation>,
}

impl Slot {
    fn is_dead(&self) -> bool {
        self.entries.is_empty() && self.propagating.is_none()
    }
}

/// A slot lives exactly as long as it has entries or an in-flight
/// propagation; identities are never reused, so a dead slot is dropped.
#[derive(Debug, Default)]
pub(crate) struct IdentityRegistry {
    slots: HashMap<Identity, Slot>,
}

impl IdentityRegistry {
    pub fn assign_identity(&mut self, container: &Container) -> Identity {
        container.assign_identity()
    }

    pub fn register_entry(&mut self, container: &Container, wrapper: Wrapper, context: ContextId) {
        let id = self.assign_identity(container);
        let slot = self.slots.entry(id).or_default();
        slot.entries.push(Entry { wrapper, context });
    }

    pub fn lookup(&self, container: &Container, context: ContextId) -> Option<Wrapper> {
        let slot = self.slots.get(&container.identity()?)?;
        slot.entries
            .iter()
            .find(|e| e.context == context)
            .map(|e| e.wrapper.clone())
    }

    /// Wrappers of `container` in every context other than `context`, in
    /// registration order.
    pub fn siblings(&self, container: &Container, context: ContextId) -> Vec<Wrapper> {
        container
            .identity()
            .and_then(|id| self.slots.get(&id))
            .map(|slot| {
                slot.entries
                    .iter()
                    .filter(|e| e.context != context)
                    .map(|e| e.wrapper.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops the entry of `context`; an emptied slot is released.
    pub fn evict(&mut self, container: &Container, context: ContextId) -> bool {
        let Some(id) = container.identity() else {
            return false;
        };
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        let before = slot.entries.len();
        slot.entries.retain(|e| e.context != context);
        let removed = slot.entries.len() != before;
        if slot.is_dead() {
            self.slots.remove(&id);
        }
        removed
    }

    /// Drops every entry of `context`, returning how many were removed.
    pub fn remove_context(&mut self, context: ContextId) -> usize {
        let mut removed = 0;
        self.slots.retain(|_, slot| {
            let before = slot.entries.len();
            slot.entries.retain(|e| e.context != context);
            removed += before - slot.entries.len();
            !slot.is_dead()
        });
        removed
    }

    pub fn propagation(&self, container: &Container) -> Option<&Propagation> {
        let slot = self.slots.get(&container.identity()?)?;
        slot.propagating.as_ref()
    }

    /// Marks a tracked container as fanning out. Untracked containers have no
    /// siblings to protect, so nothing is recorded for them.
    pub fn begin_propagation(&mut self, container: &Container, marker: Propagation) {
        if let Some(slot) = container.identity().and_then(|id| self.slots.get_mut(&id)) {
            slot.propagating = Some(marker);
        }
    }

    pub fn end_propagation(&mut self, container: &Container) {
        let Some(id) = container.identity() else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.propagating = None;
            if slot.is_dead() {
                self.slots.remove(&id);
            }
        }
    }

    pub fn entry_count(&self, container: &Container) -> usize {
        container
            .identity()
            .and_then(|id| self.slots.get(&id))
            .map(|slot| slot.entries.len())
            .unwrap_or(0)
    }

    pub fn is_active(&self, container: &Container) -> bool {
        container
            .identity()
            .and_then(|id| self.slots.get(&id))
            .is_some_and(|slot| !slot.entries.is_empty())
    }

    pub fn active_slots(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| !slot.entries.is_empty())
            .count()
    }

    /// Slots held in the table, live or mid-propagation.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathSegment;
    use std::rc::Weak;

    fn detached_wrapper(container: &Container, context: ContextId) -> Wrapper {
        Wrapper::new(
            container.clone(),
            context,
            vec![PathSegment::root(container.clone())],
            Weak::new(),
        )
    }

    #[test]
    fn assign_is_idempotent() {
        let mut registry = IdentityRegistry::default();
        let c = Container::object();
        let id = registry.assign_identity(&c);
        assert_eq!(registry.assign_identity(&c), id);
        assert!(!registry.is_active(&c));
    }

    #[test]
    fn lookup_is_per_context() {
        let mut registry = IdentityRegistry::default();
        let c = Container::object();
        let w1 = detached_wrapper(&c, ContextId(1));
        let w2 = detached_wrapper(&c, ContextId(2));
        registry.register_entry(&c, w1.clone(), ContextId(1));
        registry.register_entry(&c, w2.clone(), ContextId(2));

        assert_eq!(registry.lookup(&c, ContextId(1)), Some(w1.clone()));
        assert_eq!(registry.lookup(&c, ContextId(3)), None);
        assert_eq!(registry.siblings(&c, ContextId(1)), vec![w2]);
        assert_eq!(registry.entry_count(&c), 2);
    }

    #[test]
    fn evicting_last_entry_releases_slot() {
        let mut registry = IdentityRegistry::default();
        let c = Container::list([1]);
        registry.register_entry(&c, detached_wrapper(&c, ContextId(7)), ContextId(7));
        assert!(registry.is_active(&c));
        assert!(registry.evict(&c, ContextId(7)));
        assert!(!registry.evict(&c, ContextId(7)));
        assert!(!registry.is_active(&c));
        assert_eq!(registry.active_slots(), 0);
        assert_eq!(registry.slot_count(), 0);
        assert!(c.identity().is_some());
    }

    #[test]
    fn remove_context_sweeps_all_slots() {
        let mut registry = IdentityRegistry::default();
        let a = Container::object();
        let b = Container::object();
        registry.register_entry(&a, detached_wrapper(&a, ContextId(1)), ContextId(1));
        registry.register_entry(&b, detached_wrapper(&b, ContextId(1)), ContextId(1));
        registry.register_entry(&b, detached_wrapper(&b, ContextId(2)), ContextId(2));
        assert_eq!(registry.remove_context(ContextId(1)), 2);
        assert!(!registry.is_active(&a));
        assert!(registry.is_active(&b));
        assert_eq!(registry.slot_count(), 1);
    }

    #[test]
    fn slot_survives_eviction_while_propagating() {
        let mut registry = IdentityRegistry::default();
        let c = Container::object();
        registry.register_entry(&c, detached_wrapper(&c, ContextId(1)), ContextId(1));
        registry.begin_propagation(
            &c,
            Propagation {
                kind: ChangeKind::Add,
                previous: None,
                orphans: Vec::new(),
            },
        );

        registry.evict(&c, ContextId(1));
        assert_eq!(registry.slot_count(), 1);
        assert!(registry.propagation(&c).is_some());

        registry.end_propagation(&c);
        assert_eq!(registry.slot_count(), 0);
        assert!(registry.propagation(&c).is_none());
    }

    #[test]
    fn propagation_on_untracked_container_leaves_no_slot() {
        let mut registry = IdentityRegistry::default();
        let c = Container::object();
        registry.assign_identity(&c);
        registry.begin_propagation(
            &c,
            Propagation {
                kind: ChangeKind::Update,
                previous: None,
                orphans: Vec::new(),
            },
        );
        assert!(registry.propagation(&c).is_none());
        assert_eq!(registry.slot_count(), 0);
    }
}
