//! The interception handle standing in for one container in one context.
//!
//! All reads, writes and deletes go through the owning registry's engine so
//! nested containers come back wrapped (and cached) and every mutation is
//! recorded. A wrapper whose context was removed, or whose registry was
//! dropped, degrades to plain reads and ignores mutations.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::context::ContextId;
use crate::engine::EngineState;
use crate::error::Result;
use crate::path::{self, PathSegment};
use crate::value::{Access, Container, Key, Value};

struct WrapperInner {
    container: Container,
    context: ContextId,
    chain: Vec<PathSegment>,
    engine: Weak<RefCell<EngineState>>,
}

#[derive(Clone)]
pub struct Wrapper(Rc<WrapperInner>);

impl Wrapper {
    pub(crate) fn new(
        container: Container,
        context: ContextId,
        chain: Vec<PathSegment>,
        engine: Weak<RefCell<EngineState>>,
    ) -> Self {
        Self(Rc::new(WrapperInner {
            container,
            context,
            chain,
            engine,
        }))
    }

    /// The underlying container.
    pub fn target(&self) -> Container {
        self.0.container.clone()
    }

    pub fn context(&self) -> ContextId {
        self.0.context
    }

    pub(crate) fn chain(&self) -> &[PathSegment] {
        &self.0.chain
    }

    /// Dotted path from the context root; empty for the root itself.
    pub fn path(&self) -> String {
        path::dotted(&path::components(&self.0.chain))
    }

    /// JSON Pointer from the context root; empty for the root itself.
    pub fn pointer(&self) -> String {
        path::pointer(&path::components(&self.0.chain))
    }

    /// The wrapper `depth` levels up the logical path, resolved from the
    /// context root. `parent(0)` resolves this wrapper's own path.
    pub fn parent(&self, depth: usize) -> Option<Wrapper> {
        let components = path::components(&self.0.chain);
        let keep = components.len().checked_sub(depth)?;
        let root = {
            let engine = self.0.engine.upgrade()?;
            let state = engine.borrow();
            state.root_wrapper(self.0.context)?
        };
        let mut cur = root;
        for component in &components[..keep] {
            let next = cur.get(component.as_str())?;
            cur = next.as_wrapper()?.clone();
        }
        Some(cur)
    }

    pub fn ptr_eq(&self, other: &Wrapper) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_list(&self) -> bool {
        self.0.container.is_list()
    }

    pub fn len(&self) -> usize {
        self.0.container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.container.is_empty()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.0.container.keys()
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.0.container.to_json()
    }

    /// Reads `key`; nested containers come back as cached wrappers.
    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        match self.0.engine.upgrade() {
            Some(engine) => engine.borrow_mut().read(self, &key),
            None => self.0.container.get(key),
        }
    }

    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.call(|state, this| state.write(this, &key, value))
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        self.call(|state, this| state.delete(this, &key))
    }

    /// Appends like a host array `push`: records the new index, then `length`.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.call(|state, this| state.push(this, value))
    }

    /// Removes the last element: records its deletion, then `length`.
    pub fn pop(&self) -> Result<Option<Value>> {
        self.call(|state, this| state.pop(this))
    }

    /// Inserts at `index`, shifting the tail up one slot at a time.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.call(|state, this| state.insert(this, index, value))
    }

    /// Removes the element at `index`, shifting the tail down.
    pub fn remove(&self, index: usize) -> Result<Option<Value>> {
        self.call(|state, this| state.remove(this, index))
    }

    /// Shortens the list to `len` elements with a single `length` record.
    pub fn truncate(&self, len: usize) -> Result<()> {
        self.call(|state, this| {
            if len < this.len() {
                state.write(this, &Key::from("length"), Value::from(len))
            } else {
                Ok(())
            }
        })
    }

    /// Runs one mutating call against the engine and delivers whatever it
    /// flushed once the engine borrow is released.
    fn call<R: Default>(&self, f: impl FnOnce(&mut EngineState, &Wrapper) -> Result<R>) -> Result<R> {
        let Some(engine) = self.0.engine.upgrade() else {
            return Ok(R::default());
        };
        let (result, dispatches) = {
            let mut state = engine.borrow_mut();
            let result = f(&mut state, self);
            (result, state.finish_call())
        };
        for dispatch in dispatches {
            dispatch.deliver();
        }
        result
    }
}

impl PartialEq for Wrapper {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Wrapper {}

impl fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapper")
            .field("context", &self.0.context)
            .field("identity", &self.0.container.identity())
            .field("path", &self.path())
            .finish()
    }
}

impl Access for Wrapper {
    fn get(&self, key: impl Into<Key>) -> Option<Value> {
        Wrapper::get(self, key)
    }

    fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        Wrapper::set(self, key, value)
    }

    fn delete(&self, key: impl Into<Key>) -> Result<()> {
        Wrapper::delete(self, key)
    }

    fn keys(&self) -> Vec<Key> {
        Wrapper::keys(self)
    }
}
