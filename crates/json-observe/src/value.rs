//! Shared containers and the values stored in them.
//!
//! A [`Container`] is a reference-counted, interior-mutable map or list.
//! Cloning a container clones the handle, not the data, so one container can
//! be reachable from several places of a graph (and from several graphs).
//! Identity comparisons between containers are pointer comparisons.

use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde_json::Number;

use crate::error::{ObserveError, Result};
use crate::wrapper::Wrapper;

/// Stable identity of a container, assigned the first time it is wrapped.
pub type Identity = u64;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

const LENGTH: &str = "length";

/// Longest list a `length` write may produce.
pub const MAX_LIST_LENGTH: u64 = u32::MAX as u64;

// ── Keys ───────────────────────────────────────────────────────────────────

/// A property name or list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Name(String),
    Index(usize),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(name) => f.write_str(name),
            Key::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

impl From<&String> for Key {
    fn from(name: &String) -> Self {
        Key::Name(name.clone())
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Index(index)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

/// A key resolved against a concrete container kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Prop {
    Field(String),
    Index(usize),
    Length,
}

impl Prop {
    pub(crate) fn name(&self) -> String {
        match self {
            Prop::Field(name) => name.clone(),
            Prop::Index(index) => index.to_string(),
            Prop::Length => LENGTH.to_owned(),
        }
    }

    pub(crate) fn key(&self) -> Key {
        match self {
            Prop::Field(name) => Key::Name(name.clone()),
            Prop::Index(index) => Key::Index(*index),
            Prop::Length => Key::Name(LENGTH.to_owned()),
        }
    }
}

// ── Values ─────────────────────────────────────────────────────────────────

/// A value read from or written into a container.
///
/// Equality follows identity semantics for containers and wrappers (two
/// handles are equal when they point at the same container or wrapper) and
/// value semantics for scalars. Use [`Value::to_json`] for deep comparison.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Container(Container),
    Wrapped(Wrapper),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// `true` for wrappers handed out by a registry.
    pub fn is_wrapper(&self) -> bool {
        matches!(self, Value::Wrapped(_))
    }

    /// `true` for raw containers and wrappers alike.
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Container(_) | Value::Wrapped(_))
    }

    /// The underlying container, looking through a wrapper.
    pub fn as_container(&self) -> Option<Container> {
        match self {
            Value::Container(container) => Some(container.clone()),
            Value::Wrapped(wrapper) => Some(wrapper.target()),
            _ => None,
        }
    }

    pub fn as_wrapper(&self) -> Option<&Wrapper> {
        match self {
            Value::Wrapped(wrapper) => Some(wrapper),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Interprets the value as a list length, up to [`MAX_LIST_LENGTH`].
    pub(crate) fn as_length(&self) -> Option<usize> {
        let Value::Number(n) = self else {
            return None;
        };
        let len = match n.as_u64() {
            Some(u) => u,
            None => match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= MAX_LIST_LENGTH as f64 => f as u64,
                _ => return None,
            },
        };
        if len > MAX_LIST_LENGTH {
            return None;
        }
        usize::try_from(len).ok()
    }

    /// Strips a wrapper down to its container; storage never holds wrappers.
    pub(crate) fn into_stored(self) -> Value {
        match self {
            Value::Wrapped(wrapper) => Value::Container(wrapper.target()),
            other => other,
        }
    }

    /// Builds a fresh value graph from JSON.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::Container(Container::list(
                items.iter().map(Value::from_json),
            )),
            serde_json::Value::Object(map) => Value::Container(Container::object_from(
                map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))),
            )),
        }
    }

    /// Deep snapshot as JSON. A container reached again while it is still
    /// being serialized (a cycle) becomes `null`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut stack = Vec::new();
        self.to_json_inner(&mut stack)
    }

    fn to_json_inner(&self, stack: &mut Vec<usize>) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Container(container) => container.to_json_inner(stack),
            Value::Wrapped(wrapper) => wrapper.target().to_json_inner(stack),
        }
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Container(a), Value::Container(b)) => a.ptr_eq(b),
            (Value::Wrapped(a), Value::Wrapped(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Container(c) => fmt::Debug::fmt(c, f),
            Value::Wrapped(w) => fmt::Debug::fmt(w, f),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Number(Number::from(n))
            }
        })*
    };
}

value_from_int!(i32, i64, u32, u64, usize);

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Container> for Value {
    fn from(c: Container) -> Self {
        Value::Container(c)
    }
}

impl From<&Container> for Value {
    fn from(c: &Container) -> Self {
        Value::Container(c.clone())
    }
}

impl From<Wrapper> for Value {
    fn from(w: Wrapper) -> Self {
        Value::Wrapped(w)
    }
}

impl From<&Wrapper> for Value {
    fn from(w: &Wrapper) -> Self {
        Value::Wrapped(w.clone())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(&json)
    }
}

// ── Containers ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Storage {
    Map(IndexMap<String, Value>),
    List(Vec<Value>),
}

struct ContainerInner {
    identity: OnceCell<Identity>,
    /// Length last reported for a list; lags storage while a host-style
    /// `push` is in flight.
    shadow_len: Cell<usize>,
    frozen: Cell<bool>,
    storage: RefCell<Storage>,
}

/// A shared, mutable map or list.
#[derive(Clone)]
pub struct Container(Rc<ContainerInner>);

impl Container {
    fn from_storage(storage: Storage) -> Self {
        let len = match &storage {
            Storage::Map(map) => map.len(),
            Storage::List(list) => list.len(),
        };
        Self(Rc::new(ContainerInner {
            identity: OnceCell::new(),
            shadow_len: Cell::new(len),
            frozen: Cell::new(false),
            storage: RefCell::new(storage),
        }))
    }

    /// An empty, insertion-ordered map.
    pub fn object() -> Self {
        Self::from_storage(Storage::Map(IndexMap::new()))
    }

    /// An empty list.
    pub fn array() -> Self {
        Self::from_storage(Storage::List(Vec::new()))
    }

    pub fn object_from<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into().into_stored()))
            .collect();
        Self::from_storage(Storage::Map(map))
    }

    pub fn list<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        let list = items.into_iter().map(|v| v.into().into_stored()).collect();
        Self::from_storage(Storage::List(list))
    }

    /// Builds a container graph from a JSON object or array.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        match Value::from_json(json) {
            Value::Container(container) => Ok(container),
            _ => Err(ObserveError::InvalidContainer),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut stack = Vec::new();
        self.to_json_inner(&mut stack)
    }

    fn to_json_inner(&self, stack: &mut Vec<usize>) -> serde_json::Value {
        let addr = self.addr();
        if stack.contains(&addr) {
            return serde_json::Value::Null;
        }
        stack.push(addr);
        let out = match &*self.0.storage.borrow() {
            Storage::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_inner(stack)))
                    .collect(),
            ),
            Storage::List(list) => {
                serde_json::Value::Array(list.iter().map(|v| v.to_json_inner(stack)).collect())
            }
        };
        stack.pop();
        out
    }

    pub fn is_list(&self) -> bool {
        matches!(&*self.0.storage.borrow(), Storage::List(_))
    }

    pub fn len(&self) -> usize {
        match &*self.0.storage.borrow() {
            Storage::Map(map) => map.len(),
            Storage::List(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The identity assigned on first wrap, if any.
    pub fn identity(&self) -> Option<Identity> {
        self.0.identity.get().copied()
    }

    pub(crate) fn assign_identity(&self) -> Identity {
        *self
            .0
            .identity
            .get_or_init(|| NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn ptr_eq(&self, other: &Container) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Makes every later write or delete fail with [`ObserveError::ReadOnly`].
    pub fn freeze(&self) {
        self.0.frozen.set(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    pub(crate) fn shadow_len(&self) -> usize {
        self.0.shadow_len.get()
    }

    pub(crate) fn set_shadow_len(&self, len: usize) {
        self.0.shadow_len.set(len);
    }

    pub(crate) fn resolve(&self, key: &Key) -> Result<Prop> {
        match (&*self.0.storage.borrow(), key) {
            (Storage::Map(_), key) => Ok(Prop::Field(key.to_string())),
            (Storage::List(_), Key::Index(index)) => Ok(Prop::Index(*index)),
            (Storage::List(_), Key::Name(name)) if name == LENGTH => Ok(Prop::Length),
            (Storage::List(_), Key::Name(name)) => name
                .parse::<usize>()
                .map(Prop::Index)
                .map_err(|_| ObserveError::InvalidKey(name.clone())),
        }
    }

    /// Current value at `prop`; `None` when the slot does not exist.
    pub(crate) fn read(&self, prop: &Prop) -> Option<Value> {
        match (&*self.0.storage.borrow(), prop) {
            (Storage::Map(map), Prop::Field(name)) => map.get(name).cloned(),
            (Storage::List(list), Prop::Index(index)) => list.get(*index).cloned(),
            (Storage::List(list), Prop::Length) => Some(Value::from(list.len())),
            _ => None,
        }
    }

    pub(crate) fn check_write(&self, prop: &Prop, value: &Value) -> Result<()> {
        if self.is_frozen() {
            return Err(ObserveError::ReadOnly);
        }
        match (&*self.0.storage.borrow(), prop) {
            (Storage::List(list), Prop::Index(index)) if *index > list.len() => {
                Err(ObserveError::IndexOutOfBounds {
                    index: *index,
                    len: list.len(),
                })
            }
            (Storage::List(_), Prop::Length) if value.as_length().is_none() => {
                Err(ObserveError::InvalidLength)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn write(&self, prop: &Prop, value: Value) -> Result<()> {
        self.check_write(prop, &value)?;
        match (&mut *self.0.storage.borrow_mut(), prop) {
            (Storage::Map(map), Prop::Field(name)) => {
                map.insert(name.clone(), value);
            }
            (Storage::List(list), Prop::Index(index)) => {
                if *index == list.len() {
                    list.push(value);
                } else {
                    list[*index] = value;
                }
            }
            (Storage::List(list), Prop::Length) => {
                let len = value.as_length().ok_or(ObserveError::InvalidLength)?;
                list.resize(len, Value::Null);
            }
            (_, prop) => return Err(ObserveError::InvalidKey(prop.name())),
        }
        Ok(())
    }

    pub(crate) fn check_delete(&self, prop: &Prop) -> Result<()> {
        if self.is_frozen() {
            return Err(ObserveError::ReadOnly);
        }
        match prop {
            Prop::Length => Err(ObserveError::InvalidKey(LENGTH.to_owned())),
            _ => Ok(()),
        }
    }

    /// Removes a map entry, or punches a `Null` hole into a list.
    pub(crate) fn remove(&self, prop: &Prop) -> Result<Option<Value>> {
        self.check_delete(prop)?;
        let removed = match (&mut *self.0.storage.borrow_mut(), prop) {
            (Storage::Map(map), Prop::Field(name)) => map.shift_remove(name),
            (Storage::List(list), Prop::Index(index)) => list
                .get_mut(*index)
                .map(|slot| std::mem::replace(slot, Value::Null)),
            _ => None,
        };
        Ok(removed)
    }

    /// Containers stored directly in this one, in key order.
    pub(crate) fn children(&self) -> Vec<(Key, Container)> {
        match &*self.0.storage.borrow() {
            Storage::Map(map) => map
                .iter()
                .filter_map(|(k, v)| match v {
                    Value::Container(c) => Some((Key::Name(k.clone()), c.clone())),
                    _ => None,
                })
                .collect(),
            Storage::List(list) => list
                .iter()
                .enumerate()
                .filter_map(|(i, v)| match v {
                    Value::Container(c) => Some((Key::Index(i), c.clone())),
                    _ => None,
                })
                .collect(),
        }
    }

    /// First list position holding `child`.
    pub(crate) fn position_of(&self, child: &Container) -> Option<usize> {
        match &*self.0.storage.borrow() {
            Storage::List(list) => list
                .iter()
                .position(|v| matches!(v, Value::Container(c) if c.ptr_eq(child))),
            Storage::Map(_) => None,
        }
    }

    /// Enumerable keys: map keys in insertion order, or list indices.
    pub fn keys(&self) -> Vec<Key> {
        match &*self.0.storage.borrow() {
            Storage::Map(map) => map.keys().map(|k| Key::Name(k.clone())).collect(),
            Storage::List(list) => (0..list.len()).map(Key::Index).collect(),
        }
    }

    /// Unobserved read.
    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        let prop = self.resolve(&key.into()).ok()?;
        self.read(&prop)
    }

    /// Unobserved write. Wrappers are stored as their underlying container.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let prop = self.resolve(&key.into())?;
        self.write(&prop, value.into().into_stored())?;
        self.sync_shadow_len();
        Ok(())
    }

    /// Unobserved delete.
    pub fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let prop = self.resolve(&key.into())?;
        self.remove(&prop)?;
        Ok(())
    }

    /// Unobserved append; fails on maps.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        if !self.is_list() {
            return Err(ObserveError::InvalidKey("push".to_owned()));
        }
        let len = self.len();
        self.set(len, value)
    }

    fn sync_shadow_len(&self) {
        if let Storage::List(list) = &*self.0.storage.borrow() {
            self.0.shadow_len.set(list.len());
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_list() { "list" } else { "object" };
        f.debug_struct("Container")
            .field("kind", &kind)
            .field("identity", &self.identity())
            .field("len", &self.len())
            .finish()
    }
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Container {}

// ── Access capability ──────────────────────────────────────────────────────

/// The read/write surface shared by raw containers and wrappers.
pub trait Access {
    fn get(&self, key: impl Into<Key>) -> Option<Value>;
    fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()>;
    fn delete(&self, key: impl Into<Key>) -> Result<()>;
    fn keys(&self) -> Vec<Key>;
}

impl Access for Container {
    fn get(&self, key: impl Into<Key>) -> Option<Value> {
        Container::get(self, key)
    }

    fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        Container::set(self, key, value)
    }

    fn delete(&self, key: impl Into<Key>) -> Result<()> {
        Container::delete(self, key)
    }

    fn keys(&self) -> Vec<Key> {
        Container::keys(self)
    }
}
