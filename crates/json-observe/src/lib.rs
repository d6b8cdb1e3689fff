//! json-observe: change observation for shared JSON-like object graphs.
//!
//! A [`Registry`] wraps a root [`Container`] in an observation context and
//! hands back a [`Wrapper`]. Reads through a wrapper return wrappers for
//! nested containers; writes and deletes through it are applied to the
//! underlying container and reported to the context's observers as
//! [`ChangeRecord`]s carrying dotted and JSON Pointer paths.
//!
//! One container may be observed by several contexts at once. A mutation
//! made through any of them is reported once in each, with the path that
//! context knows the container by.
//!
//! Delivery is either immediate (end of every mutating call) or batched on a
//! deadline. Deferred work lives on a task queue the host drains with
//! [`Registry::run_due_tasks`]; nothing runs on a background thread.

pub mod config;
pub mod error;
pub mod path;
pub mod record;
pub mod scheduler;
pub mod value;

mod context;
mod engine;
mod identity;
mod registry;
mod wrapper;

pub use config::EngineConfig;
pub use context::{ContextId, Observer};
pub use error::{ConfigError, ObserveError, Result};
pub use path::{escape_component, PathSegment};
pub use record::{ChangeKind, ChangeRecord};
pub use registry::{observer, Registry};
pub use scheduler::{Clock, DeliveryMode, ManualClock, SystemClock};
pub use value::{Access, Container, Identity, Key, Value};
pub use wrapper::Wrapper;

/// Crate version, as published.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
