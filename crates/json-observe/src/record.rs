//! Change records handed to observers, one per intercepted mutation.

use std::fmt;

use serde::Serialize;

use crate::value::{Container, Value};
use crate::wrapper::Wrapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        })
    }
}

/// One detected mutation, as delivered to observers.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    /// The raw container that was (or, with changes paused, would have been)
    /// mutated.
    pub container: Container,
    pub property: String,
    /// The wrapper of `container` in the receiving context.
    pub wrapper: Wrapper,
    /// `Null` for deletes.
    pub new_value: Value,
    pub previous_value: Option<Value>,
    pub dotted_path: String,
    pub pointer_path: String,
}

impl ChangeRecord {
    /// Compact JSON summary, handy for logging and assertions.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "property": self.property,
            "newValue": self.new_value.to_json(),
            "previousValue": self.previous_value.as_ref().map(Value::to_json),
            "path": self.dotted_path,
            "pointer": self.pointer_path,
        })
    }
}
