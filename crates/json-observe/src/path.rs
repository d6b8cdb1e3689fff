//! Dotted and JSON Pointer (RFC 6901) paths for tracked containers.
//!
//! Every wrapper carries the chain of segments that led from the context root
//! to its container. The first segment is the root itself and has no key.
//! List positions are re-resolved at formatting time, so a container that
//! moved inside a list (sort, insert, remove) reports where it lives now. A
//! recorded index that still holds the container wins over its first
//! position, which matters when a list holds the same container twice.

use crate::value::{Container, Key};

#[derive(Debug, Clone)]
pub struct PathSegment {
    pub container: Container,
    /// Key used to reach `container` from the previous segment.
    pub key: Option<Key>,
}

impl PathSegment {
    pub(crate) fn root(container: Container) -> Self {
        Self {
            container,
            key: None,
        }
    }
}

/// Escapes a JSON Pointer component: `~` becomes `~0`, `/` becomes `~1`.
pub fn escape_component(component: &str) -> String {
    if !component.contains('/') && !component.contains('~') {
        return component.to_string();
    }
    // Order matters: ~ must be escaped before /
    component.replace('~', "~0").replace('/', "~1")
}

/// Current key components from the root to the last segment of `chain`.
pub fn components(chain: &[PathSegment]) -> Vec<String> {
    let mut out = Vec::with_capacity(chain.len().saturating_sub(1));
    for pair in chain.windows(2) {
        let (parent, seg) = (&pair[0], &pair[1]);
        let Some(key) = &seg.key else {
            continue;
        };
        let component = match key {
            Key::Index(i) if parent.container.is_list() => {
                let still_there = parent
                    .container
                    .get(*i)
                    .and_then(|v| v.as_container())
                    .is_some_and(|c| c.ptr_eq(&seg.container));
                if still_there {
                    i.to_string()
                } else {
                    parent
                        .container
                        .position_of(&seg.container)
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| key.to_string())
                }
            }
            _ => key.to_string(),
        };
        out.push(component);
    }
    out
}

pub fn dotted(components: &[String]) -> String {
    components.join(".")
}

pub fn pointer(components: &[String]) -> String {
    let mut out = String::new();
    for component in components {
        out.push('/');
        out.push_str(&escape_component(component));
    }
    out
}

/// Dotted and pointer paths of `property` on the container at the end of
/// `chain`.
pub(crate) fn property_paths(chain: &[PathSegment], property: &str) -> (String, String) {
    let mut parts = components(chain);
    parts.push(property.to_owned());
    (dotted(&parts), pointer(&parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain_to(root: &Container, keys: &[Key]) -> Vec<PathSegment> {
        let mut chain = vec![PathSegment::root(root.clone())];
        let mut cur = root.clone();
        for key in keys {
            let next = cur.get(key).and_then(|v| v.as_container()).unwrap();
            chain.push(PathSegment {
                container: next.clone(),
                key: Some(key.clone()),
            });
            cur = next;
        }
        chain
    }

    #[test]
    fn nested_object_paths() {
        let root = Container::from_json(&json!({"a": {"b": {"c": 1}}})).unwrap();
        let chain = chain_to(&root, &["a".into(), "b".into()]);
        let (dotted, pointer) = property_paths(&chain, "c");
        assert_eq!(dotted, "a.b.c");
        assert_eq!(pointer, "/a/b/c");
    }

    #[test]
    fn root_property_paths() {
        let root = Container::object();
        let chain = vec![PathSegment::root(root)];
        assert_eq!(property_paths(&chain, "x"), ("x".into(), "/x".into()));
        assert!(components(&chain).is_empty());
    }

    #[test]
    fn pointer_components_are_escaped() {
        assert_eq!(pointer(&["a/b".into(), "m~n".into()]), "/a~1b/m~0n");
        assert_eq!(escape_component("plain"), "plain");
    }

    #[test]
    fn list_positions_follow_relocation() {
        let root = Container::from_json(&json!({"items": [{"id": 1}, {"id": 2}]})).unwrap();
        let chain = chain_to(&root, &["items".into(), Key::Index(1)]);
        assert_eq!(dotted(&components(&chain)), "items.1");

        let items = root.get("items").and_then(|v| v.as_container()).unwrap();
        let second = items.get(1).unwrap();
        let first = items.get(0).unwrap();
        items.set(0, second).unwrap();
        items.set(1, first).unwrap();
        assert_eq!(dotted(&components(&chain)), "items.0");
    }

    #[test]
    fn repeated_list_entry_keeps_its_own_index() {
        let root = Container::from_json(&json!({"items": [{"id": 1}]})).unwrap();
        let items = root.get("items").and_then(|v| v.as_container()).unwrap();
        let entry = items.get(0).unwrap();
        items.set(1, entry).unwrap();

        let second = chain_to(&root, &["items".into(), Key::Index(1)]);
        assert_eq!(property_paths(&second, "id").1, "/items/1/id");
        let first = chain_to(&root, &["items".into(), Key::Index(0)]);
        assert_eq!(property_paths(&first, "id").1, "/items/0/id");

        items.set(1, 0).unwrap();
        assert_eq!(dotted(&components(&second)), "items.0");
    }
}
