//! Helpers for nested JSON maps.
//!
//! Controller commands are addressed with dotted keys (`"CTRL.freq"`) and must
//! be written to the wire as nested objects (`{"CTRL": {"freq": 256}}`).

use serde_json::{Map, Value};

/// Splits a dotted key into its path segments, ignoring empty segments.
pub fn split_path(key: &str) -> Vec<&str> {
    key.split('.').filter(|s| !s.is_empty()).collect()
}

/// Looks up the value at `path`, or `None` if any level is missing or not an object.
pub fn deep_get<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(root, |node, segment| node.as_object()?.get(*segment))
}

/// Sets `value` at `path`, creating intermediate objects as needed.
///
/// A non-object value found on the way is replaced by an object. An empty path
/// leaves the map unchanged.
pub fn deep_set(root: &mut Map<String, Value>, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        let entry = node
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        node = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
    node.insert(last.to_string(), value);
}

/// Builds a nested object from a dotted key and a leaf value.
pub fn expand(key: &str, value: Value) -> Value {
    let mut root = Map::new();
    deep_set(&mut root, &split_path(key), value);
    Value::Object(root)
}
