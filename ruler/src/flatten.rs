//! Flatten turns a nested record into the evaluation environment
//! conditions run against.

use serde_json::{Map, Value};

/// Flatten returns a new map where nested objects are replaced by
/// dot-delimited keys. Arrays are kept as-is at the leaf; the input
/// is not modified.
pub fn flatten(m: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    walk("", m, &mut out);
    out
}

/// Flatten_value is [`flatten`] for a value known to be an object;
/// anything else flattens to an empty environment.
pub fn flatten_value(v: &Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => flatten(m),
        _ => Map::new(),
    }
}

fn walk(prefix: &str, m: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (k, v) in m {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            Value::Object(child) => walk(&key, child, out),
            _ => {
                out.insert(key, v.clone());
            }
        }
    }
}
