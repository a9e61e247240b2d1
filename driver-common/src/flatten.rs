//! Recursive decomposition of nested numeric/string containers into
//! `(dotted-name, scalar)` pairs.
//!
//! `serde_json::Value` is a closed enum, so the built-in shapes (scalar,
//! sequence, opaque) dispatch on a plain `ValueKind` match rather than a
//! per-type ancestor walk. Wrapped or tagged values a caller wants treated
//! as scalars (a unit-bearing number serialized as `{"value": 1.0, "unit":
//! "m"}}`, say) aren't representable as a `ValueKind` variant, so detectors
//! for those are registered separately and consulted before the built-in
//! classification.

use std::sync::{Mutex, OnceLock};

use serde_json::Value;

/// Flattens one registered shape under `name`.
pub type FlattenFn = fn(&str, &Value) -> Vec<(String, Value)>;
type DetectFn = fn(&Value) -> bool;

static REGISTRY: OnceLock<Mutex<Vec<(DetectFn, FlattenFn)>>> = OnceLock::new();

fn registry() -> &'static Mutex<Vec<(DetectFn, FlattenFn)>> {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a detector/flattener pair for a value shape the built-in
/// scalar/sequence/opaque classification doesn't handle. Detectors are
/// tried in registration order, ahead of the built-in classification, at
/// every level of recursion (top-level values and sequence entries alike).
pub fn register(detect: DetectFn, flatten_fn: FlattenFn) {
    registry()
        .lock()
        .expect("poisoned flatten registry mutex")
        .push((detect, flatten_fn));
}

fn dispatch_registered(name: &str, value: &Value) -> Option<Vec<(String, Value)>> {
    let registry = registry().lock().expect("poisoned flatten registry mutex");
    registry
        .iter()
        .find(|(detect, _)| detect(value))
        .map(|(_, flatten_fn)| flatten_fn(name, value))
}

/// The closed set of shapes Flatten knows how to recurse into natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Scalar,
    Sequence,
    Opaque,
}

fn classify(value: &Value) -> ValueKind {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => ValueKind::Scalar,
        Value::Array(_) => ValueKind::Sequence,
        Value::Object(_) => ValueKind::Opaque,
    }
}

/// Flatten `value` under `name`, recursing into nested arrays and appending
/// `[i]` to the path at each level (e.g. `x[0][3]`). Scalars flatten to a
/// single `(name, value)` pair; anything else (objects, unknown shapes)
/// flattens to nothing, unless a registered detector claims it.
pub fn flatten(name: &str, value: &Value) -> Vec<(String, Value)> {
    if let Some(flattened) = dispatch_registered(name, value) {
        return flattened;
    }
    match classify(value) {
        ValueKind::Scalar => vec![(name.to_string(), value.clone())],
        ValueKind::Sequence => {
            let mut out = Vec::new();
            flatten_sequence(name, value.as_array().expect("classified as Sequence"), &mut out);
            out
        }
        ValueKind::Opaque => Vec::new(),
    }
}

fn flatten_sequence(name: &str, items: &[Value], out: &mut Vec<(String, Value)>) {
    for (i, entry) in items.iter().enumerate() {
        let path = format!("{name}[{i}]");
        if let Some(flattened) = dispatch_registered(&path, entry) {
            out.extend(flattened);
            continue;
        }
        match classify(entry) {
            ValueKind::Sequence => {
                flatten_sequence(&path, entry.as_array().expect("classified as Sequence"), out)
            }
            ValueKind::Scalar => out.push((path, entry.clone())),
            ValueKind::Opaque => {}
        }
    }
}
