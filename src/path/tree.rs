//! In-memory tree operations over `serde_json::Value`
//!
//! Adapters that hold (part of) the tree in memory use these helpers to
//! address, mutate and flatten nested values. Numeric segments index into
//! lists; every other segment addresses a map key.

use super::Path;
use crate::core::error::{Error, Result};
use serde_json::{Map, Number, Value};

/// Human-readable type name for diagnostics
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// True for maps and lists
pub fn is_composite(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

/// Borrow the value at `path`, if present
pub fn get_in<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutably borrow the value at `path`, if present
pub fn get_in_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate maps and replacing any
/// scalar found on the way. An empty path replaces the root.
///
/// A numeric segment under a list may address an existing element or append
/// one at the end; anything further out is rejected.
pub fn set_in(root: &mut Value, path: &[String], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut current = root;
    for segment in parents {
        current = descend(current, segment)?;
    }
    place(current, last, value)
}

/// Index of `segment` in `items`, allowing one past the end for appends
fn list_slot(items: &mut Vec<Value>, segment: &str) -> Result<Option<usize>> {
    let Ok(i) = segment.parse::<usize>() else {
        return Ok(None);
    };
    if i > items.len() {
        return Err(Error::invalid_input(format!(
            "list index {} is past the end of a list of {}",
            i,
            items.len()
        )));
    }
    if i == items.len() {
        items.push(Value::Null);
    }
    Ok(Some(i))
}

fn descend<'a>(node: &'a mut Value, segment: &str) -> Result<&'a mut Value> {
    let index = match node {
        Value::Array(items) => list_slot(items, segment)?,
        _ => None,
    };
    if index.is_none() && !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let slot = match (node, index) {
        (Value::Array(items), Some(i)) => &mut items[i],
        (Value::Object(map), _) => map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new())),
        (other, _) => return Ok(other),
    };
    if !is_composite(slot) {
        *slot = Value::Object(Map::new());
    }
    Ok(slot)
}

fn place(node: &mut Value, segment: &str, value: Value) -> Result<()> {
    if let Value::Array(items) = node {
        if let Some(i) = list_slot(items, segment)? {
            items[i] = value;
            return Ok(());
        }
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(segment.to_string(), value);
    }
    Ok(())
}

/// Remove and return the value at `path`. Removing the root leaves an empty map.
pub fn delete_in(root: &mut Value, path: &[String]) -> Option<Value> {
    let Some((last, parents)) = path.split_last() else {
        return Some(std::mem::replace(root, Value::Object(Map::new())));
    };
    match get_in_mut(root, parents)? {
        Value::Object(map) => map.remove(last),
        Value::Array(items) => {
            let i = last.parse::<usize>().ok()?;
            (i < items.len()).then(|| items.remove(i))
        }
        _ => None,
    }
}

/// Flatten a value into `(path, leaf)` pairs below `base`.
///
/// Non-empty maps are walked; scalars, lists and empty maps are leaves.
pub fn flatten_leaves(base: &Path, value: &Value) -> Vec<(Path, Value)> {
    let mut out = Vec::new();
    collect_leaves(base.clone(), value, &mut out);
    out
}

fn collect_leaves(path: Path, value: &Value, out: &mut Vec<(Path, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                collect_leaves(path.child(key), child, out);
            }
        }
        leaf => out.push((path, leaf.clone())),
    }
}

/// Rebuild a nested map from `(relative path, leaf)` pairs
pub fn unflatten<I>(leaves: I) -> Result<Value>
where
    I: IntoIterator<Item = (Path, Value)>,
{
    let mut root = Value::Object(Map::new());
    for (path, leaf) in leaves {
        set_in(&mut root, path.segments(), leaf)?;
    }
    Ok(root)
}

/// Add `delta` to the number at a location; a missing value counts as zero.
///
/// Integer arithmetic is kept while both sides are integers and the sum fits.
pub fn add_numbers(current: Option<&Value>, delta: &Number, path: &Path) -> Result<Value> {
    let base = match current {
        None | Some(Value::Null) => return Ok(Value::Number(delta.clone())),
        Some(Value::Number(n)) => n,
        Some(other) => return Err(Error::type_mismatch(path.to_string(), "number", type_name(other))),
    };
    if let (Some(a), Some(b)) = (base.as_i64(), delta.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::from(sum));
        }
    }
    let sum = base.as_f64().unwrap_or(0.0) + delta.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| Error::invalid_input(format!("Non-finite result at {}", path)))
}

/// Arithmetic negation of a JSON number
pub fn negate(n: &Number) -> Number {
    if let Some(neg) = n.as_i64().and_then(i64::checked_neg) {
        return Number::from(neg);
    }
    n.as_f64()
        .and_then(|f| Number::from_f64(-f))
        .unwrap_or_else(|| n.clone())
}

/// Keys of a map, or stringified indexes of a list
pub fn keys_of(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Children of a map or list
pub fn values_of(value: &Value) -> Vec<Value> {
    match value {
        Value::Object(map) => map.values().cloned().collect(),
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    }
}

/// `(key, child)` pairs of a map or list
pub fn entries_of(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Key count of a map, element count of a list, zero otherwise
pub fn len_of(value: &Value) -> usize {
    match value {
        Value::Object(map) => map.len(),
        Value::Array(items) => items.len(),
        _ => 0,
    }
}
