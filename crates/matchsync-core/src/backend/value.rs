//! JSON field access and ordering helpers shared by backends.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::FieldPath;

pub(crate) fn get_path<'a>(data: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(data, |current, segment| current.as_object()?.get(segment))
}

/// Set a nested field, creating intermediate objects as needed.
pub(crate) fn set_path(data: &mut Value, path: &FieldPath, value: Value) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = data;
    for segment in parents {
        current = object_mut(current)
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    object_mut(current).insert(last.clone(), value);
}

pub(crate) fn remove_path(data: &mut Value, path: &FieldPath) {
    let Some((last, parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = data;
    for segment in parents {
        match current.as_object_mut().and_then(|obj| obj.get_mut(segment)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(obj) = current.as_object_mut() {
        obj.remove(last);
    }
}

fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over sort keys: null < bool < number < string; arrays and
/// objects compare equal within their type.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(0.0);
                let y = y.as_f64().unwrap_or(0.0);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
