//! JSON value helpers used by the in-memory executor
//!
//! Dotted-path access, equality with numeric widening, and the
//! cross-type ordering used by `$sort`, `$min` and `$max`.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Get a nested value by dotted path
///
/// Numeric segments index into arrays (`"items.0.name"`).
///
/// ```
/// use serde_json::json;
/// use stagecraft_core::value_utils::get_nested_value;
///
/// let doc = json!({"owner": {"address": {"city": "Tehran"}}});
/// assert_eq!(get_nested_value(&doc, "owner.address.city"), Some(&json!("Tehran")));
/// assert_eq!(get_nested_value(&doc, "owner.phone"), None);
/// ```
pub fn get_nested_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return doc.get(path);
    }

    path.split('.').try_fold(doc, |value, part| match value {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Values reachable at `path`, descending into arrays of documents
///
/// `"comments.author"` over `{"comments": [{"author": "a"}, {"author": "b"}]}`
/// yields both authors, the way match conditions see array fields.
pub fn collect_path_values<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    let parts: Vec<&str> = path.split('.').collect();
    collect_into(doc, &parts, &mut out);
    out
}

fn collect_into<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let (head, rest) = match parts.split_first() {
        Some(split) => split,
        None => {
            out.push(value);
            return;
        }
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                collect_into(next, rest, out);
            }
        }
        Value::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(next) = items.get(index) {
                    collect_into(next, rest, out);
                }
            }
            Err(_) => {
                for item in items {
                    collect_into(item, parts, out);
                }
            }
        },
        _ => {}
    }
}

/// Set a value at a dotted path, creating intermediate documents
///
/// ```
/// use serde_json::json;
/// use stagecraft_core::value_utils::set_nested_value;
///
/// let mut doc = json!({"name": "Alice"});
/// set_nested_value(&mut doc, "address.city", json!("NYC"));
/// assert_eq!(doc["address"]["city"], "NYC");
/// ```
pub fn set_nested_value(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut parts = path.split('.').peekable();

    while let Some(part) = parts.next() {
        let map = match current {
            Value::Object(map) => map,
            _ => return,
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        let next = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        current = next;
    }
}

/// Remove and return the value at a dotted path
pub fn remove_nested_value(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.remove(path),
        Some((parent, last)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = current.as_object_mut()?.get_mut(part)?;
            }
            current.as_object_mut()?.remove(last)
        }
    }
}

pub fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Equality where `1` and `1.0` are the same value
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map_or(false, |y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Compare two values of the same kind
///
/// `None` for kinds that do not compare (a string against a number).
///
/// ```
/// use serde_json::json;
/// use std::cmp::Ordering;
/// use stagecraft_core::value_utils::compare_values;
///
/// assert_eq!(compare_values(&json!(10), &json!(5.5)), Some(Ordering::Greater));
/// assert_eq!(compare_values(&json!("a"), &json!(1)), None);
/// ```
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => n1.as_f64()?.partial_cmp(&n2.as_f64()?),
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

// Cross-kind sort order: null < numbers < strings < documents < arrays < booleans
fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over any two values
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    if let Some(ordering) = compare_values(a, b) {
        return ordering;
    }
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => xs
            .iter()
            .zip(ys)
            .map(|(x, y)| total_cmp(x, y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| xs.len().cmp(&ys.len())),
        (Value::Object(_), Value::Object(_)) => canonical_json_string(a).cmp(&canonical_json_string(b)),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// Missing values sort before everything, including null
pub fn compare_values_with_none(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(av), Some(bv)) => total_cmp(av, bv),
    }
}

/// Truthiness of aggregation expressions
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        _ => true,
    }
}

/// JSON text with object keys sorted, so that `{"a":1,"b":2}` and
/// `{"b":2,"a":1}` produce the same string
///
/// Used as the bucket key of `$group` and for `$addToSet` deduplication.
pub fn canonical_json_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let inner = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String((*k).clone()), canonical_json_string(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", inner)
        }
        Value::Array(items) => {
            let inner = items
                .iter()
                .map(canonical_json_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{}]", inner)
        }
        Value::Number(n) => match n.as_f64() {
            // 2 and 2.0 land in the same bucket
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        _ => value.to_string(),
    }
}
