//! Nested document flattening.
//!
//! Objects are walked recursively and their leaves keyed by the dot-joined
//! path (`total.amount`). Arrays are leaves. MongoDB extended-JSON wrappers
//! such as `{"$oid": "..."}` are unwrapped to their plain value first, so
//! `_id` flattens to a string rather than `_id.$oid`.

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

pub const SEPARATOR: char = '.';

/// Flattened view of a document: dot-joined key to leaf value, in document order.
pub type FlatDocument = IndexMap<String, Value>;

pub fn flatten(document: &Map<String, Value>) -> FlatDocument {
    let mut flat = FlatDocument::with_capacity(document.len());
    flatten_into(document, None, &mut flat);
    flat
}

fn flatten_into(object: &Map<String, Value>, prefix: Option<&str>, out: &mut FlatDocument) {
    for (key, value) in object {
        let path = match prefix {
            Some(prefix) => format!("{prefix}{SEPARATOR}{key}"),
            None => key.clone(),
        };
        match unwrap_extended(value) {
            Value::Object(inner) if !inner.is_empty() => flatten_into(&inner, Some(&path), out),
            leaf => {
                out.insert(path, leaf);
            }
        }
    }
}

/// Replace a single-key extended-JSON wrapper with the value it stands for.
///
/// Anything else is returned as is. Numeric wrappers whose text does not
/// parse stay strings so no digits are lost.
pub fn unwrap_extended(value: &Value) -> Value {
    let Value::Object(object) = value else {
        return value.clone();
    };
    if object.len() != 1 {
        return value.clone();
    }
    let Some((key, inner)) = object.iter().next() else {
        return value.clone();
    };

    match (key.as_str(), inner) {
        ("$oid" | "$uuid" | "$numberDecimal", Value::String(_)) => inner.clone(),
        ("$date", Value::String(_)) => inner.clone(),
        ("$date", Value::Number(_)) => inner.clone(),
        // Canonical form: {"$date": {"$numberLong": "<millis>"}}
        ("$date", Value::Object(_)) => unwrap_extended(inner),
        ("$numberLong" | "$numberInt", Value::String(text)) => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| inner.clone()),
        ("$numberDouble", Value::String(text)) => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| inner.clone()),
        _ => value.clone(),
    }
}

/// Resolve `path` against a document: the flattened key first, then a
/// nested walk so a path may name a whole sub-document or array.
pub fn lookup(flat: &FlatDocument, document: &Map<String, Value>, path: &str) -> Option<Value> {
    if let Some(value) = flat.get(path) {
        return Some(value.clone());
    }

    let mut segments = path.split(SEPARATOR);
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(object) => object.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(unwrap_extended(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_flatten_nested_objects() {
        let flat = flatten(&doc(json!({
            "_id": "c1",
            "total": {"amount": "9.99", "currency": {"code": "EUR"}},
            "tags": ["a", "b"],
            "meta": {}
        })));

        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["_id", "total.amount", "total.currency.code", "tags", "meta"]
        );
        assert_eq!(flat["total.currency.code"], json!("EUR"));
        assert_eq!(flat["tags"], json!(["a", "b"]));
        assert_eq!(flat["meta"], json!({}));
    }

    #[test]
    fn test_flatten_unwraps_extended_json() {
        let flat = flatten(&doc(json!({
            "_id": {"$oid": "65f0c0ffee"},
            "created": {"$date": {"$numberLong": "1709294400000"}},
            "count": {"$numberLong": "12"},
            "ratio": {"$numberDouble": "0.5"},
            "price": {"$numberDecimal": "9.99"}
        })));

        assert_eq!(flat["_id"], json!("65f0c0ffee"));
        assert_eq!(flat["created"], json!(1709294400000i64));
        assert_eq!(flat["count"], json!(12));
        assert_eq!(flat["ratio"], json!(0.5));
        assert_eq!(flat["price"], json!("9.99"));
    }

    #[test]
    fn test_lookup_falls_back_to_nested_walk() {
        let document = doc(json!({
            "total": {"amount": 5},
            "dogs": [{"name": "rex"}, {"name": "fido"}]
        }));
        let flat = flatten(&document);

        assert_eq!(lookup(&flat, &document, "total.amount"), Some(json!(5)));
        assert_eq!(lookup(&flat, &document, "total"), Some(json!({"amount": 5})));
        assert_eq!(lookup(&flat, &document, "dogs.1.name"), Some(json!("fido")));
        assert_eq!(lookup(&flat, &document, "missing.path"), None);
    }
}
