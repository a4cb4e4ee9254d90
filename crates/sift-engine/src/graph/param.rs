//! Node parameters and deferred references.
//!
//! On the wire a reference is an object `{"$ref": "<node id>", "path": "a.b.0"}`.
//! Everything else is plain JSON. Resolution is a substitution pass over the
//! typed tree: no string interpolation ever happens.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const REF_KEY: &str = "$ref";
const PATH_KEY: &str = "path";

/// Pointer into another node's result data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub node: String,
    /// Dot-separated keys or array indices. Empty selects the whole result.
    pub path: String,
}

/// A parameter value, possibly containing deferred references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Param {
    Literal(Value),
    List(Vec<Param>),
    Object(BTreeMap<String, Param>),
    Ref(Reference),
}

impl Param {
    pub fn reference(node: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Ref(Reference {
            node: node.into(),
            path: path.into(),
        })
    }

    pub fn list(items: impl IntoIterator<Item = Param>) -> Self {
        Self::List(items.into_iter().collect())
    }

    pub(crate) fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|p| p.collect_refs(out)),
            Self::Object(map) => map.values().for_each(|p| p.collect_refs(out)),
        }
    }

    /// Substitute references with data from `available`.
    ///
    /// `available` holds the data of successful dependencies only, so a
    /// reference to a recoverably failed node resolves to null. Inside a list,
    /// a reference that resolves to an array is spliced in place and one that
    /// resolves to null is dropped.
    pub fn resolve(&self, available: &HashMap<&str, &Value>) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Ref(r) => lookup(r, available),
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, p)| (k.clone(), p.resolve(available)))
                    .collect(),
            ),
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Self::Ref(r) => match lookup(r, available) {
                            Value::Null => {}
                            Value::Array(values) => out.extend(values),
                            other => out.push(other),
                        },
                        other => out.push(other.resolve(available)),
                    }
                }
                Value::Array(out)
            }
        }
    }
}

fn lookup(r: &Reference, available: &HashMap<&str, &Value>) -> Value {
    available
        .get(r.node.as_str())
        .map(|data| select(data, &r.path))
        .unwrap_or(Value::Null)
}

/// Walk a dot path into a JSON value. Missing segments yield null.
pub fn select(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Resolve a whole parameter map into a JSON object.
pub fn resolve_all(params: &BTreeMap<String, Param>, available: &HashMap<&str, &Value>) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, p)| (k.clone(), p.resolve(available)))
            .collect(),
    )
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                if let Some(Value::String(node)) = map.get(REF_KEY) {
                    let node = node.clone();
                    let path = match map.remove(PATH_KEY) {
                        Some(Value::String(p)) => p,
                        _ => String::new(),
                    };
                    return Self::Ref(Reference { node, path });
                }
                Self::Object(map.into_iter().map(|(k, v)| (k, Param::from(v))).collect())
            }
            Value::Array(items) => Self::List(items.into_iter().map(Param::from).collect()),
            other => Self::Literal(other),
        }
    }
}

impl From<Param> for Value {
    fn from(param: Param) -> Self {
        match param {
            Param::Literal(v) => v,
            Param::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Param::Object(map) => {
                Value::Object(map.into_iter().map(|(k, p)| (k, Value::from(p))).collect())
            }
            Param::Ref(r) => {
                let mut map = Map::new();
                map.insert(REF_KEY.to_string(), Value::String(r.node));
                map.insert(PATH_KEY.to_string(), Value::String(r.path));
                Value::Object(map)
            }
        }
    }
}

impl From<Reference> for Param {
    fn from(r: Reference) -> Self {
        Self::Ref(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn available<'a>(pairs: &'a [(&'a str, Value)]) -> HashMap<&'a str, &'a Value> {
        pairs.iter().map(|(k, v)| (*k, v)).collect()
    }

    #[test]
    fn test_parse_ref_and_nested_literals() {
        let param = Param::from(json!({
            "items": {"$ref": "n1", "path": "items"},
            "focus": "urgency",
            "whole": {"$ref": "n2"}
        }));
        let mut refs = Vec::new();
        param.collect_refs(&mut refs);
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().any(|r| r.node == "n2" && r.path.is_empty()));
    }

    #[test]
    fn test_list_of_refs_concatenates() {
        let data = [
            ("a", json!({"items": [{"id": "m1"}, {"id": "m2"}]})),
            ("b", json!({"items": [{"id": "m3"}]})),
        ];
        let param = Param::list([Param::reference("a", "items"), Param::reference("b", "items")]);
        let resolved = param.resolve(&available(&data));
        let ids: Vec<_> = resolved
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_ref_to_unavailable_node_is_null_and_dropped_in_lists() {
        let data = [("a", json!({"items": [1, 2]}))];
        let avail = available(&data);
        assert_eq!(Param::reference("gone", "items").resolve(&avail), Value::Null);

        let list = Param::list([Param::reference("gone", "items"), Param::reference("a", "items")]);
        assert_eq!(list.resolve(&avail), json!([1, 2]));
    }

    #[test]
    fn test_select_paths() {
        let v = json!({"threads": [{"id": "t1", "messages": [{"id": "x"}]}], "count": 1});
        assert_eq!(select(&v, "count"), json!(1));
        assert_eq!(select(&v, "threads.0.messages.0.id"), json!("x"));
        assert_eq!(select(&v, "threads.7.id"), Value::Null);
        assert_eq!(select(&v, "missing.key"), Value::Null);
        assert_eq!(select(&v, ""), v);
    }

    #[test]
    fn test_wire_form_round_trip() {
        let wire = json!({"$ref": "n1", "path": "items"});
        let param: Param = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(param, Param::reference("n1", "items"));
        assert_eq!(serde_json::to_value(&param).unwrap(), wire);
    }
}
