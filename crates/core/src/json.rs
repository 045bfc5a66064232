//! JSON dot-path helpers backing the JSET/JGET/JDEL commands.
//!
//! Paths are dot-separated member names; numeric segments index arrays
//! (`properties.speed`, `tags.0`). Setting into a missing intermediate
//! creates objects along the way.

use serde_json::Value;

fn segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Fetch the value at `path`, or `None` if any segment is missing.
pub fn get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in segments(path) {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(arr) => arr.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Set `value` at `path`, creating intermediate containers as needed. A
/// numeric segment indexes an array (writing past the end pads with nulls);
/// the special segment `-1` appends. Intermediates become arrays when the
/// following segment is numeric, objects otherwise.
pub fn set(doc: &mut Value, path: &str, value: Value) {
    let segs = segments(path);
    if segs.is_empty() {
        *doc = value;
        return;
    }
    let mut cur = doc;
    for (i, seg) in segs.iter().enumerate() {
        let last = i == segs.len() - 1;
        let next_is_index = segs
            .get(i + 1)
            .map(|s| *s == "-1" || s.parse::<usize>().is_ok())
            .unwrap_or(false);

        let index = if *seg == "-1" {
            if !cur.is_array() {
                *cur = Value::Array(Vec::new());
            }
            Some(cur.as_array().unwrap().len())
        } else {
            seg.parse::<usize>().ok().filter(|_| cur.is_array())
        };

        if let Some(idx) = index {
            let arr = cur.as_array_mut().unwrap();
            if idx >= arr.len() {
                arr.resize(idx + 1, Value::Null);
            }
            if last {
                arr[idx] = value;
                return;
            }
            cur = &mut arr[idx];
            if cur.is_null() {
                *cur = empty_container(next_is_index);
            }
            continue;
        }

        if !cur.is_object() {
            *cur = Value::Object(serde_json::Map::new());
        }
        let map = cur.as_object_mut().unwrap();
        if last {
            map.insert(seg.to_string(), value);
            return;
        }
        cur = map
            .entry(seg.to_string())
            .or_insert_with(|| empty_container(next_is_index));
        if cur.is_null() {
            *cur = empty_container(next_is_index);
        }
    }
}

fn empty_container(array: bool) -> Value {
    if array {
        Value::Array(Vec::new())
    } else {
        Value::Object(serde_json::Map::new())
    }
}

/// Delete the value at `path`. Returns true when something was removed.
pub fn delete(doc: &mut Value, path: &str) -> bool {
    let segs = segments(path);
    let Some((&last, parents)) = segs.split_last() else {
        return false;
    };
    let mut cur = doc;
    for seg in parents {
        cur = match cur {
            Value::Object(map) => match map.get_mut(*seg) {
                Some(v) => v,
                None => return false,
            },
            Value::Array(arr) => match seg.parse::<usize>().ok().and_then(|i| arr.get_mut(i)) {
                Some(v) => v,
                None => return false,
            },
            _ => return false,
        };
    }
    match cur {
        Value::Object(map) => map.remove(last).is_some(),
        Value::Array(arr) => match last.parse::<usize>() {
            Ok(i) if i < arr.len() => {
                arr.remove(i);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get() {
        let doc = json!({"a": {"b": [1, 2, {"c": 3}]}});
        assert_eq!(get(&doc, "a.b.0"), Some(&json!(1)));
        assert_eq!(get(&doc, "a.b.2.c"), Some(&json!(3)));
        assert_eq!(get(&doc, "a.x"), None);
        assert_eq!(get(&doc, "a.b.9"), None);
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut doc = json!({});
        set(&mut doc, "a.b.c", json!(42));
        assert_eq!(doc, json!({"a": {"b": {"c": 42}}}));
        set(&mut doc, "a.b.c", json!("x"));
        assert_eq!(get(&doc, "a.b.c"), Some(&json!("x")));
    }

    #[test]
    fn test_set_array_index() {
        let mut doc = json!({"tags": ["a", "b"]});
        set(&mut doc, "tags.1", json!("z"));
        assert_eq!(doc, json!({"tags": ["a", "z"]}));
        set(&mut doc, "tags.3", json!("pad"));
        assert_eq!(doc, json!({"tags": ["a", "z", null, "pad"]}));
    }

    #[test]
    fn test_set_append_with_minus_one() {
        let mut doc = json!({"properties": {}});
        set(&mut doc, "properties.tags.-1", json!("southwest"));
        set(&mut doc, "properties.tags.-1", json!("hot"));
        assert_eq!(doc, json!({"properties": {"tags": ["southwest", "hot"]}}));
    }

    #[test]
    fn test_delete() {
        let mut doc = json!({"a": {"b": 1, "c": 2}, "list": [1, 2, 3]});
        assert!(delete(&mut doc, "a.b"));
        assert!(!delete(&mut doc, "a.b"));
        assert!(delete(&mut doc, "list.1"));
        assert_eq!(doc, json!({"a": {"c": 2}, "list": [1, 3]}));
    }
}
