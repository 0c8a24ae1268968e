//! Key-case transforms for the persistence boundary.
//!
//! Field naming is snake_case on the persistence side and camelCase on the
//! legacy client side; the transform is applied to whole JSON documents at
//! the boundary, recursively, leaving values untouched.

use serde_json::Value;

/// `sceneNumber` -> `scene_number`. Already-snake keys pass through.
pub fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `scene_number` -> `sceneNumber`. Leading/trailing underscores are kept.
pub fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for (i, ch) in key.chars().enumerate() {
        if ch == '_' && i > 0 && i + 1 < key.len() {
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Recursively rewrite every object key to snake_case.
pub fn to_snake_keys(value: &Value) -> Value {
    transform_keys(value, &camel_to_snake)
}

/// Recursively rewrite every object key to camelCase.
pub fn to_camel_keys(value: &Value) -> Value {
    transform_keys(value, &snake_to_camel)
}

fn transform_keys(value: &Value, rename: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                out.insert(rename(key), transform_keys(inner, rename));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| transform_keys(v, rename)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn camel_keys_become_snake_recursively() {
        let input = json!({
            "sceneNumber": 1,
            "nested": {"wordCount": 1500, "futureEvents": ["x"]},
            "list": [{"revisionNeeded": true}]
        });
        let out = to_snake_keys(&input);
        assert_eq!(out["scene_number"], json!(1));
        assert_eq!(out["nested"]["word_count"], json!(1500));
        assert_eq!(out["list"][0]["revision_needed"], json!(true));
    }

    #[test]
    fn snake_keys_become_camel() {
        let input = json!({"scene_number": 2, "word_count_compliance": false});
        let out = to_camel_keys(&input);
        assert_eq!(out["sceneNumber"], json!(2));
        assert_eq!(out["wordCountCompliance"], json!(false));
    }

    #[test]
    fn round_trip_preserves_simple_documents() {
        let input = json!({"scene_number": 3, "title": "The Storm"});
        let round = to_snake_keys(&to_camel_keys(&input));
        assert_eq!(input, round);
    }

    #[test]
    fn values_are_never_rewritten() {
        let input = json!({"note": "keepCamelInsideValues"});
        let out = to_snake_keys(&input);
        assert_eq!(out["note"], json!("keepCamelInsideValues"));
    }
}
