//! Record-list extraction from a possibly nested API response.
//!
//! Resolution order:
//!
//! 1. the project's `target_chain`, when set and present in the response;
//! 2. the response itself, when it is a list;
//! 3. `data`, when it is a list;
//! 4. `data.list` (a non-list value is wrapped into a one-element list);
//! 5. top-level `list` (wrapped likewise);
//! 6. any other non-null object, as a single record;
//! 7. otherwise nothing.

use serde_json::Value;
use tracing::warn;

use crate::models::Record;

fn wrap(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn follow_chain<'a>(response: &'a Value, chain: &[String]) -> Option<&'a Value> {
    let mut current = response;
    for key in chain {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    present(Some(current))
}

/// Locates the list of raw items in `response`.
pub fn extract_list(response: &Value, target_chain: &[String]) -> Vec<Value> {
    if !target_chain.is_empty() {
        if let Some(found) = follow_chain(response, target_chain) {
            return wrap(found);
        }
    }

    if let Value::Array(items) = response {
        return items.clone();
    }

    if let Some(data) = present(response.get("data")) {
        if let Value::Array(items) = data {
            return items.clone();
        }
        if let Some(list) = present(data.get("list")) {
            return wrap(list);
        }
    }

    if let Some(list) = present(response.get("list")) {
        return wrap(list);
    }

    if response.is_object() {
        return vec![response.clone()];
    }

    Vec::new()
}

/// Extracts records, dropping items that are not JSON objects.
pub fn extract_records(response: &Value, target_chain: &[String]) -> Vec<Record> {
    let items = extract_list(response, target_chain);
    let total = items.len();

    let records: Vec<Record> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();

    if records.len() < total {
        warn!(
            dropped = total - records.len(),
            "response items that are not objects were skipped"
        );
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_list() {
        let list = extract_list(&json!([{"a": 1}, {"a": 2}]), &[]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_data_list_field() {
        let list = extract_list(&json!({"data": [{"a": 1}], "list": [{"b": 1}, {"b": 2}]}), &[]);
        assert_eq!(list, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_data_dot_list() {
        let list = extract_list(&json!({"data": {"list": [{"a": 1}, {"a": 2}], "total": 2}}), &[]);
        assert_eq!(list.len(), 2);

        let wrapped = extract_list(&json!({"data": {"list": {"a": 1}}}), &[]);
        assert_eq!(wrapped, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_top_level_list() {
        let list = extract_list(&json!({"code": 0, "list": [{"a": 1}]}), &[]);
        assert_eq!(list, vec![json!({"a": 1})]);

        let wrapped = extract_list(&json!({"list": {"a": 1}}), &[]);
        assert_eq!(wrapped, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_bare_object_is_single_record() {
        let response = json!({"uid": "1", "name": "a"});
        assert_eq!(extract_list(&response, &[]), vec![response]);
    }

    #[test]
    fn test_data_object_without_list_falls_back_to_whole_response() {
        let response = json!({"data": {"uid": "1"}});
        assert_eq!(extract_list(&response, &[]), vec![response]);
    }

    #[test]
    fn test_scalars_yield_nothing() {
        assert!(extract_list(&json!(null), &[]).is_empty());
        assert!(extract_list(&json!("ok"), &[]).is_empty());
        assert!(extract_list(&json!(3), &[]).is_empty());
    }

    #[test]
    fn test_target_chain_takes_precedence() {
        let response = json!({"data": [{"a": 1}], "result": {"items": [{"b": 1}, {"b": 2}]}});
        let chain = vec!["result".to_string(), "items".to_string()];
        assert_eq!(extract_list(&response, &chain).len(), 2);

        let missing = vec!["nope".to_string()];
        assert_eq!(extract_list(&response, &missing), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_non_object_items_are_dropped() {
        let records = extract_records(&json!([{"a": 1}, 2, "x", {"a": 3}]), &[]);
        assert_eq!(records.len(), 2);
    }
}
