//! Request-parameter merging and type coercion.
//!
//! A project's parameter template supplies defaults; a task's overrides
//! replace same-keyed entries. Values are coerced by declared type at merge
//! time so the fetch sees numbers, booleans and structures rather than the
//! text they were configured as.

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::models::{FieldType, RequestParam, TaskParam};

/// Merged parameters, ready to be sent with the fetch.
pub type Params = Map<String, Value>;

/// Merges template defaults with task overrides; overrides win.
pub fn merge_request_params(template: &[RequestParam], overrides: &[TaskParam]) -> Result<Params> {
    let mut merged = Params::new();

    for param in template {
        if let Some(value) = param.default.as_ref().filter(|v| !v.is_null()) {
            merged.insert(
                param.key.clone(),
                coerce(&param.key, Some(param.param_type), value)?,
            );
        }
    }

    for param in overrides {
        let value = param
            .value
            .as_ref()
            .filter(|v| !v.is_null())
            .or_else(|| param.default.as_ref().filter(|v| !v.is_null()));
        let Some(value) = value else {
            continue;
        };
        // An override without its own type takes the template's.
        let param_type = param.param_type.or_else(|| {
            template
                .iter()
                .find(|t| t.key == param.key)
                .map(|t| t.param_type)
        });
        merged.insert(param.key.clone(), coerce(&param.key, param_type, value)?);
    }

    for param in template.iter().filter(|p| p.required) {
        if !merged.contains_key(&param.key) {
            return Err(Error::validation(format!(
                "required request parameter '{}' has no value",
                param.key
            )));
        }
    }

    Ok(merged)
}

/// Coerces one configured value into its declared type.
pub fn coerce(key: &str, param_type: Option<FieldType>, value: &Value) -> Result<Value> {
    match param_type {
        Some(FieldType::Number) | Some(FieldType::Decimal) => to_number(key, value),
        Some(FieldType::Boolean) => Ok(Value::Bool(truthy(value))),
        Some(FieldType::Array) | Some(FieldType::Json) => match value {
            Value::String(text) => serde_json::from_str(text).map_err(|e| {
                Error::validation(format!("parameter '{}' is not valid JSON: {}", key, e))
            }),
            other => Ok(other.clone()),
        },
        _ => Ok(value.clone()),
    }
}

fn to_number(key: &str, value: &Value) -> Result<Value> {
    let not_numeric = || Error::validation(format!("parameter '{}' is not numeric: {}", key, value));

    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Value::from(i));
            }
            let f = text.parse::<f64>().map_err(|_| not_numeric())?;
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                Ok(Value::from(f as i64))
            } else {
                Number::from_f64(f).map(Value::Number).ok_or_else(not_numeric)
            }
        }
        _ => Err(not_numeric()),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::String(s) => s == "true" || s == "1",
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Flattens parameters into query-string pairs; structures are JSON-encoded.
pub fn query_pairs(params: &Params) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> Vec<RequestParam> {
        serde_json::from_value(json!([
            {"key": "page", "type": "number", "default": "1"},
            {"key": "size", "type": "decimal", "default": "2.5"},
            {"key": "active", "type": "boolean", "default": "1"},
            {"key": "tags", "type": "array", "default": "[\"a\",\"b\"]"},
            {"key": "q", "type": "text", "default": "rust"}
        ]))
        .unwrap()
    }

    #[test]
    fn test_template_defaults_are_coerced() {
        let merged = merge_request_params(&template(), &[]).unwrap();
        assert_eq!(merged["page"], json!(1));
        assert_eq!(merged["size"], json!(2.5));
        assert_eq!(merged["active"], json!(true));
        assert_eq!(merged["tags"], json!(["a", "b"]));
        assert_eq!(merged["q"], json!("rust"));
    }

    #[test]
    fn test_overrides_replace_and_inherit_type() {
        let overrides = vec![
            TaskParam::value("page", json!("3")),
            TaskParam::value("active", json!("false")),
            TaskParam::value("extra", json!("x")),
        ];
        let merged = merge_request_params(&template(), &overrides).unwrap();
        assert_eq!(merged["page"], json!(3));
        assert_eq!(merged["active"], json!(false));
        assert_eq!(merged["extra"], json!("x"));
    }

    #[test]
    fn test_override_without_value_keeps_template() {
        let overrides = vec![TaskParam {
            key: "page".into(),
            value: None,
            param_type: None,
            default: None,
        }];
        let merged = merge_request_params(&template(), &overrides).unwrap();
        assert_eq!(merged["page"], json!(1));
    }

    #[test]
    fn test_non_numeric_is_rejected() {
        let err = coerce("page", Some(FieldType::Number), &json!("ten")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_required_without_value() {
        let template: Vec<RequestParam> =
            serde_json::from_value(json!([{"key": "token", "type": "text", "required": true}]))
                .unwrap();
        assert!(merge_request_params(&template, &[]).is_err());
        let ok = merge_request_params(&template, &[TaskParam::value("token", json!("t"))]);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_query_pairs_encode_structures() {
        let mut params = Params::new();
        params.insert("page".into(), json!(2));
        params.insert("ids".into(), json!([1, 2]));
        params.insert("q".into(), json!("a b"));
        let pairs = query_pairs(&params);
        assert!(pairs.contains(&("page".to_string(), "2".to_string())));
        assert!(pairs.contains(&("ids".to_string(), "[1,2]".to_string())));
        assert!(pairs.contains(&("q".to_string(), "a b".to_string())));
    }
}
