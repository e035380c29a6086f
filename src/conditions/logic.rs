//! JSON-Logic evaluation.
//!
//! Only the operators the DSL compiler emits are supported, plus `var`
//! defaults. Missing variables resolve to `null` and never raise; an
//! unsupported operator surfaces through `EvaluationOutcome.error`.

use std::collections::BTreeMap;

use serde_json::Value;

use super::EvaluationOutcome;

/// Evaluate a JSON-Logic expression against a data document.
pub fn evaluate(logic: &Value, data: &Value) -> EvaluationOutcome {
    let mut resolved = BTreeMap::new();
    match eval(logic, data, &mut resolved) {
        Ok(result) => EvaluationOutcome {
            ok: true,
            result,
            resolved_variables: resolved,
            error: None,
        },
        Err(message) => EvaluationOutcome {
            ok: false,
            result: Value::Null,
            resolved_variables: resolved,
            error: Some(message),
        },
    }
}

/// JSON-Logic truthiness: `false`, `null`, `0`, `""` and `[]` are falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn eval(
    logic: &Value,
    data: &Value,
    resolved: &mut BTreeMap<String, Value>,
) -> Result<Value, String> {
    let Some(object) = logic.as_object() else {
        return Ok(logic.clone());
    };
    if object.len() != 1 {
        // Multi-key objects are data, not operations.
        return Ok(logic.clone());
    }
    let (op, args) = object.iter().next().expect("len checked above");

    match op.as_str() {
        "var" => eval_var(args, data, resolved),
        "and" => {
            let parts = arg_list(args);
            let mut last = Value::Bool(true);
            for part in parts {
                last = eval(&part, data, resolved)?;
                if !truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "or" => {
            let parts = arg_list(args);
            let mut last = Value::Bool(false);
            for part in parts {
                last = eval(&part, data, resolved)?;
                if truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "!" => {
            let parts = arg_list(args);
            let inner = parts
                .first()
                .map(|p| eval(p, data, resolved))
                .transpose()?
                .unwrap_or(Value::Null);
            Ok(Value::Bool(!truthy(&inner)))
        }
        "==" | "!=" | ">" | ">=" | "<" | "<=" | "in" => {
            let parts = arg_list(args);
            if parts.len() != 2 {
                return Err(format!("operator {:?} expects 2 arguments", op));
            }
            let left = eval(&parts[0], data, resolved)?;
            let right = eval(&parts[1], data, resolved)?;
            Ok(Value::Bool(apply_binary(op, &left, &right)))
        }
        other => Err(format!("unsupported operator '{}'", other)),
    }
}

fn arg_list(args: &Value) -> Vec<Value> {
    match args {
        Value::Array(items) => items.clone(),
        single => vec![single.clone()],
    }
}

fn eval_var(
    args: &Value,
    data: &Value,
    resolved: &mut BTreeMap<String, Value>,
) -> Result<Value, String> {
    let (path, default) = match args {
        Value::String(path) => (path.clone(), Value::Null),
        Value::Array(items) => {
            let path = items
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| "var expects a string path".to_string())?
                .to_string();
            let default = items.get(1).cloned().unwrap_or(Value::Null);
            (path, default)
        }
        other => return Err(format!("var expects a string path, found {}", other)),
    };

    let value = lookup_path(data, &path).unwrap_or(default);
    resolved.insert(path, value.clone());
    Ok(value)
}

/// Resolve a dotted path against a document. `None` when any hop is absent.
pub(crate) fn lookup_path(data: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(data.clone());
    }
    let mut current = data;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

fn apply_binary(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "==" => loose_eq(left, right),
        "!=" => !loose_eq(left, right),
        ">" | ">=" | "<" | "<=" => compare_ordered(op, left, right),
        "in" => membership(left, right),
        _ => false,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => s
            .trim()
            .parse::<f64>()
            .map(|parsed| Some(parsed) == n.as_f64())
            .unwrap_or(false),
        (Value::Bool(b), Value::Number(n)) | (Value::Number(n), Value::Bool(b)) => {
            n.as_f64() == Some(if *b { 1.0 } else { 0.0 })
        }
        (a, b) => a == b,
    }
}

fn compare_ordered(op: &str, left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return match op {
            ">" => a > b,
            ">=" => a >= b,
            "<" => a < b,
            "<=" => a <= b,
            _ => false,
        };
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return match op {
            ">" => a > b,
            ">=" => a >= b,
            "<" => a < b,
            "<=" => a <= b,
            _ => false,
        };
    }
    false
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn membership(needle: &Value, haystack: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot_data(facets: Value) -> Value {
        json!({
            "run": { "id": "run-1", "version": 1 },
            "metadata": { "runContextSnapshot": { "facets": facets } }
        })
    }

    #[test]
    fn test_var_resolution_and_equality() {
        let data = snapshot_data(json!({
            "post_copy": { "value": { "status": "ready" } }
        }));
        let logic = json!({ "==": [
            { "var": "metadata.runContextSnapshot.facets.post_copy.value.status" },
            "ready"
        ]});

        let outcome = evaluate(&logic, &data);
        assert!(outcome.ok);
        assert!(outcome.satisfied());
        assert_eq!(
            outcome
                .resolved_variables
                .get("metadata.runContextSnapshot.facets.post_copy.value.status"),
            Some(&json!("ready"))
        );
    }

    #[test]
    fn test_missing_facet_resolves_to_null() {
        let data = snapshot_data(json!({}));
        let logic = json!({ "==": [
            { "var": "metadata.runContextSnapshot.facets.absent.value.status" },
            "ready"
        ]});

        let outcome = evaluate(&logic, &data);
        assert!(outcome.ok, "missing variables never raise");
        assert!(!outcome.satisfied());
        assert_eq!(
            outcome
                .resolved_variables
                .get("metadata.runContextSnapshot.facets.absent.value.status"),
            Some(&Value::Null)
        );
    }

    #[test]
    fn test_and_short_circuits() {
        let data = snapshot_data(json!({ "a": { "value": 1 } }));
        let logic = json!({ "and": [
            { "==": [{ "var": "metadata.runContextSnapshot.facets.a.value" }, 2] },
            { "unsupported_op": [] }
        ]});
        // First conjunct is false, so the unsupported operator is never reached.
        let outcome = evaluate(&logic, &data);
        assert!(outcome.ok);
        assert!(!outcome.satisfied());
    }

    #[test]
    fn test_numeric_comparisons() {
        let data = json!({ "score": 0.85 });
        assert!(evaluate(&json!({ ">=": [{ "var": "score" }, 0.8] }), &data).satisfied());
        assert!(!evaluate(&json!({ "<": [{ "var": "score" }, 0.8] }), &data).satisfied());
    }

    #[test]
    fn test_numeric_string_coercion() {
        let data = json!({ "count": "3" });
        assert!(evaluate(&json!({ "==": [{ "var": "count" }, 3] }), &data).satisfied());
        assert!(evaluate(&json!({ ">": [{ "var": "count" }, 2] }), &data).satisfied());
    }

    #[test]
    fn test_membership_in_array_and_string() {
        let data = json!({ "tag": "b", "text": "hello world" });
        assert!(evaluate(&json!({ "in": [{ "var": "tag" }, ["a", "b"]] }), &data).satisfied());
        assert!(!evaluate(&json!({ "in": [{ "var": "tag" }, ["x"]] }), &data).satisfied());
        assert!(evaluate(&json!({ "in": ["world", { "var": "text" }] }), &data).satisfied());
    }

    #[test]
    fn test_negation() {
        let data = json!({ "flag": false });
        assert!(evaluate(&json!({ "!": [{ "var": "flag" }] }), &data).satisfied());
    }

    #[test]
    fn test_unsupported_operator_reports_error() {
        let outcome = evaluate(&json!({ "merge": [[1], [2]] }), &json!({}));
        assert!(!outcome.ok);
        assert!(outcome.error.as_deref().unwrap().contains("merge"));
        assert!(!outcome.satisfied());
    }

    #[test]
    fn test_array_index_path() {
        let data = json!({ "items": [{ "name": "first" }] });
        let outcome = evaluate(
            &json!({ "==": [{ "var": "items.0.name" }, "first"] }),
            &data,
        );
        assert!(outcome.satisfied());
    }

    #[test]
    fn test_var_default() {
        let outcome = evaluate(&json!({ "var": ["missing.path", "fallback"] }), &json!({}));
        assert!(outcome.ok);
        assert_eq!(outcome.result, json!("fallback"));
    }

    #[test]
    fn test_truthiness_table() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!({})));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!(1)));
    }
}
