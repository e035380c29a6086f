//! Goal-condition evaluation over run-context snapshots.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::logic::lookup_path;
use super::{ConditionSpec, evaluate, truthy};

/// A whole-run assertion from the task envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoalCondition {
    /// Facet the assertion reads.
    pub facet: String,
    /// Path within the facet value ("" for the whole value).
    #[serde(default)]
    pub path: String,
    /// Optional DSL condition; absent means "facet value present and truthy".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSpec>,
}

/// Outcome of one goal condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoalConditionResult {
    pub facet: String,
    #[serde(default)]
    pub path: String,
    pub satisfied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read the current value a goal condition observes from a snapshot.
pub fn observed_facet_value(snapshot: &Value, facet: &str, path: &str) -> Option<Value> {
    let base = format!("facets.{}.value", facet);
    let full = if path.is_empty() {
        base
    } else {
        format!("{}.{}", base, path)
    };
    lookup_path(snapshot, &full)
}

/// Evaluate every goal condition against a run-context snapshot.
///
/// Missing facets resolve to `null`; an uncompiled DSL surfaces as an
/// error on its row rather than failing the batch.
pub fn evaluate_goal_conditions(
    conditions: &[GoalCondition],
    run_context_snapshot: &Value,
    run_id: &str,
    plan_version: u32,
) -> Vec<GoalConditionResult> {
    let data = json!({
        "run": { "id": run_id, "version": plan_version },
        "metadata": { "runContextSnapshot": run_context_snapshot }
    });

    conditions
        .iter()
        .map(|condition| {
            let observed =
                observed_facet_value(run_context_snapshot, &condition.facet, &condition.path);

            match &condition.condition {
                Some(spec) => match spec.ensure_compiled() {
                    Ok(compiled) => {
                        let outcome = evaluate(&compiled.json_logic, &data);
                        GoalConditionResult {
                            facet: condition.facet.clone(),
                            path: condition.path.clone(),
                            satisfied: outcome.satisfied(),
                            observed_value: observed,
                            error: outcome.error,
                        }
                    }
                    Err(err) => GoalConditionResult {
                        facet: condition.facet.clone(),
                        path: condition.path.clone(),
                        satisfied: false,
                        observed_value: observed,
                        error: Some(err.to_string()),
                    },
                },
                None => GoalConditionResult {
                    facet: condition.facet.clone(),
                    path: condition.path.clone(),
                    satisfied: observed.as_ref().map(truthy).unwrap_or(false),
                    observed_value: observed,
                    error: None,
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ConditionSpec;

    fn snapshot(facets: Value) -> Value {
        json!({ "facets": facets, "hitlClarifications": [] })
    }

    #[test]
    fn test_condition_satisfied() {
        let snap = snapshot(json!({
            "post_copy": { "value": { "status": "ready" } }
        }));
        let conditions = vec![GoalCondition {
            facet: "post_copy".to_string(),
            path: "status".to_string(),
            condition: Some(ConditionSpec::new(
                r#"facets.post_copy.status == "ready""#,
            )),
        }];

        let results = evaluate_goal_conditions(&conditions, &snap, "run-1", 1);
        assert_eq!(results.len(), 1);
        assert!(results[0].satisfied);
        assert_eq!(results[0].observed_value, Some(json!("ready")));
    }

    #[test]
    fn test_condition_failed_reports_observed_value() {
        let snap = snapshot(json!({
            "post_copy": { "value": { "status": "draft" } }
        }));
        let conditions = vec![GoalCondition {
            facet: "post_copy".to_string(),
            path: "status".to_string(),
            condition: Some(ConditionSpec::new(
                r#"facets.post_copy.status == "ready""#,
            )),
        }];

        let results = evaluate_goal_conditions(&conditions, &snap, "run-1", 1);
        assert!(!results[0].satisfied);
        assert_eq!(results[0].observed_value, Some(json!("draft")));
        assert!(results[0].error.is_none());
    }

    #[test]
    fn test_missing_facet_is_unsatisfied_not_error() {
        let snap = snapshot(json!({}));
        let conditions = vec![GoalCondition {
            facet: "post_copy".to_string(),
            path: "status".to_string(),
            condition: Some(ConditionSpec::new(
                r#"facets.post_copy.status == "ready""#,
            )),
        }];

        let results = evaluate_goal_conditions(&conditions, &snap, "run-1", 1);
        assert!(!results[0].satisfied);
        assert!(results[0].error.is_none());
        assert_eq!(results[0].observed_value, None);
    }

    #[test]
    fn test_presence_only_condition() {
        let snap = snapshot(json!({
            "copyVariants": { "value": [{ "post": "hello" }] }
        }));
        let conditions = vec![GoalCondition {
            facet: "copyVariants".to_string(),
            path: String::new(),
            condition: None,
        }];

        let results = evaluate_goal_conditions(&conditions, &snap, "run-1", 1);
        assert!(results[0].satisfied);

        let empty = evaluate_goal_conditions(
            &[GoalCondition {
                facet: "qaFindings".to_string(),
                path: String::new(),
                condition: None,
            }],
            &snap,
            "run-1",
            1,
        );
        assert!(!empty[0].satisfied);
    }

    #[test]
    fn test_bad_dsl_surfaces_on_row() {
        let snap = snapshot(json!({}));
        let conditions = vec![GoalCondition {
            facet: "post_copy".to_string(),
            path: "status".to_string(),
            condition: Some(ConditionSpec::new("facets.post_copy.status <")),
        }];

        let results = evaluate_goal_conditions(&conditions, &snap, "run-1", 1);
        assert!(!results[0].satisfied);
        assert!(results[0].error.is_some());
    }
}
