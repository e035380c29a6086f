//! Contract validation at every engine boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Where a validation ran.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationScope {
    Envelope,
    CapabilityInput,
    CapabilityOutput,
    FinalOutput,
}

impl std::fmt::Display for ValidationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValidationScope::Envelope => "envelope",
            ValidationScope::CapabilityInput => "capability_input",
            ValidationScope::CapabilityOutput => "capability_output",
            ValidationScope::FinalOutput => "final_output",
        };
        write!(f, "{}", name)
    }
}

/// One schema violation, in the shape streaming clients expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaViolation {
    pub message: String,
    pub instance_path: String,
    pub keyword: String,
    #[serde(default)]
    pub params: Value,
    pub schema_path: String,
}

/// Validate an instance against a JSON Schema. `Ok(())` on success, the
/// full violation list otherwise. A schema that itself fails to compile is
/// reported as a single violation rather than a panic.
pub fn validate_against_schema(
    schema: &Value,
    instance: &Value,
) -> Result<(), Vec<SchemaViolation>> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            return Err(vec![SchemaViolation {
                message: format!("contract schema does not compile: {}", err),
                instance_path: String::new(),
                keyword: "schema".to_string(),
                params: json!({}),
                schema_path: String::new(),
            }]);
        }
    };

    let violations: Vec<SchemaViolation> = validator
        .iter_errors(instance)
        .map(|error| {
            let schema_path = error.schema_path.to_string();
            SchemaViolation {
                message: error.to_string(),
                instance_path: error.instance_path.to_string(),
                keyword: keyword_from_schema_path(&schema_path),
                params: json!({}),
                schema_path,
            }
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// The violated keyword is the last non-index segment of the schema path.
fn keyword_from_schema_path(schema_path: &str) -> String {
    schema_path
        .rsplit('/')
        .find(|segment| !segment.is_empty() && segment.parse::<usize>().is_err())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_instance_passes() {
        let schema = json!({
            "type": "object",
            "properties": { "copyVariants": { "type": "array" } },
            "required": ["copyVariants"]
        });
        assert!(validate_against_schema(&schema, &json!({ "copyVariants": [] })).is_ok());
    }

    #[test]
    fn test_missing_required_reports_keyword() {
        let schema = json!({
            "type": "object",
            "properties": { "copyVariants": { "type": "array" } },
            "required": ["copyVariants"]
        });
        let violations = validate_against_schema(&schema, &json!({})).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].keyword, "required");
        assert!(violations[0].message.contains("copyVariants"));
    }

    #[test]
    fn test_min_items_violation() {
        let schema = json!({
            "type": "object",
            "properties": {
                "variants": { "type": "array", "minItems": 2 }
            },
            "required": ["variants"]
        });
        let violations =
            validate_against_schema(&schema, &json!({ "variants": ["only one"] })).unwrap_err();
        assert_eq!(violations[0].keyword, "minItems");
        assert_eq!(violations[0].instance_path, "/variants");
    }

    #[test]
    fn test_uncompilable_schema_is_a_violation() {
        let schema = json!({ "type": "definitely-not-a-type" });
        let violations = validate_against_schema(&schema, &json!({})).unwrap_err();
        assert_eq!(violations[0].keyword, "schema");
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(ValidationScope::CapabilityOutput.to_string(), "capability_output");
        assert_eq!(ValidationScope::FinalOutput.to_string(), "final_output");
    }
}
