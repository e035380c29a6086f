//! Facet lists -> JSON-Schema contracts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{ContractDirection, FacetCatalog, FacetContractError, FacetProvenanceEntry};

/// A JSON-Schema contract compiled from a facet list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledContract {
    /// Object schema keyed by facet name.
    pub schema: Value,
    /// One entry per facet, in request order.
    pub provenance: Vec<FacetProvenanceEntry>,
}

/// Result of compiling both sides of a capability's facet contracts.
#[derive(Debug, Clone, Default)]
pub struct CompiledContracts {
    pub input: Option<CompiledContract>,
    pub output: Option<CompiledContract>,
}

impl FacetCatalog {
    /// Compile input/output facet lists into JSON-Schema contracts.
    ///
    /// An empty list on either side yields `None` for that side. Fails with
    /// `UnknownFacet` for names missing from the catalog and with
    /// `Directionality` when a facet is requested on a side its catalog entry
    /// does not allow.
    pub fn compile_contracts(
        &self,
        input_facets: &[String],
        output_facets: &[String],
    ) -> Result<CompiledContracts, FacetContractError> {
        let input = if input_facets.is_empty() {
            None
        } else {
            Some(self.compile_side(input_facets, ContractDirection::Input)?)
        };
        let output = if output_facets.is_empty() {
            None
        } else {
            Some(self.compile_side(output_facets, ContractDirection::Output)?)
        };
        Ok(CompiledContracts { input, output })
    }

    fn compile_side(
        &self,
        facets: &[String],
        direction: ContractDirection,
    ) -> Result<CompiledContract, FacetContractError> {
        let mut properties = Map::new();
        let mut required = Vec::new();
        let mut provenance = Vec::new();

        for name in facets {
            let def = self
                .get(name)
                .ok_or_else(|| FacetContractError::UnknownFacet {
                    facet: name.clone(),
                })?;

            let allowed = match direction {
                ContractDirection::Input => def.direction.accepts_input(),
                ContractDirection::Output => def.direction.accepts_output(),
            };
            if !allowed {
                return Err(FacetContractError::Directionality {
                    facet: name.clone(),
                    requested: direction,
                });
            }

            // Duplicate names collapse to one property but keep first-wins
            // ordering in provenance.
            if !properties.contains_key(name) {
                properties.insert(name.clone(), def.schema.clone());
                required.push(Value::String(name.clone()));
                provenance.push(FacetProvenanceEntry {
                    title: def.title.clone(),
                    direction,
                    facet: name.clone(),
                    pointer: def.pointer.clone(),
                });
            }
        }

        Ok(CompiledContract {
            schema: json!({
                "type": "object",
                "properties": Value::Object(properties),
                "required": Value::Array(required),
                "additionalProperties": true
            }),
            provenance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compile_output_contract() {
        let catalog = FacetCatalog::with_defaults();
        let compiled = catalog
            .compile_contracts(&[], &strings(&["copyVariants"]))
            .unwrap();

        assert!(compiled.input.is_none());
        let output = compiled.output.unwrap();
        assert_eq!(output.schema["type"], "object");
        assert!(output.schema["properties"]["copyVariants"].is_object());
        assert_eq!(output.schema["required"][0], "copyVariants");
        assert_eq!(output.provenance.len(), 1);
        assert_eq!(output.provenance[0].facet, "copyVariants");
        assert_eq!(output.provenance[0].pointer, "/copyVariants");
        assert_eq!(output.provenance[0].direction, ContractDirection::Output);
    }

    #[test]
    fn test_compile_both_sides() {
        let catalog = FacetCatalog::with_defaults();
        let compiled = catalog
            .compile_contracts(
                &strings(&["objectiveBrief", "toneOfVoice"]),
                &strings(&["copyVariants"]),
            )
            .unwrap();

        let input = compiled.input.unwrap();
        assert_eq!(input.provenance.len(), 2);
        assert_eq!(input.provenance[0].facet, "objectiveBrief");
        assert_eq!(input.provenance[0].title, "Objective brief");
        assert!(compiled.output.is_some());
    }

    #[test]
    fn test_unknown_facet_names_the_facet() {
        let catalog = FacetCatalog::with_defaults();
        let err = catalog
            .compile_contracts(&strings(&["mysteryFacet"]), &[])
            .unwrap_err();

        assert_eq!(err.code(), "unknown_facet");
        assert!(err.to_string().contains("mysteryFacet"));
    }

    #[test]
    fn test_output_only_facet_rejected_as_input() {
        let catalog = FacetCatalog::with_defaults();
        let err = catalog
            .compile_contracts(&strings(&["post_copy"]), &[])
            .unwrap_err();

        assert_eq!(err.code(), "facet_directionality");
        assert!(matches!(
            err,
            FacetContractError::Directionality {
                requested: ContractDirection::Input,
                ..
            }
        ));
    }

    #[test]
    fn test_input_only_facet_rejected_as_output() {
        let catalog = FacetCatalog::with_defaults();
        let err = catalog
            .compile_contracts(&[], &strings(&["toneOfVoice"]))
            .unwrap_err();
        assert_eq!(err.code(), "facet_directionality");
    }

    #[test]
    fn test_duplicate_facets_collapse() {
        let catalog = FacetCatalog::with_defaults();
        let compiled = catalog
            .compile_contracts(&[], &strings(&["copyVariants", "copyVariants"]))
            .unwrap();
        let output = compiled.output.unwrap();
        assert_eq!(output.provenance.len(), 1);
        assert_eq!(output.schema["required"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_sides_compile_to_none() {
        let catalog = FacetCatalog::with_defaults();
        let compiled = catalog.compile_contracts(&[], &[]).unwrap();
        assert!(compiled.input.is_none());
        assert!(compiled.output.is_none());
    }
}
