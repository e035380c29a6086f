//! The catalog of known facets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Declared producibility of a facet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FacetDirection {
    /// May appear only in input contracts.
    Input,
    /// May appear only in output contracts.
    Output,
    /// May appear on either side.
    Bidirectional,
}

impl FacetDirection {
    pub fn accepts_input(self) -> bool {
        matches!(self, FacetDirection::Input | FacetDirection::Bidirectional)
    }

    pub fn accepts_output(self) -> bool {
        matches!(self, FacetDirection::Output | FacetDirection::Bidirectional)
    }
}

/// A catalog entry: schema fragment plus canonical placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetDef {
    /// Facet name as referenced by contracts and envelopes.
    pub name: String,
    /// Human title surfaced in provenance records.
    pub title: String,
    /// One-line description for planner context.
    pub description: String,
    /// JSON Schema fragment for the facet's value.
    pub schema: Value,
    /// Canonical JSON pointer into the composed final output.
    pub pointer: String,
    /// Which contract sides the facet may appear on.
    pub direction: FacetDirection,
}

impl FacetDef {
    pub fn new(
        name: &str,
        title: &str,
        description: &str,
        schema: Value,
        direction: FacetDirection,
    ) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            schema,
            pointer: format!("/{}", name),
            direction,
        }
    }
}

/// Holds the canonical schema fragment and pointer for every known facet.
///
/// Compilation is purely functional over this catalog; there is no I/O.
#[derive(Debug, Clone, Default)]
pub struct FacetCatalog {
    facets: BTreeMap<String, FacetDef>,
}

impl FacetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the facets the built-in scenarios use.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        for def in default_facets() {
            catalog.register(def);
        }
        catalog
    }

    /// Insert or replace a facet definition.
    pub fn register(&mut self, def: FacetDef) {
        self.facets.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&FacetDef> {
        self.facets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.facets.contains_key(name)
    }

    /// All facet names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.facets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.facets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facets.is_empty()
    }
}

fn default_facets() -> Vec<FacetDef> {
    vec![
        FacetDef::new(
            "objectiveBrief",
            "Objective brief",
            "Caller-provided statement of what the run should achieve",
            json!({ "type": "string", "minLength": 1 }),
            FacetDirection::Input,
        ),
        FacetDef::new(
            "writerBrief",
            "Writer brief",
            "Structured brief handed to content-producing capabilities",
            json!({ "type": "object" }),
            FacetDirection::Bidirectional,
        ),
        FacetDef::new(
            "toneOfVoice",
            "Tone of voice",
            "Stylistic guidance for generated copy",
            json!({ "type": "string" }),
            FacetDirection::Input,
        ),
        FacetDef::new(
            "audienceProfile",
            "Audience profile",
            "Description of the audience the output targets",
            json!({ "type": "object" }),
            FacetDirection::Input,
        ),
        FacetDef::new(
            "planKnobs",
            "Plan knobs",
            "Caller-tunable parameters consulted by routing conditions",
            json!({ "type": "object" }),
            FacetDirection::Input,
        ),
        FacetDef::new(
            "copyVariants",
            "Copy variants",
            "Generated content variants",
            json!({
                "type": "array",
                "items": { "type": "object" }
            }),
            FacetDirection::Bidirectional,
        ),
        FacetDef::new(
            "qaFindings",
            "QA findings",
            "Quality-assurance findings over produced content",
            json!({
                "type": "array",
                "items": { "type": "object" }
            }),
            FacetDirection::Bidirectional,
        ),
        FacetDef::new(
            "feedback",
            "Feedback",
            "Reviewer feedback entries with resolution state",
            json!({
                "type": "array",
                "items": { "type": "object" }
            }),
            FacetDirection::Bidirectional,
        ),
        FacetDef::new(
            "post_copy",
            "Post copy",
            "Finalized post copy with readiness status",
            json!({ "type": "object" }),
            FacetDirection::Output,
        ),
    ]
}
