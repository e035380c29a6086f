//! Feedback normalization and resolution diffing.
//!
//! When a node produces the `feedback` facet, the engine compares the
//! previous and new entry lists by stable key and emits a
//! `feedback_resolution` event for every entry whose resolution changed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The facet feedback entries live under.
pub const FEEDBACK_FACET: &str = "feedback";

/// Normalized view of one feedback entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    /// Stable identity: explicit id, else facet/path/message fingerprint.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// One observed resolution transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResolutionChange {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
}

/// Normalize a raw feedback facet value into keyed entries. Non-array
/// values and non-object items normalize to nothing.
pub fn normalize_feedback(value: &Value) -> Vec<FeedbackEntry> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            let get = |name: &str| object.get(name).and_then(Value::as_str).map(String::from);
            let id = get("id");
            let facet = get("facet");
            let path = get("path");
            let message = get("message");
            let key = id.clone().unwrap_or_else(|| {
                format!(
                    "{}|{}|{}",
                    facet.as_deref().unwrap_or(""),
                    path.as_deref().unwrap_or(""),
                    message.as_deref().unwrap_or("")
                )
            });
            Some(FeedbackEntry {
                key,
                id,
                facet,
                path,
                message,
                note: get("note"),
                resolution: get("resolution"),
            })
        })
        .collect()
}

/// Entries whose resolution changed between two normalized lists, in the
/// new list's order. Entries absent from the previous list count as a
/// change only when they arrive already resolved.
pub fn diff_resolutions(
    previous: &[FeedbackEntry],
    current: &[FeedbackEntry],
) -> Vec<FeedbackResolutionChange> {
    current
        .iter()
        .filter_map(|entry| {
            let prior = previous.iter().find(|p| p.key == entry.key);
            let previous_resolution = prior.and_then(|p| p.resolution.clone());
            if previous_resolution == entry.resolution {
                return None;
            }
            if prior.is_none() && entry.resolution.is_none() {
                return None;
            }
            Some(FeedbackResolutionChange {
                key: entry.key.clone(),
                facet: entry.facet.clone(),
                path: entry.path.clone(),
                message: entry.message.clone(),
                note: entry.note.clone(),
                previous: previous_resolution,
                current: entry.resolution.clone(),
            })
        })
        .collect()
}

/// Filter + order feedback for prompt inclusion: entries touching the
/// node's output facets, unresolved first, truncated to `limit`.
pub fn relevant_feedback(
    entries: &[FeedbackEntry],
    output_facets: &[String],
    limit: usize,
) -> Vec<FeedbackEntry> {
    let mut relevant: Vec<FeedbackEntry> = entries
        .iter()
        .filter(|entry| {
            entry
                .facet
                .as_ref()
                .map(|facet| output_facets.iter().any(|f| f == facet))
                .unwrap_or(true)
        })
        .cloned()
        .collect();
    relevant.sort_by_key(|entry| entry.resolution.is_some());
    relevant.truncate(limit);
    relevant
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_keys_by_id_then_fingerprint() {
        let entries = normalize_feedback(&json!([
            { "id": "fb-1", "facet": "copyVariants", "message": "too long" },
            { "facet": "copyVariants", "path": "0.post", "message": "weak hook" }
        ]));
        assert_eq!(entries[0].key, "fb-1");
        assert_eq!(entries[1].key, "copyVariants|0.post|weak hook");
    }

    #[test]
    fn test_normalize_ignores_non_arrays() {
        assert!(normalize_feedback(&json!({ "not": "a list" })).is_empty());
        assert!(normalize_feedback(&json!("nope")).is_empty());
    }

    #[test]
    fn test_diff_detects_resolution_change() {
        let previous = normalize_feedback(&json!([
            { "id": "fb-1", "facet": "copyVariants", "message": "too long", "resolution": null }
        ]));
        let current = normalize_feedback(&json!([
            { "id": "fb-1", "facet": "copyVariants", "message": "too long", "resolution": "resolved" }
        ]));

        let changes = diff_resolutions(&previous, &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, "fb-1");
        assert_eq!(changes[0].previous, None);
        assert_eq!(changes[0].current.as_deref(), Some("resolved"));
    }

    #[test]
    fn test_diff_ignores_unchanged_and_new_unresolved() {
        let previous = normalize_feedback(&json!([
            { "id": "fb-1", "resolution": "resolved" }
        ]));
        let current = normalize_feedback(&json!([
            { "id": "fb-1", "resolution": "resolved" },
            { "id": "fb-2" }
        ]));
        assert!(diff_resolutions(&previous, &current).is_empty());
    }

    #[test]
    fn test_new_entry_arriving_resolved_counts() {
        let current = normalize_feedback(&json!([
            { "id": "fb-9", "resolution": "wont_fix" }
        ]));
        let changes = diff_resolutions(&[], &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].current.as_deref(), Some("wont_fix"));
    }

    #[test]
    fn test_relevant_feedback_filters_and_prioritizes() {
        let entries = normalize_feedback(&json!([
            { "id": "a", "facet": "qaFindings", "resolution": null },
            { "id": "b", "facet": "copyVariants", "resolution": "resolved" },
            { "id": "c", "facet": "copyVariants", "resolution": null },
            { "id": "d" }
        ]));
        let relevant = relevant_feedback(&entries, &["copyVariants".to_string()], 2);

        // Facet-less entries stay relevant; unresolved sort first.
        assert_eq!(relevant.len(), 2);
        assert_eq!(relevant[0].key, "c");
        assert_eq!(relevant[1].key, "d");
    }
}
