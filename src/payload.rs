//! Job payload: job-specific state that is only ever merged, never replaced.
//!
//! The stored shape is plain JSON so the presentation layer can read it
//! without knowing these types. Writers go through [`JobPayload`], whose
//! unset fields are omitted from the patch and therefore leave stored keys
//! untouched. A key is only removed when a patch carries an explicit `null`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::scrape::budget::{BudgetPlan, Usd};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Artifact created by this job and not yet handed over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_entries: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_bytes: Option<u64>,
    /// Remote media that was not stored (too large, unreachable, over a ceiling).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_skipped: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrued_cost: Option<Usd>,
    /// Upstream provider run ids keyed by run label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_ids: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl JobPayload {
    pub fn phase(phase: &str) -> Self {
        JobPayload {
            phase: Some(phase.to_string()),
            ..Default::default()
        }
    }

    pub fn to_patch(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    /// Reads a stored payload back, ignoring keys this version does not know.
    pub fn from_stored(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Merges `patch` into `target` key by key.
///
/// Nested objects are merged recursively, `null` removes the key, and any
/// other value (arrays included) replaces what was there.
pub fn deep_merge(target: &mut Value, patch: Value) {
    let Value::Object(patch) = patch else {
        if !patch.is_null() {
            *target = patch;
        }
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
            continue;
        }
        match target.get_mut(&key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                deep_merge(existing, value)
            }
            _ => {
                target.insert(key, value);
            }
        }
    }
}
