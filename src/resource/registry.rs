//! Resolved state
//!
//! One immutable result of a discovery pass: the descriptor registry, the
//! resolved bundles and any rejected entries. The engine swaps whole states
//! in; a state is never mutated after it is built.

use super::bundle::{ProvenanceSummary, ResolvedBundle};
use super::descriptor::DescriptorRegistry;
use super::validate::Validator;
use crate::config::ConfigIssue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Availability of one resource as reported by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatus {
    pub kind: String,
    /// Discovered and not disabled
    pub available: bool,
    pub valid: bool,
    pub source: ProvenanceSummary,
}

/// Result of one discovery pass
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedState {
    pub pass_id: Uuid,
    pub resolved_at: DateTime<Utc>,
    pub descriptors: DescriptorRegistry,
    pub bundles: BTreeMap<String, ResolvedBundle>,
    pub issues: Vec<ConfigIssue>,
}

impl Default for ResolvedState {
    fn default() -> Self {
        Self {
            pass_id: Uuid::nil(),
            resolved_at: Utc::now(),
            descriptors: DescriptorRegistry::default(),
            bundles: BTreeMap::new(),
            issues: Vec::new(),
        }
    }
}

impl ResolvedState {
    pub fn new(
        descriptors: DescriptorRegistry,
        bundles: BTreeMap<String, ResolvedBundle>,
        issues: Vec<ConfigIssue>,
    ) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            resolved_at: Utc::now(),
            descriptors,
            bundles,
            issues,
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<&ResolvedBundle> {
        self.bundles.get(id)
    }

    pub fn get_by_kind(&self, kind: &str) -> BTreeMap<String, ResolvedBundle> {
        self.bundles
            .iter()
            .filter(|(_, b)| b.kind == kind)
            .map(|(id, b)| (id.clone(), b.clone()))
            .collect()
    }

    /// Per-resource status; validity is recomputed from the current fields
    pub fn status(&self, validator: &Validator) -> BTreeMap<String, ResourceStatus> {
        self.bundles
            .iter()
            .map(|(id, bundle)| {
                let status = ResourceStatus {
                    kind: bundle.kind.clone(),
                    available: bundle.enabled,
                    valid: validator.validate(bundle),
                    source: bundle.provenance_summary(),
                };
                (id.clone(), status)
            })
            .collect()
    }

    /// Count of (valid, invalid) bundles
    pub fn validity_counts(&self, validator: &Validator) -> (usize, usize) {
        let valid = self
            .bundles
            .values()
            .filter(|b| validator.validate(b))
            .count();
        (valid, self.bundles.len() - valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigDocument, Format};
    use crate::resource::descriptor::discover;
    use crate::resource::extract::ExtractorRegistry;

    fn state() -> ResolvedState {
        let doc = ConfigDocument::parse(
            r#"
databases:
  a: { type: postgres, host: a }
  b: { type: postgres }
  c: { type: redis, host: c, enabled: false }
"#,
            Format::Yaml,
        )
        .unwrap();
        let descriptors = discover(&doc);
        let extractors = ExtractorRegistry::with_builtins();
        let validator = Validator::with_builtins();
        let bundles = descriptors
            .iter()
            .map(|d| {
                let mut b = extractors.extract(d);
                b.valid = validator.validate(&b);
                (d.id.clone(), b)
            })
            .collect();
        ResolvedState::new(descriptors, bundles, doc.issues)
    }

    #[test]
    fn test_get_by_kind() {
        let state = state();
        let postgres = state.get_by_kind("postgres");
        assert_eq!(postgres.len(), 2);
        assert!(postgres.contains_key("a"));
        assert!(state.get_by_kind("mysql").is_empty());
    }

    #[test]
    fn test_status_recomputes_validity() {
        let mut state = state();
        let validator = Validator::with_builtins();

        // A stale flag must not leak into status output
        if let Some(b) = state.bundles.get_mut("b") {
            b.valid = true;
        }
        let status = state.status(&validator);
        assert!(status["a"].valid);
        assert!(!status["b"].valid);
        assert!(!status["c"].available);
        assert_eq!(state.validity_counts(&validator), (2, 1));
    }
}
