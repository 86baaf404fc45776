//! Validator
//!
//! Minimal completeness check per kind. Validity is a pure function of the
//! bundle's current fields and kind; it is recomputed, never cached.

use super::bundle::ResolvedBundle;
use super::extract::DATABASE_KINDS;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Returns true when the fields are complete enough to use
pub type ValidatorFn = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// Kinds whose bundle is valid iff one of the listed fields is non-empty
const REQUIRED_ANY_OF: &[(&str, &[&str])] = &[
    ("aws_credentials", &["access_key_id"]),
    ("gcp_credentials", &["project_id"]),
    ("azure_credentials", &["client_id"]),
    ("api_key", &["api_key"]),
    ("external_api", &["endpoint", "base_url", "url"]),
    ("http_service", &["endpoint", "base_url", "url"]),
    ("webhook", &["url", "endpoint"]),
    ("model_service", &["provider", "category"]),
    ("llm_service", &["provider", "category"]),
    ("tracking_service", &["provider", "category"]),
];

/// True for non-null scalars, non-blank strings and non-empty containers
pub fn has_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Bool(_)) | Some(Value::Number(_)) => true,
    }
}

fn any_of(fields: &'static [&'static str]) -> ValidatorFn {
    Arc::new(move |map: &Map<String, Value>| fields.iter().any(|f| has_value(map.get(*f))))
}

/// Kind -> completeness check, defaulting to "fields non-empty"
#[derive(Clone)]
pub struct Validator {
    checks: HashMap<String, ValidatorFn>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("kinds", &self.checks.len())
            .finish()
    }
}

impl Validator {
    pub fn with_builtins() -> Self {
        let mut checks = HashMap::new();
        for (kind, fields) in REQUIRED_ANY_OF {
            checks.insert(kind.to_string(), any_of(fields));
        }
        for kind in DATABASE_KINDS {
            checks.insert(kind.to_string(), any_of(&["host"]));
        }
        Self { checks }
    }

    /// Register (or replace) the check for `kind`
    pub fn register(&mut self, kind: &str, check: ValidatorFn) {
        self.checks.insert(kind.to_string(), check);
    }

    pub fn is_valid(&self, kind: &str, fields: &Map<String, Value>) -> bool {
        match self.checks.get(kind) {
            Some(check) => check(fields),
            None => !fields.is_empty(),
        }
    }

    pub fn validate(&self, bundle: &ResolvedBundle) -> bool {
        self.is_valid(&bundle.kind, &bundle.fields)
    }
}
