//! Override Layer
//!
//! Layers field values on top of what the configuration file declared:
//! file < environment < ambient runtime identity. The ambient identity never
//! replaces a field an environment variable set in the same pass.

use super::bundle::{Provenance, ResolvedBundle};
use super::extract::{DATABASE_KINDS, GENERIC_KIND_KEY};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Binds one environment variable to one field of some kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRule {
    pub env_var: String,
    pub target_field: String,
    pub applicable_kinds: BTreeSet<String>,
}

impl OverrideRule {
    pub fn new(env_var: &str, target_field: &str, kinds: &[&str]) -> Self {
        Self {
            env_var: env_var.to_string(),
            target_field: target_field.to_string(),
            applicable_kinds: kinds.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn applies_to(&self, kind: &str) -> bool {
        self.applicable_kinds.contains(kind)
    }
}

/// The recognized variables. Earlier rules win for the same field.
pub fn default_rules() -> Vec<OverrideRule> {
    const AWS: &[&str] = &["aws_credentials"];
    const GCP: &[&str] = &["gcp_credentials"];
    const AZURE: &[&str] = &["azure_credentials"];

    vec![
        OverrideRule::new("AWS_ACCESS_KEY_ID", "access_key_id", AWS),
        OverrideRule::new("AWS_SECRET_ACCESS_KEY", "secret_access_key", AWS),
        OverrideRule::new("AWS_SESSION_TOKEN", "session_token", AWS),
        OverrideRule::new("AWS_REGION", "region", AWS),
        OverrideRule::new("AWS_DEFAULT_REGION", "region", AWS),
        OverrideRule::new("GOOGLE_CLOUD_PROJECT", "project_id", GCP),
        OverrideRule::new("CLOUDSDK_CORE_PROJECT", "project_id", GCP),
        OverrideRule::new("GCLOUD_PROJECT", "project_id", GCP),
        OverrideRule::new("GOOGLE_APPLICATION_CREDENTIALS", "credentials_file", GCP),
        OverrideRule::new("AZURE_CLIENT_ID", "client_id", AZURE),
        OverrideRule::new("AZURE_TENANT_ID", "tenant_id", AZURE),
        OverrideRule::new("AZURE_CLIENT_SECRET", "client_secret", AZURE),
        OverrideRule::new("AZURE_SUBSCRIPTION_ID", "subscription_id", AZURE),
        OverrideRule::new("DB_HOST", "host", DATABASE_KINDS),
        OverrideRule::new("DB_PORT", "port", DATABASE_KINDS),
        OverrideRule::new("DB_NAME", "database", DATABASE_KINDS),
        OverrideRule::new("DB_USER", "username", DATABASE_KINDS),
        OverrideRule::new("DB_PASSWORD", "password", DATABASE_KINDS),
    ]
}

/// Read access to environment variables
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment; empty values count as unset
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).filter(|v| !v.is_empty()).cloned()
    }
}

/// Name of the scoped override variable for one field of one descriptor
///
/// `scoped_var_name("STRATUM", "primary-db", "password")` is
/// `STRATUM_PRIMARY_DB_PASSWORD`.
pub fn scoped_var_name(prefix: &str, id: &str, field: &str) -> String {
    let normalize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("{}_{}_{}", normalize(prefix), normalize(id), normalize(field))
}

/// Convert a variable's text to the type the field already has
fn coerce(field: &str, existing: Option<&Value>, raw: String) -> Value {
    match existing {
        Some(Value::Number(_)) => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.trim().parse::<f64>().map(Value::from))
            .unwrap_or(Value::String(raw)),
        Some(Value::Bool(_)) => raw
            .trim()
            .parse::<bool>()
            .map(Value::Bool)
            .unwrap_or(Value::String(raw)),
        None if field == "port" => raw
            .trim()
            .parse::<u16>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        _ => Value::String(raw),
    }
}

/// Apply the environment layer to one bundle
///
/// Table rules run first in order; a field written by an earlier rule is not
/// rewritten by a later one. Scoped `<PREFIX>_<ID>_<FIELD>` variables then
/// override any scalar field already in the bundle. Returns the fields
/// written.
pub fn apply_env_overrides(
    bundle: &mut ResolvedBundle,
    rules: &[OverrideRule],
    env: &dyn EnvSource,
    prefix: &str,
) -> Vec<String> {
    let mut written: HashSet<String> = HashSet::new();
    let kind = bundle.kind.clone();

    for rule in rules.iter().filter(|r| r.applies_to(&kind)) {
        if written.contains(&rule.target_field) {
            continue;
        }
        let Some(raw) = env.var(&rule.env_var) else {
            continue;
        };
        let value = coerce(&rule.target_field, bundle.fields.get(&rule.target_field), raw);
        bundle.set_field(&rule.target_field, value, Provenance::Environment);
        written.insert(rule.target_field.clone());
        tracing::debug!(
            "{}.{} overridden from ${}",
            bundle.descriptor_id,
            rule.target_field,
            rule.env_var
        );
    }

    let scalar_fields: Vec<String> = bundle
        .fields
        .iter()
        .filter(|(name, value)| !value.is_object() && name.as_str() != GENERIC_KIND_KEY)
        .map(|(name, _)| name.clone())
        .collect();

    for field in scalar_fields {
        let var = scoped_var_name(prefix, &bundle.descriptor_id, &field);
        let Some(raw) = env.var(&var) else {
            continue;
        };
        let value = coerce(&field, bundle.fields.get(&field), raw);
        bundle.set_field(&field, value, Provenance::Environment);
        tracing::debug!("{}.{} overridden from ${}", bundle.descriptor_id, field, var);
        written.insert(field);
    }

    let mut written: Vec<String> = written.into_iter().collect();
    written.sort();
    written
}

/// Apply ambient identity values to fields the environment did not set
pub fn apply_identity(bundle: &mut ResolvedBundle, identity: &Map<String, Value>) -> Vec<String> {
    let mut written = Vec::new();
    for (field, value) in identity {
        if bundle.provenance_of(field) == Some(Provenance::Environment) {
            tracing::debug!(
                "{}.{} keeps environment value over ambient identity",
                bundle.descriptor_id,
                field
            );
            continue;
        }
        bundle.set_field(field, value.clone(), Provenance::RuntimeIdentity);
        written.push(field.clone());
    }
    written
}
