//! Type Extractors
//!
//! Maps a descriptor's kind to the function that normalizes its raw fields.
//! Kinds without a registered extractor go through the generic extractor,
//! which keeps the whole raw payload so new kinds need no code change.

use super::bundle::{Provenance, ResolvedBundle};
use super::descriptor::Descriptor;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Normalizes a descriptor's raw config into bundle fields
///
/// Extractors must be total: missing fields are omitted, never an error.
pub type ExtractorFn = Arc<dyn Fn(&Descriptor) -> Map<String, Value> + Send + Sync>;

/// Key under which the generic extractor stores the raw payload
pub const GENERIC_CONFIG_KEY: &str = "config";

/// Key under which the generic extractor stores the kind
pub const GENERIC_KIND_KEY: &str = "kind";

// =============================================================================
// Built-in kind tables
// =============================================================================

/// Credential-style kinds and the fields they keep
const CREDENTIAL_KINDS: &[(&str, &[&str])] = &[
    (
        "aws_credentials",
        &["access_key_id", "secret_access_key", "session_token", "region", "profile", "role_arn"],
    ),
    (
        "gcp_credentials",
        &["project_id", "credentials_file", "service_account", "access_token", "region", "zone"],
    ),
    (
        "azure_credentials",
        &["client_id", "client_secret", "tenant_id", "subscription_id"],
    ),
    ("api_key", &["api_key", "provider", "organization", "key_id"]),
];

/// Database-style kinds
pub const DATABASE_KINDS: &[&str] = &[
    "database_credentials",
    "postgres",
    "postgresql",
    "mysql",
    "redis",
    "mongodb",
];

const DATABASE_FIELDS: &[&str] = &[
    "host", "port", "database", "username", "password", "ssl_mode", "schema", "url",
];

/// Alternative spellings accepted for database fields
const DATABASE_ALIASES: &[(&str, &str)] = &[
    ("user", "username"),
    ("dbname", "database"),
    ("db", "database"),
    ("hostname", "host"),
    ("dsn", "url"),
    ("sslmode", "ssl_mode"),
];

/// External API kinds
const EXTERNAL_API_KINDS: &[&str] = &["external_api", "http_service", "webhook"];

const EXTERNAL_API_FIELDS: &[&str] = &[
    "endpoint", "base_url", "url", "health_url", "health_path", "api_key", "token", "auth_type",
    "timeout", "headers",
];

/// Composite service kinds carrying an embedded sub-model
const COMPOSITE_KINDS: &[&str] = &["model_service", "llm_service", "tracking_service"];

const COMPOSITE_FIELDS: &[&str] = &[
    "provider", "category", "endpoint", "base_url", "api_key", "region", "path", "model",
];

/// Nested objects whose fields are pulled up one level
const SUBMODEL_KEYS: &[&str] = &["model", "settings"];

// =============================================================================
// Registry
// =============================================================================

/// Kind -> extractor table with a generic fallback
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, ExtractorFn>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.extractors.keys().collect();
        kinds.sort();
        f.debug_struct("ExtractorRegistry").field("kinds", &kinds).finish()
    }
}

impl ExtractorRegistry {
    /// Registry with no kinds; everything uses the generic extractor
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Registry with the credential, database, external API and composite
    /// service extractors
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();

        for (kind, fields) in CREDENTIAL_KINDS {
            let fields: &'static [&'static str] = fields;
            registry.register(
                kind,
                Arc::new(move |d: &Descriptor| copy_allowed(&d.raw_config, fields)),
            );
        }
        for kind in DATABASE_KINDS {
            registry.register(kind, Arc::new(extract_database));
        }
        for kind in EXTERNAL_API_KINDS {
            registry.register(
                kind,
                Arc::new(|d: &Descriptor| copy_allowed(&d.raw_config, EXTERNAL_API_FIELDS)),
            );
        }
        for kind in COMPOSITE_KINDS {
            registry.register(kind, Arc::new(extract_composite));
        }

        registry
    }

    /// Register (or replace) the extractor for `kind`
    pub fn register(&mut self, kind: &str, extractor: ExtractorFn) {
        self.extractors.insert(kind.to_string(), extractor);
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.extractors.contains_key(kind)
    }

    /// Resolve a descriptor into a bundle with file provenance
    pub fn extract(&self, descriptor: &Descriptor) -> ResolvedBundle {
        let fields = match self.extractors.get(&descriptor.kind) {
            Some(extractor) => extractor(descriptor),
            None => {
                tracing::debug!(
                    "No extractor for kind '{}', using generic extractor for '{}'",
                    descriptor.kind,
                    descriptor.id
                );
                extract_generic(descriptor)
            }
        };

        let provenance: BTreeMap<String, Provenance> = fields
            .keys()
            .map(|k| (k.clone(), Provenance::ConfigFile))
            .collect();

        ResolvedBundle {
            descriptor_id: descriptor.id.clone(),
            kind: descriptor.kind.clone(),
            section: descriptor.section,
            enabled: descriptor.enabled,
            fields,
            provenance,
            valid: false,
            resolved_at: Utc::now(),
        }
    }
}

// =============================================================================
// Extractors
// =============================================================================

/// Copy allow-listed, non-null fields
fn copy_allowed(raw: &Map<String, Value>, allowed: &[&str]) -> Map<String, Value> {
    allowed
        .iter()
        .filter_map(|name| {
            raw.get(*name)
                .filter(|v| !v.is_null())
                .map(|v| (name.to_string(), v.clone()))
        })
        .collect()
}

/// Keep the whole payload plus the literal kind
pub fn extract_generic(descriptor: &Descriptor) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        GENERIC_KIND_KEY.to_string(),
        Value::String(descriptor.kind.clone()),
    );
    fields.insert(
        GENERIC_CONFIG_KEY.to_string(),
        Value::Object(descriptor.raw_config.clone()),
    );
    fields
}

/// View of a generic bundle with its raw payload lifted to the top level
///
/// Consumers that look fields up by name (probes, for instance) use this so
/// kinds without an extractor still expose `host`, `endpoint` and so on.
pub fn lift_generic(bundle: &ResolvedBundle) -> ResolvedBundle {
    let mut lifted = bundle.clone();
    let is_generic = bundle.fields.get(GENERIC_KIND_KEY).and_then(Value::as_str)
        == Some(bundle.kind.as_str());
    if let (true, Some(Value::Object(payload))) =
        (is_generic, bundle.fields.get(GENERIC_CONFIG_KEY))
    {
        for (name, value) in payload {
            lifted.fields.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }
    lifted
}

/// Database fields, with aliases normalized and host/port/database
/// recovered from a connection URL when not given explicitly
fn extract_database(descriptor: &Descriptor) -> Map<String, Value> {
    let mut raw = descriptor.raw_config.clone();
    for (alias, canonical) in DATABASE_ALIASES {
        if !raw.contains_key(*canonical) {
            if let Some(value) = raw.remove(*alias) {
                raw.insert(canonical.to_string(), value);
            }
        }
    }

    let mut fields = copy_allowed(&raw, DATABASE_FIELDS);

    if let Some(conn) = fields.get("url").and_then(Value::as_str) {
        match url::Url::parse(conn) {
            Ok(parsed) => {
                let mut parts = Map::new();
                if let Some(host) = parsed.host_str() {
                    parts.insert("host".to_string(), Value::String(host.to_string()));
                }
                if let Some(port) = parsed.port() {
                    parts.insert("port".to_string(), Value::from(port));
                }
                let database = parsed.path().trim_start_matches('/');
                if !database.is_empty() {
                    parts.insert("database".to_string(), Value::String(database.to_string()));
                }
                if !parsed.username().is_empty() {
                    parts.insert(
                        "username".to_string(),
                        Value::String(parsed.username().to_string()),
                    );
                }
                for (key, value) in parts {
                    fields.entry(key).or_insert(value);
                }
            }
            Err(e) => {
                tracing::debug!("Unparseable connection url for '{}': {}", descriptor.id, e);
            }
        }
    }

    fields
}

/// Composite service: allow-listed top level plus sub-model fields pulled up
fn extract_composite(descriptor: &Descriptor) -> Map<String, Value> {
    let mut fields = copy_allowed(&descriptor.raw_config, COMPOSITE_FIELDS);

    for key in SUBMODEL_KEYS {
        let Some(Value::Object(sub)) = descriptor.raw_config.get(*key) else {
            continue;
        };
        // A nested `model` object is flattened; its name becomes `model`.
        fields.remove(*key);
        for (name, value) in sub {
            if value.is_null() {
                continue;
            }
            let target = if *key == "model" && name == "name" {
                "model".to_string()
            } else {
                name.clone()
            };
            fields.entry(target).or_insert_with(|| value.clone());
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Section;
    use serde_json::json;

    fn descriptor(kind: &str, raw: Value) -> Descriptor {
        Descriptor {
            id: "test".to_string(),
            kind: kind.to_string(),
            section: Section::Credential,
            raw_config: raw.as_object().cloned().unwrap_or_default(),
            enabled: true,
        }
    }

    #[test]
    fn test_credential_allow_list() {
        let registry = ExtractorRegistry::with_builtins();
        let bundle = registry.extract(&descriptor(
            "aws_credentials",
            json!({"access_key_id": "AKIA", "secret_access_key": "s", "comment": "ignored"}),
        ));

        assert_eq!(bundle.fields["access_key_id"], "AKIA");
        assert!(!bundle.fields.contains_key("comment"));
        assert_eq!(
            bundle.provenance_of("secret_access_key"),
            Some(Provenance::ConfigFile)
        );
    }

    #[test]
    fn test_missing_fields_are_omitted() {
        let registry = ExtractorRegistry::with_builtins();
        let bundle = registry.extract(&descriptor("gcp_credentials", json!({"region": null})));
        assert!(bundle.fields.is_empty());
        assert!(bundle.provenance.is_empty());
    }

    #[test]
    fn test_database_aliases_and_url() {
        let registry = ExtractorRegistry::with_builtins();
        let bundle = registry.extract(&descriptor(
            "postgres",
            json!({"url": "postgres://svc@db.internal:6543/orders", "user": "explicit"}),
        ));

        assert_eq!(bundle.fields["host"], "db.internal");
        assert_eq!(bundle.fields["port"], 6543);
        assert_eq!(bundle.fields["database"], "orders");
        assert_eq!(bundle.fields["username"], "explicit");
    }

    #[test]
    fn test_database_explicit_host_wins_over_url() {
        let registry = ExtractorRegistry::with_builtins();
        let bundle = registry.extract(&descriptor(
            "database_credentials",
            json!({"host": "primary", "url": "mysql://replica:3306/app"}),
        ));
        assert_eq!(bundle.fields["host"], "primary");
        assert_eq!(bundle.fields["port"], 3306);
    }

    #[test]
    fn test_composite_flattens_submodel() {
        let registry = ExtractorRegistry::with_builtins();
        let bundle = registry.extract(&descriptor(
            "model_service",
            json!({
                "category": "llm",
                "model": {"name": "gpt-4o", "provider": "openai", "temperature": 0.2}
            }),
        ));

        assert_eq!(bundle.fields["model"], "gpt-4o");
        assert_eq!(bundle.fields["provider"], "openai");
        assert_eq!(bundle.fields["temperature"], 0.2);
        assert_eq!(bundle.fields["category"], "llm");
    }

    #[test]
    fn test_composite_top_level_wins_over_submodel() {
        let registry = ExtractorRegistry::with_builtins();
        let bundle = registry.extract(&descriptor(
            "llm_service",
            json!({"provider": "azure", "settings": {"provider": "openai", "deployment": "d1"}}),
        ));
        assert_eq!(bundle.fields["provider"], "azure");
        assert_eq!(bundle.fields["deployment"], "d1");
    }

    #[test]
    fn test_unknown_kind_uses_generic_extractor() {
        let registry = ExtractorRegistry::with_builtins();
        let raw = json!({"anything": {"nested": [1, 2]}, "flag": true});
        let bundle = registry.extract(&descriptor("quantum_queue", raw.clone()));

        assert_eq!(bundle.fields[GENERIC_KIND_KEY], "quantum_queue");
        assert_eq!(bundle.fields[GENERIC_CONFIG_KEY], raw);
    }

    #[test]
    fn test_lift_generic_payload() {
        let registry = ExtractorRegistry::with_builtins();
        let bundle = registry.extract(&descriptor(
            "mlflow",
            json!({"endpoint": "http://mlflow:5000", "kind": "shadow"}),
        ));
        let lifted = lift_generic(&bundle);
        assert_eq!(lifted.fields["endpoint"], "http://mlflow:5000");
        assert_eq!(lifted.fields[GENERIC_KIND_KEY], "mlflow");

        let typed = registry.extract(&descriptor("api_key", json!({"api_key": "k"})));
        assert_eq!(lift_generic(&typed), typed);
    }

    #[test]
    fn test_registered_extractor_replaces_generic() {
        let mut registry = ExtractorRegistry::with_builtins();
        assert!(!registry.is_registered("queue"));
        registry.register(
            "queue",
            Arc::new(|d: &Descriptor| {
                let mut fields = Map::new();
                if let Some(topic) = d.raw_config.get("topic") {
                    fields.insert("topic".to_string(), topic.clone());
                }
                fields
            }),
        );

        let bundle = registry.extract(&descriptor("queue", json!({"topic": "events", "x": 1})));
        assert_eq!(bundle.fields.len(), 1);
        assert_eq!(bundle.fields["topic"], "events");
    }
}
