//! Configuration Document
//!
//! Loads the hierarchical configuration document that declares every
//! resource (credentials, databases, services, integrations), the backend
//! candidates per capability, and the engine's own settings.

use crate::backend::CapabilityConfig;
use crate::error::EngineError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit configuration path
pub const CONFIG_ENV_VAR: &str = "STRATUM_CONFIG";

/// File name looked up in the working directory
const LOCAL_CONFIG_FILE: &str = "stratum.yaml";

/// Top-level section a descriptor was declared in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    #[serde(alias = "credentials")]
    Credential,
    #[serde(alias = "databases")]
    Database,
    #[serde(alias = "services")]
    Service,
    #[serde(alias = "integrations")]
    Integration,
}

impl Section {
    /// All sections in their default resolution priority
    pub const ALL: [Section; 4] = [
        Section::Credential,
        Section::Database,
        Section::Service,
        Section::Integration,
    ];

    /// Key of this section in the configuration document
    pub fn key(&self) -> &'static str {
        match self {
            Self::Credential => "credentials",
            Self::Database => "databases",
            Self::Service => "services",
            Self::Integration => "integrations",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::Database => "database",
            Self::Service => "service",
            Self::Integration => "integration",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine settings from the `engine` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Which section wins when two sections declare the same id
    pub section_priority: Vec<Section>,
    /// Where the snapshot is written (defaults to the user data dir)
    pub snapshot_path: Option<PathBuf>,
    /// Set to false to skip snapshot writes entirely
    pub snapshot_enabled: bool,
    /// Upper bound for one ambient identity lookup
    pub identity_timeout_ms: u64,
    /// Prefix of scoped `<PREFIX>_<ID>_<FIELD>` override variables
    pub env_prefix: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            section_priority: Section::ALL.to_vec(),
            snapshot_path: None,
            snapshot_enabled: true,
            identity_timeout_ms: 2000,
            env_prefix: "STRATUM".to_string(),
        }
    }
}

impl EngineSettings {
    /// Effective snapshot path
    pub fn snapshot_path(&self) -> PathBuf {
        if let Some(path) = &self.snapshot_path {
            return path.clone();
        }
        dirs::data_dir()
            .map(|p| p.join("stratum").join("snapshot.jsonl"))
            .unwrap_or_else(|| PathBuf::from("stratum-snapshot.jsonl"))
    }

    /// Section priority with any section the document omitted appended last
    pub fn effective_section_priority(&self) -> Vec<Section> {
        let mut order = Vec::with_capacity(Section::ALL.len());
        for section in self.section_priority.iter().chain(Section::ALL.iter()) {
            if !order.contains(section) {
                order.push(*section);
            }
        }
        order
    }
}

/// An entry that was rejected while loading the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    pub section: Section,
    pub id: String,
    pub reason: String,
}

/// The parsed configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default, deserialize_with = "section_map")]
    pub credentials: Map<String, Value>,
    #[serde(default, deserialize_with = "section_map")]
    pub databases: Map<String, Value>,
    #[serde(default, deserialize_with = "section_map")]
    pub services: Map<String, Value>,
    #[serde(default, deserialize_with = "section_map")]
    pub integrations: Map<String, Value>,
    /// Candidate backends per logical capability
    #[serde(default)]
    pub backends: BTreeMap<String, CapabilityConfig>,
    #[serde(default)]
    pub engine: EngineSettings,
    /// Entries rejected by structural validation
    #[serde(skip)]
    pub issues: Vec<ConfigIssue>,
}

/// An empty (`null`) section is accepted as an empty mapping
fn section_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Document format, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

impl ConfigDocument {
    /// Parse a document from text
    pub fn parse(content: &str, format: Format) -> Result<Self, String> {
        let mut doc: Self = match format {
            Format::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string())?,
            Format::Json => serde_json::from_str(content).map_err(|e| e.to_string())?,
        };
        doc.reject_non_mapping_entries();
        for (capability, config) in doc.backends.iter_mut() {
            config.drop_duplicate_candidates(capability);
        }
        Ok(doc)
    }

    /// Read and parse the document at `path`
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let doc = Self::parse(&content, Format::from_path(path)).map_err(|message| {
            EngineError::ConfigParse {
                path: path.to_path_buf(),
                message,
            }
        })?;

        tracing::info!(
            "Loaded configuration from {:?} ({} entries, {} capabilities)",
            path,
            doc.entry_count(),
            doc.backends.len()
        );
        Ok(doc)
    }

    /// Entries of one section
    pub fn section(&self, section: Section) -> &Map<String, Value> {
        match section {
            Section::Credential => &self.credentials,
            Section::Database => &self.databases,
            Section::Service => &self.services,
            Section::Integration => &self.integrations,
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut Map<String, Value> {
        match section {
            Section::Credential => &mut self.credentials,
            Section::Database => &mut self.databases,
            Section::Service => &mut self.services,
            Section::Integration => &mut self.integrations,
        }
    }

    /// Total number of entries across all sections
    pub fn entry_count(&self) -> usize {
        Section::ALL.iter().map(|s| self.section(*s).len()).sum()
    }

    /// Drop entries that are not mappings, recording why
    fn reject_non_mapping_entries(&mut self) {
        for section in Section::ALL {
            let rejected: Vec<String> = self
                .section(section)
                .iter()
                .filter(|(_, v)| !v.is_object())
                .map(|(id, _)| id.clone())
                .collect();

            for id in rejected {
                tracing::warn!("Rejected {}.{}: entry is not a mapping", section.key(), id);
                self.section_mut(section).remove(&id);
                self.issues.push(ConfigIssue {
                    section,
                    id,
                    reason: "entry is not a mapping".to_string(),
                });
            }
        }
    }
}

/// Where the engine reads its configuration from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Re-read from disk on every refresh
    File(PathBuf),
    /// Fixed in-memory document
    Document(Box<ConfigDocument>),
}

impl ConfigSource {
    /// Load the current document
    pub fn load(&self) -> Result<ConfigDocument, EngineError> {
        match self {
            Self::File(path) => ConfigDocument::load(path),
            Self::Document(doc) => Ok((**doc).clone()),
        }
    }
}

/// Conventional locations, in lookup order
pub fn search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(path) = explicit {
        paths.push(path.to_path_buf());
        return paths;
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            paths.push(PathBuf::from(path));
        }
    }
    paths.push(PathBuf::from(LOCAL_CONFIG_FILE));
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("stratum").join("config.yaml"));
        paths.push(dir.join("stratum").join("config.json"));
    }
    paths
}

/// Find the configuration document (explicit > env var > cwd > config dir)
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, EngineError> {
    let searched = search_paths(explicit);
    searched
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or(EngineError::ConfigNotFound { searched })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
credentials:
  primary_db:
    type: database_credentials
    host: db.internal
    port: 5432
  broken: "just a string"
databases:
services: {}
integrations:
  slack:
    type: webhook
    enabled: true
engine:
  section_priority: [databases]
"#;

    #[test]
    fn test_parse_yaml_document() {
        let doc = ConfigDocument::parse(SAMPLE, Format::Yaml).unwrap();
        assert_eq!(doc.credentials.len(), 1);
        assert!(doc.databases.is_empty());
        assert_eq!(doc.integrations.len(), 1);
        assert_eq!(doc.credentials["primary_db"]["port"], 5432);
    }

    #[test]
    fn test_non_mapping_entries_rejected() {
        let doc = ConfigDocument::parse(SAMPLE, Format::Yaml).unwrap();
        assert!(!doc.credentials.contains_key("broken"));
        assert_eq!(doc.issues.len(), 1);
        assert_eq!(doc.issues[0].id, "broken");
        assert_eq!(doc.issues[0].section, Section::Credential);
    }

    #[test]
    fn test_duplicate_candidates_dropped_at_load() {
        let doc = ConfigDocument::parse(
            r#"
backends:
  tracking:
    candidates:
      - { name: a, ref: svc_a, priority: 1 }
      - { name: a, ref: svc_b, priority: 2 }
"#,
            Format::Yaml,
        )
        .unwrap();
        let candidates = &doc.backends["tracking"].candidates;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].descriptor_ref, "svc_a");
    }

    #[test]
    fn test_non_mapping_section_is_parse_error() {
        let result = ConfigDocument::parse("credentials: [1, 2]", Format::Yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_section_priority_is_completed() {
        let doc = ConfigDocument::parse(SAMPLE, Format::Yaml).unwrap();
        let order = doc.engine.effective_section_priority();
        assert_eq!(
            order,
            vec![
                Section::Database,
                Section::Credential,
                Section::Service,
                Section::Integration
            ]
        );
    }

    #[test]
    fn test_json_document() {
        let doc = ConfigDocument::parse(
            r#"{"services": {"llm": {"type": "model_service", "provider": "openai"}}}"#,
            Format::Json,
        )
        .unwrap();
        assert_eq!(doc.services["llm"]["provider"], "openai");
        assert!(doc.engine.snapshot_enabled);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path(Path::new("a/config.json")), Format::Json);
        assert_eq!(Format::from_path(Path::new("a/config.yml")), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("config")), Format::Yaml);
    }

    #[test]
    fn test_locate_explicit_missing() {
        let err = locate(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, EngineError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let doc = ConfigDocument::load(&path).unwrap();
        assert_eq!(doc.entry_count(), 2);
        assert_eq!(locate(Some(path.as_path())).unwrap(), path);
    }

    #[test]
    fn test_load_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "credentials: [unclosed").unwrap();

        let err = ConfigDocument::load(&path).unwrap_err();
        assert!(matches!(err, EngineError::ConfigParse { .. }));
    }
}
