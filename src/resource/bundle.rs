//! Resolved bundles and field provenance

use crate::config::Section;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Which layer last wrote a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    ConfigFile,
    Environment,
    RuntimeIdentity,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigFile => "config-file",
            Self::Environment => "environment",
            Self::RuntimeIdentity => "runtime-identity",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized fields of one descriptor after extraction and overrides
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedBundle {
    pub descriptor_id: String,
    pub kind: String,
    pub section: Section,
    pub enabled: bool,
    pub fields: Map<String, Value>,
    pub provenance: BTreeMap<String, Provenance>,
    /// Stamped by the validator on every pass
    pub valid: bool,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedBundle {
    /// Write a field and record who wrote it
    pub fn set_field(&mut self, field: &str, value: Value, provenance: Provenance) {
        self.fields.insert(field.to_string(), value);
        self.provenance.insert(field.to_string(), provenance);
    }

    pub fn provenance_of(&self, field: &str) -> Option<Provenance> {
        self.provenance.get(field).copied()
    }

    /// First non-empty string among `names`
    pub fn str_field(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| {
            self.fields
                .get(*name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
    }

    /// Field as a port number, accepting numbers and numeric strings
    pub fn port_field(&self, name: &str) -> Option<u16> {
        match self.fields.get(name)? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Count of fields per provenance layer
    pub fn provenance_summary(&self) -> ProvenanceSummary {
        let mut summary = ProvenanceSummary::default();
        for provenance in self.provenance.values() {
            match provenance {
                Provenance::ConfigFile => summary.config_file += 1,
                Provenance::Environment => summary.environment += 1,
                Provenance::RuntimeIdentity => summary.runtime_identity += 1,
            }
        }
        summary
    }
}

/// How many fields each layer contributed to a bundle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProvenanceSummary {
    pub config_file: usize,
    pub environment: usize,
    pub runtime_identity: usize,
}

impl fmt::Display for ProvenanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            (Provenance::ConfigFile, self.config_file),
            (Provenance::Environment, self.environment),
            (Provenance::RuntimeIdentity, self.runtime_identity),
        ]
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(layer, count)| format!("{}({})", layer, count))
        .collect();

        if parts.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&parts.join("+"))
        }
    }
}
