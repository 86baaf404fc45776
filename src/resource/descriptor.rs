//! Descriptor Discovery
//!
//! Walks the four resource sections of the configuration document and
//! collects every entry that declares a type tag. There is no catalog of
//! known resources: the `type` field alone decides what an entry is.

use crate::config::{ConfigDocument, Section};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field that marks an entry as a resource and names its kind
pub const TYPE_TAG: &str = "type";

/// Field that gates integrations (and disables other entries)
pub const ENABLED_FIELD: &str = "enabled";

/// A discovered resource definition, not yet resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptor {
    pub id: String,
    pub kind: String,
    pub section: Section,
    /// Entry fields with the type tag removed
    pub raw_config: Map<String, Value>,
    pub enabled: bool,
}

/// A declaration that lost an id collision to a higher-priority section
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Shadowed {
    pub id: String,
    pub kind: String,
    pub section: Section,
    pub winner: Section,
}

/// Flat registry of descriptors keyed by id
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DescriptorRegistry {
    entries: BTreeMap<String, Descriptor>,
    shadowed: Vec<Shadowed>,
}

impl DescriptorRegistry {
    pub fn get(&self, id: &str) -> Option<&Descriptor> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declarations dropped because of duplicate ids
    pub fn shadowed(&self) -> &[Shadowed] {
        &self.shadowed
    }

    /// Descriptors whose id or kind equals `scope`
    pub fn matching<'a>(&'a self, scope: &'a str) -> impl Iterator<Item = &'a Descriptor> + 'a {
        self.entries
            .values()
            .filter(move |d| d.id == scope || d.kind == scope)
    }

    fn insert(&mut self, descriptor: Descriptor) {
        if let Some(existing) = self.entries.get(&descriptor.id) {
            tracing::warn!(
                "Duplicate resource id '{}': {} declaration ({}) shadowed by {} declaration ({})",
                descriptor.id,
                descriptor.section,
                descriptor.kind,
                existing.section,
                existing.kind
            );
            self.shadowed.push(Shadowed {
                id: descriptor.id,
                kind: descriptor.kind,
                section: descriptor.section,
                winner: existing.section,
            });
            return;
        }
        self.entries.insert(descriptor.id.clone(), descriptor);
    }
}

/// Build the descriptor registry from a parsed document
///
/// Sections are visited in the configured priority order so the first
/// declaration of an id wins. Untyped entries and disabled integrations are
/// skipped. The result depends only on `doc`.
pub fn discover(doc: &ConfigDocument) -> DescriptorRegistry {
    let mut registry = DescriptorRegistry::default();

    for section in doc.engine.effective_section_priority() {
        for (id, entry) in doc.section(section) {
            if let Some(descriptor) = descriptor_from_entry(section, id, entry) {
                registry.insert(descriptor);
            }
        }
    }

    tracing::debug!(
        "Discovered {} descriptors ({} shadowed)",
        registry.len(),
        registry.shadowed.len()
    );
    registry
}

fn descriptor_from_entry(section: Section, id: &str, entry: &Value) -> Option<Descriptor> {
    let fields = entry.as_object()?;

    let Some(kind) = fields
        .get(TYPE_TAG)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
    else {
        tracing::debug!("Skipping {}.{}: no type tag", section.key(), id);
        return None;
    };

    let enabled = fields.get(ENABLED_FIELD).and_then(Value::as_bool);
    if section == Section::Integration && enabled != Some(true) {
        tracing::debug!("Skipping integration '{}': not enabled", id);
        return None;
    }

    let mut raw_config = fields.clone();
    raw_config.remove(TYPE_TAG);

    Some(Descriptor {
        id: id.to_string(),
        kind: kind.to_string(),
        section,
        raw_config,
        enabled: enabled.unwrap_or(true),
    })
}
