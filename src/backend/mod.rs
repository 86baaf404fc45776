//! Backend selection
//!
//! A logical capability (a tracking store, a telemetry sink, a cache) can be
//! served by several interchangeable backends. Each candidate references a
//! resolved bundle for its connection parameters; the selector probes the
//! candidates under a bounded timeout and keeps track of which one is in use.
//!
//! # Module Structure
//!
//! - [`probe`] - The `Probe` trait and the http/tcp/file probes
//! - [`selector`] - Per-capability selection state machine
//!
//! # Example
//!
//! ```yaml
//! backends:
//!   tracking:
//!     policy: sequential
//!     timeout_ms: 3000
//!     candidates:
//!       - { name: mlflow, kind: http, priority: 1, ref: mlflow_server }
//!       - { name: local, kind: file, priority: 2, ref: local_runs }
//! ```

pub mod probe;
pub mod selector;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use probe::{AutoProbe, FileProbe, HttpProbe, Probe, ProbeRegistry, TcpProbe};
pub use selector::{BackendSelector, BackendStatus, CandidateStatus, SelectionPhase};

/// Default per-probe timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default number of probes in flight for the parallel policies
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// One interchangeable backend for a capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCandidate {
    pub name: String,
    /// Probe kind (`http`, `tcp`, `file`, ...)
    #[serde(default)]
    pub kind: String,
    /// Lower values are preferred
    #[serde(default)]
    pub priority: i64,
    /// Id of the descriptor supplying connection parameters
    #[serde(rename = "ref", alias = "descriptor_ref")]
    pub descriptor_ref: String,
}

/// How candidates are searched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// One probe at a time in priority order; stop at the first success
    #[default]
    Sequential,
    /// Probes run concurrently, but the earliest-priority success wins
    OrderedParallel,
    /// Probes run concurrently and the first observed success wins
    FirstResponder,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

/// Candidates and search settings for one capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default)]
    pub policy: SelectionPolicy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub candidates: Vec<BackendCandidate>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            candidates: Vec::new(),
        }
    }
}

impl CapabilityConfig {
    /// Candidates sorted by priority; ties keep declaration order
    ///
    /// Names are unique: only the first declaration of a name is kept.
    pub fn ordered_candidates(&self) -> Vec<BackendCandidate> {
        let mut seen = HashSet::new();
        let mut candidates: Vec<BackendCandidate> = self
            .candidates
            .iter()
            .filter(|c| seen.insert(c.name.as_str()))
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.priority);
        candidates
    }

    /// Drop later declarations of an already used candidate name
    ///
    /// Returns the names that were dropped.
    pub fn drop_duplicate_candidates(&mut self, capability: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut dropped = Vec::new();
        self.candidates.retain(|c| {
            if seen.insert(c.name.clone()) {
                return true;
            }
            tracing::warn!(
                "Capability '{}' declares candidate '{}' more than once; keeping the first",
                capability,
                c.name
            );
            dropped.push(c.name.clone());
            false
        });
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_config_defaults() {
        let config: CapabilityConfig = serde_yaml::from_str(
            r#"
candidates:
  - { name: b, kind: http, priority: 2, ref: svc_b }
  - { name: a, kind: tcp, priority: 1, ref: svc_a }
  - { name: c, priority: 2, descriptor_ref: svc_c }
"#,
        )
        .unwrap();

        assert_eq!(config.policy, SelectionPolicy::Sequential);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        let names: Vec<String> = config
            .ordered_candidates()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_candidate_names_keep_first() {
        let mut config: CapabilityConfig = serde_yaml::from_str(
            r#"
candidates:
  - { name: mlflow, kind: http, priority: 2, ref: mlflow_primary }
  - { name: local, kind: file, priority: 3, ref: local_runs }
  - { name: mlflow, kind: http, priority: 1, ref: mlflow_replica }
"#,
        )
        .unwrap();

        let ordered = config.ordered_candidates();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].descriptor_ref, "mlflow_primary");

        assert_eq!(config.drop_duplicate_candidates("tracking"), vec!["mlflow"]);
        assert_eq!(config.candidates.len(), 2);
        assert!(config.drop_duplicate_candidates("tracking").is_empty());
    }

    #[test]
    fn test_policy_names() {
        let policy: SelectionPolicy = serde_yaml::from_str("ordered_parallel").unwrap();
        assert_eq!(policy, SelectionPolicy::OrderedParallel);
        let policy: SelectionPolicy = serde_yaml::from_str("first_responder").unwrap();
        assert_eq!(policy, SelectionPolicy::FirstResponder);
    }
}
