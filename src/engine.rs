//! Resolution Engine
//!
//! The object external collaborators hold on to. It owns the configuration
//! source, the resolution pipeline, the current resolved state and one
//! backend selector per configured capability.
//!
//! # Concurrency
//!
//! Refresh is single-writer: a pass builds a complete new [`ResolvedState`]
//! and swaps it in, so readers only ever see whole states and never wait on
//! each other. Backend operations read whichever state is current when they
//! start.

use crate::backend::{BackendSelector, BackendStatus, Probe, ProbeRegistry};
use crate::config::{locate, ConfigDocument, ConfigIssue, ConfigSource};
use crate::error::EngineError;
use crate::identity::{AmbientIdentity, GcpAmbientIdentity, NoIdentity};
use crate::resource::{
    default_rules, discover, EnvSource, ExtractorFn, ExtractorRegistry, OverrideRule, ProcessEnv,
    ResolvedBundle, ResolvedState, Resolver, ResourceStatus, SnapshotWriter, Validator,
    ValidatorFn,
};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

type SelectorMap = BTreeMap<String, Arc<BackendSelector>>;

// ============================================================================
// Reports
// ============================================================================

/// Outcome of a refresh pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub pass_id: Uuid,
    /// Bundles rebuilt by this pass
    pub resolved: usize,
    /// Bundles in the new state
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Declarations lost to duplicate ids
    pub shadowed: usize,
    /// Entries rejected while loading the document
    pub issues: usize,
}

/// Result of `health_check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// All capabilities have a healthy current backend
    pub healthy: bool,
    pub per_capability: BTreeMap<String, bool>,
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles an [`Engine`] with injectable collaborators
pub struct EngineBuilder {
    source: ConfigSource,
    env: Arc<dyn EnvSource>,
    identity: Arc<dyn AmbientIdentity>,
    extractors: ExtractorRegistry,
    validator: Validator,
    rules: Vec<OverrideRule>,
    probes: ProbeRegistry,
    snapshot_path: Option<PathBuf>,
    snapshot_enabled: Option<bool>,
}

impl EngineBuilder {
    /// Builder with process environment, no ambient identity and the
    /// built-in extractor, validator, rule and probe tables
    pub fn new(source: ConfigSource) -> Self {
        Self {
            source,
            env: Arc::new(ProcessEnv),
            identity: Arc::new(NoIdentity),
            extractors: ExtractorRegistry::with_builtins(),
            validator: Validator::with_builtins(),
            rules: default_rules(),
            probes: ProbeRegistry::with_builtins(),
            snapshot_path: None,
            snapshot_enabled: None,
        }
    }

    pub fn env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    pub fn identity(mut self, identity: Arc<dyn AmbientIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn extractor(mut self, kind: &str, extractor: ExtractorFn) -> Self {
        self.extractors.register(kind, extractor);
        self
    }

    pub fn validator(mut self, kind: &str, check: ValidatorFn) -> Self {
        self.validator.register(kind, check);
        self
    }

    /// Append a rule after the built-in table
    pub fn override_rule(mut self, rule: OverrideRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn probe(mut self, kind: &str, probe: Arc<dyn Probe>) -> Self {
        self.probes.register(kind, probe);
        self
    }

    /// Write snapshots to `path` regardless of the document's setting
    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn snapshots_enabled(mut self, enabled: bool) -> Self {
        self.snapshot_enabled = Some(enabled);
        self
    }

    /// Load the document and run the initial discovery pass
    ///
    /// Fails only when the document cannot be read or parsed.
    pub async fn build(self) -> Result<Engine, EngineError> {
        let document = self.source.load()?;

        let resolver = Resolver {
            extractors: self.extractors,
            validator: self.validator,
            rules: self.rules,
            env: self.env,
            identity: self.identity,
            env_prefix: document.engine.env_prefix.clone(),
            identity_timeout: Duration::from_millis(document.engine.identity_timeout_ms),
        };

        let engine = Engine {
            source: self.source,
            resolver,
            probes: Arc::new(self.probes),
            snapshot_path: self.snapshot_path,
            snapshot_enabled: self.snapshot_enabled,
            state: ArcSwap::from_pointee(ResolvedState::default()),
            selectors: ArcSwap::from_pointee(SelectorMap::new()),
            last_snapshot: Mutex::new(None),
            refresh_lock: Mutex::new(()),
        };

        engine.apply(document, None).await;
        Ok(engine)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Configuration-driven resource resolution engine
pub struct Engine {
    source: ConfigSource,
    /// Template; per-pass settings come from the document
    resolver: Resolver,
    probes: Arc<ProbeRegistry>,
    snapshot_path: Option<PathBuf>,
    snapshot_enabled: Option<bool>,
    state: ArcSwap<ResolvedState>,
    selectors: ArcSwap<SelectorMap>,
    last_snapshot: Mutex<Option<JoinHandle<()>>>,
    refresh_lock: Mutex<()>,
}

impl Engine {
    pub fn builder(source: ConfigSource) -> EngineBuilder {
        EngineBuilder::new(source)
    }

    /// Engine over the document found by the conventional path search,
    /// with process environment and Google Cloud ambient identity
    pub async fn from_path(explicit: Option<&Path>) -> Result<Self, EngineError> {
        let path = locate(explicit)?;
        Self::builder(ConfigSource::File(path))
            .identity(Arc::new(GcpAmbientIdentity::new()))
            .build()
            .await
    }

    /// Engine over a fixed in-memory document
    pub async fn from_document(document: ConfigDocument) -> Result<Self, EngineError> {
        Self::builder(ConfigSource::Document(Box::new(document)))
            .build()
            .await
    }

    // ========================================================================
    // Resource queries
    // ========================================================================

    /// The current resolved state
    pub fn state(&self) -> Arc<ResolvedState> {
        self.state.load_full()
    }

    pub fn get_by_kind(&self, kind: &str) -> BTreeMap<String, ResolvedBundle> {
        self.state.load().get_by_kind(kind)
    }

    pub fn get_by_id(&self, id: &str) -> Option<ResolvedBundle> {
        self.state.load().get_by_id(id).cloned()
    }

    pub fn get_status(&self) -> BTreeMap<String, ResourceStatus> {
        self.state.load().status(&self.resolver.validator)
    }

    /// Entries rejected while loading the current document
    pub fn config_issues(&self) -> Vec<ConfigIssue> {
        self.state.load().issues.clone()
    }

    /// Names of all configured capabilities
    pub fn capabilities(&self) -> Vec<String> {
        self.selectors.load().keys().cloned().collect()
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Re-read the document and rebuild every bundle
    ///
    /// When the document cannot be loaded the current state is kept and the
    /// error is returned.
    pub async fn refresh(&self) -> Result<RefreshSummary, EngineError> {
        let _guard = self.refresh_lock.lock().await;
        let document = self.load_document()?;
        Ok(self.apply(document, None).await)
    }

    /// Re-read the document but only rebuild descriptors whose id or kind is
    /// `scope`; other bundles are carried over from the current state
    pub async fn refresh_scope(&self, scope: &str) -> Result<RefreshSummary, EngineError> {
        let _guard = self.refresh_lock.lock().await;
        let document = self.load_document()?;
        Ok(self.apply(document, Some(scope)).await)
    }

    /// Drop every backend selection and rebuild from the source
    pub async fn reset(&self) -> Result<RefreshSummary, EngineError> {
        let _guard = self.refresh_lock.lock().await;
        let document = self.load_document()?;
        self.selectors.store(Arc::new(SelectorMap::new()));
        Ok(self.apply(document, None).await)
    }

    fn load_document(&self) -> Result<ConfigDocument, EngineError> {
        self.source.load().map_err(|e| {
            tracing::error!("Refresh failed, keeping current state: {}", e);
            e
        })
    }

    /// One discovery pass over `document`, swapped in as the current state
    async fn apply(&self, document: ConfigDocument, scope: Option<&str>) -> RefreshSummary {
        let resolver = Resolver {
            env_prefix: document.engine.env_prefix.clone(),
            identity_timeout: Duration::from_millis(document.engine.identity_timeout_ms),
            ..self.resolver.clone()
        };

        let descriptors = discover(&document);
        let previous = self.state.load_full();

        let (mut bundles, rebuilt) = match scope {
            None => {
                let bundles = resolver.resolve(descriptors.iter()).await;
                let rebuilt = bundles.len();
                (bundles, rebuilt)
            }
            Some(scope) => {
                let targets: Vec<_> = descriptors
                    .iter()
                    .filter(|d| {
                        d.id == scope || d.kind == scope || previous.get_by_id(&d.id).is_none()
                    })
                    .collect();
                if descriptors.matching(scope).next().is_none() {
                    tracing::warn!("Refresh scope '{}' matches no resource", scope);
                }
                let fresh = resolver.resolve(targets).await;
                let rebuilt = fresh.len();
                let mut bundles: BTreeMap<String, ResolvedBundle> = descriptors
                    .iter()
                    .filter_map(|d| previous.get_by_id(&d.id).map(|b| (d.id.clone(), b.clone())))
                    .collect();
                bundles.extend(fresh);
                (bundles, rebuilt)
            }
        };
        // Carried-over bundles are revalidated like everything else
        for bundle in bundles.values_mut() {
            bundle.valid = resolver.validator.validate(bundle);
        }

        let shadowed = descriptors.shadowed().len();
        let state = Arc::new(ResolvedState::new(descriptors, bundles, document.issues.clone()));
        let (valid, invalid) = state.validity_counts(&resolver.validator);

        self.state.store(state.clone());
        self.install_selectors(&document).await;
        self.persist(&document, state.clone()).await;

        tracing::info!(
            "Pass {}: {} resources ({} valid, {} invalid, {} rebuilt)",
            state.pass_id,
            state.bundles.len(),
            valid,
            invalid,
            rebuilt
        );

        RefreshSummary {
            pass_id: state.pass_id,
            resolved: rebuilt,
            total: state.bundles.len(),
            valid,
            invalid,
            shadowed,
            issues: document.issues.len(),
        }
    }

    /// Keep selectors whose capability config is unchanged, rebuild the rest
    ///
    /// Kept selectors search again on their next access, against the new
    /// state, unless their selection was forced.
    async fn install_selectors(&self, document: &ConfigDocument) {
        let current = self.selectors.load_full();
        let mut next = SelectorMap::new();

        for (capability, config) in &document.backends {
            let selector = match current.get(capability) {
                Some(existing) if existing.config() == config => {
                    existing.supersede().await;
                    existing.clone()
                }
                _ => {
                    tracing::debug!("Configuring capability '{}'", capability);
                    Arc::new(BackendSelector::new(capability, config.clone()))
                }
            };
            next.insert(capability.clone(), selector);
        }

        self.selectors.store(Arc::new(next));
    }

    async fn persist(&self, document: &ConfigDocument, state: Arc<ResolvedState>) {
        let writer = SnapshotWriter::new(
            self.snapshot_path
                .clone()
                .unwrap_or_else(|| document.engine.snapshot_path()),
            self.snapshot_enabled
                .unwrap_or(document.engine.snapshot_enabled),
        );
        let mut last = self.last_snapshot.lock().await;
        let previous = last.take();
        *last = writer.persist_after(previous, state);
    }

    /// Wait for the most recent snapshot write, and every write before it,
    /// to finish
    pub async fn flush_snapshots(&self) {
        let handle = self.last_snapshot.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Snapshot task failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Backend selection
    // ========================================================================

    fn selector(&self, capability: &str) -> Option<Arc<BackendSelector>> {
        let selector = self.selectors.load().get(capability).cloned();
        if selector.is_none() {
            tracing::debug!("Unknown capability '{}'", capability);
        }
        selector
    }

    /// Full candidate table for `capability`, selecting on first access
    pub async fn get_backend_status(&self, capability: &str) -> Option<BackendStatus> {
        let selector = self.selector(capability)?;
        let state = self.state.load_full();
        selector.ensure_selected(&state, &self.probes).await;
        Some(selector.status().await)
    }

    /// Switch `capability` to candidate `name`; see [`BackendSelector::switch`]
    pub async fn switch_backend(&self, capability: &str, name: &str, forced: bool) -> bool {
        let Some(selector) = self.selector(capability) else {
            return false;
        };
        let state = self.state.load_full();
        selector.switch(name, forced, &state, &self.probes).await
    }

    /// Re-run the ordered search for `capability` from scratch
    pub async fn reconnect(&self, capability: &str) -> bool {
        let Some(selector) = self.selector(capability) else {
            return false;
        };
        let state = self.state.load_full();
        selector.reconnect(&state, &self.probes).await
    }

    /// Probe every candidate of every capability
    pub async fn health_check(&self) -> HealthReport {
        let selectors = self.selectors.load_full();
        let state = self.state.load_full();

        let checks = selectors.iter().map(|(capability, selector)| {
            let capability = capability.clone();
            let selector = selector.clone();
            let state = state.clone();
            let probes = self.probes.clone();
            async move {
                let healthy = selector.health_check(&state, &probes).await;
                (capability, healthy)
            }
        });
        let per_capability: BTreeMap<String, bool> =
            futures::future::join_all(checks).await.into_iter().collect();

        let healthy = per_capability.values().all(|h| *h);
        if !healthy {
            tracing::warn!(
                "Health check: {} of {} capabilities unhealthy",
                per_capability.values().filter(|h| !**h).count(),
                per_capability.len()
            );
        }
        HealthReport {
            healthy,
            per_capability,
        }
    }
}
