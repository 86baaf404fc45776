//! Backend Selector
//!
//! Tracks which candidate serves a capability:
//! `Unselected -> Probing -> Selected(candidate) | Degraded`.
//!
//! Every probe runs under the capability's timeout, so no operation can
//! hang on an unreachable backend. Each operation takes a generation number
//! when it starts; when a newer operation has started by the time an older
//! one finishes, the older one's results are dropped instead of merged.

use super::probe::ProbeRegistry;
use super::{BackendCandidate, CapabilityConfig, SelectionPolicy};
use crate::error::ProbeError;
use crate::resource::extract::lift_generic;
use crate::resource::ResolvedState;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Where a capability is in its selection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPhase {
    Unselected,
    Probing,
    Selected,
    Degraded,
}

/// Last known health of one candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateStatus {
    pub kind: String,
    pub priority: i64,
    pub available: bool,
    pub latency_ms: u64,
    /// `None` until the candidate has been probed
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CandidateStatus {
    fn unchecked(candidate: &BackendCandidate) -> Self {
        Self {
            kind: candidate.kind.clone(),
            priority: candidate.priority,
            available: false,
            latency_ms: 0,
            last_checked_at: None,
            last_error: None,
        }
    }
}

/// Full selection state of a capability, as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub capability: String,
    pub phase: SelectionPhase,
    pub current: Option<String>,
    /// The current candidate was chosen by a forced switch, bypassing health
    pub forced: bool,
    pub policy: SelectionPolicy,
    /// Every candidate, probed or not
    pub candidates: BTreeMap<String, CandidateStatus>,
}

/// Result of probing one candidate
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub name: String,
    pub result: Result<(), ProbeError>,
    pub latency: Duration,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SelectionState {
    /// Generation of the search in flight, if any
    probing: Option<u64>,
    /// A search has completed at least once
    attempted: bool,
    /// Resources changed since the last committed result
    stale: bool,
    current: Option<String>,
    forced: bool,
    statuses: BTreeMap<String, CandidateStatus>,
}

impl SelectionState {
    fn phase(&self) -> SelectionPhase {
        if self.probing.is_some() {
            SelectionPhase::Probing
        } else if self.current.is_some() {
            SelectionPhase::Selected
        } else if self.attempted {
            SelectionPhase::Degraded
        } else {
            SelectionPhase::Unselected
        }
    }

    fn record(&mut self, outcome: ProbeOutcome) {
        let Some(status) = self.statuses.get_mut(&outcome.name) else {
            return;
        };
        status.available = outcome.result.is_ok();
        status.latency_ms = u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX);
        status.last_checked_at = Some(outcome.checked_at);
        status.last_error = outcome.result.err().map(|e| e.to_string());
    }

    fn is_available(&self, name: &str) -> bool {
        self.statuses.get(name).is_some_and(|s| s.available)
    }
}

/// Probe one candidate against the current resolved state
///
/// Missing or incomplete bundles fail without any I/O. The probe itself is
/// bounded by `timeout`; a timeout is reported like any other failure.
pub async fn probe_candidate(
    candidate: &BackendCandidate,
    resources: &ResolvedState,
    probes: &ProbeRegistry,
    timeout: Duration,
) -> ProbeOutcome {
    let started = Instant::now();

    let result = match resources.get_by_id(&candidate.descriptor_ref) {
        None => Err(ProbeError::MissingBundle(candidate.descriptor_ref.clone())),
        Some(bundle) if !bundle.valid => Err(ProbeError::InvalidBundle(bundle.descriptor_id.clone())),
        Some(bundle) => {
            let view = lift_generic(bundle);
            let kind = if candidate.kind.is_empty() {
                bundle.kind.as_str()
            } else {
                candidate.kind.as_str()
            };
            let probe = probes.for_kind(kind);
            match tokio::time::timeout(timeout, probe.check(&view)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(timeout)),
            }
        }
    };

    if let Err(e) = &result {
        tracing::debug!("Candidate '{}' unavailable: {}", candidate.name, e);
    }

    ProbeOutcome {
        name: candidate.name.clone(),
        result,
        latency: started.elapsed(),
        checked_at: Utc::now(),
    }
}

/// Selection state machine for one capability
#[derive(Debug)]
pub struct BackendSelector {
    capability: String,
    config: CapabilityConfig,
    candidates: Vec<BackendCandidate>,
    state: RwLock<SelectionState>,
    generation: AtomicU64,
}

impl BackendSelector {
    pub fn new(capability: &str, config: CapabilityConfig) -> Self {
        let candidates = config.ordered_candidates();
        let statuses = candidates
            .iter()
            .map(|c| (c.name.clone(), CandidateStatus::unchecked(c)))
            .collect();

        Self {
            capability: capability.to_string(),
            config,
            candidates,
            state: RwLock::new(SelectionState {
                probing: None,
                attempted: false,
                stale: false,
                current: None,
                forced: false,
                statuses,
            }),
            generation: AtomicU64::new(0),
        }
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn config(&self) -> &CapabilityConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_latest(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn candidate(&self, name: &str) -> Option<&BackendCandidate> {
        self.candidates.iter().find(|c| c.name == name)
    }

    /// Snapshot of the selection state
    pub async fn status(&self) -> BackendStatus {
        let state = self.state.read().await;
        BackendStatus {
            capability: self.capability.clone(),
            phase: state.phase(),
            current: state.current.clone(),
            forced: state.forced,
            policy: self.config.policy,
            candidates: state.statuses.clone(),
        }
    }

    /// Abandon any operation in flight and search again on next access
    ///
    /// The current selection stays visible until that search commits. A
    /// forced selection is kept as is.
    pub async fn supersede(&self) {
        self.next_generation();
        let mut state = self.state.write().await;
        state.probing = None;
        state.stale = true;
    }

    /// Run a selection if none has happened yet, or if the resources it was
    /// made against have been refreshed since
    pub async fn ensure_selected(&self, resources: &ResolvedState, probes: &ProbeRegistry) {
        let needs_search = {
            let state = self.state.read().await;
            state.phase() == SelectionPhase::Unselected || (state.stale && !state.forced)
        };
        if needs_search {
            self.reconnect(resources, probes).await;
        }
    }

    /// Ordered search over all candidates, from scratch
    ///
    /// Returns true when a healthy candidate was selected.
    pub async fn reconnect(&self, resources: &ResolvedState, probes: &ProbeRegistry) -> bool {
        let generation = self.next_generation();
        self.state.write().await.probing = Some(generation);

        let (outcomes, winner) = self.search(resources, probes).await;

        let mut state = self.state.write().await;
        if !self.is_latest(generation) {
            tracing::debug!(
                "Discarding superseded selection for '{}' (generation {})",
                self.capability,
                generation
            );
            return state.current.is_some();
        }

        for outcome in outcomes {
            state.record(outcome);
        }
        state.probing = None;
        state.attempted = true;
        state.stale = false;
        state.forced = false;
        state.current = winner.clone();

        match &winner {
            Some(name) => tracing::info!("Capability '{}' using backend '{}'", self.capability, name),
            None => tracing::warn!(
                "Capability '{}' degraded: no healthy backend among {} candidates",
                self.capability,
                self.candidates.len()
            ),
        }
        winner.is_some()
    }

    async fn search(
        &self,
        resources: &ResolvedState,
        probes: &ProbeRegistry,
    ) -> (Vec<ProbeOutcome>, Option<String>) {
        let timeout = self.timeout();
        let mut outcomes = Vec::with_capacity(self.candidates.len());

        match self.config.policy {
            SelectionPolicy::Sequential => {
                for candidate in &self.candidates {
                    let outcome = probe_candidate(candidate, resources, probes, timeout).await;
                    let found = outcome.result.is_ok().then(|| outcome.name.clone());
                    outcomes.push(outcome);
                    if found.is_some() {
                        return (outcomes, found);
                    }
                }
            }
            SelectionPolicy::OrderedParallel => {
                // `buffered` yields in candidate order regardless of which
                // probe finishes first
                let mut results = stream::iter(self.candidates.iter().cloned())
                    .map(move |c| async move { probe_candidate(&c, resources, probes, timeout).await })
                    .buffered(self.concurrency());
                while let Some(outcome) = results.next().await {
                    let found = outcome.result.is_ok().then(|| outcome.name.clone());
                    outcomes.push(outcome);
                    if found.is_some() {
                        return (outcomes, found);
                    }
                }
            }
            SelectionPolicy::FirstResponder => {
                let mut results = stream::iter(self.candidates.iter().cloned())
                    .map(move |c| async move { probe_candidate(&c, resources, probes, timeout).await })
                    .buffer_unordered(self.concurrency());
                while let Some(outcome) = results.next().await {
                    let found = outcome.result.is_ok().then(|| outcome.name.clone());
                    outcomes.push(outcome);
                    if found.is_some() {
                        return (outcomes, found);
                    }
                }
            }
        }

        (outcomes, None)
    }

    /// Move to candidate `name`
    ///
    /// Without `forced` the candidate is probed first and the switch only
    /// happens if it is healthy. With `forced` the switch is unconditional
    /// and flagged as forced in status.
    pub async fn switch(
        &self,
        name: &str,
        forced: bool,
        resources: &ResolvedState,
        probes: &ProbeRegistry,
    ) -> bool {
        let Some(candidate) = self.candidate(name) else {
            tracing::warn!("Capability '{}' has no candidate '{}'", self.capability, name);
            return false;
        };
        let generation = self.next_generation();

        if forced {
            let mut state = self.state.write().await;
            state.probing = None;
            state.attempted = true;
            state.stale = false;
            state.current = Some(name.to_string());
            state.forced = true;
            tracing::warn!(
                "Capability '{}' forced to backend '{}' without a health check",
                self.capability,
                name
            );
            return true;
        }

        let outcome = probe_candidate(candidate, resources, probes, self.timeout()).await;
        let healthy = outcome.result.is_ok();

        let mut state = self.state.write().await;
        if !self.is_latest(generation) {
            tracing::debug!("Discarding superseded switch to '{}'", name);
            return false;
        }
        state.record(outcome);
        state.probing = None;
        if healthy {
            state.attempted = true;
            state.stale = false;
            state.current = Some(name.to_string());
            state.forced = false;
            tracing::info!("Capability '{}' switched to backend '{}'", self.capability, name);
        } else {
            tracing::warn!(
                "Capability '{}' not switched: '{}' failed its health check",
                self.capability,
                name
            );
        }
        healthy
    }

    /// Probe every candidate and re-evaluate the selection
    ///
    /// Healthy iff the current candidate passed. An unforced selection whose
    /// candidate failed falls back to the first healthy candidate by
    /// priority; a forced selection is left alone and reported unhealthy.
    pub async fn health_check(&self, resources: &ResolvedState, probes: &ProbeRegistry) -> bool {
        let generation = self.next_generation();
        self.state.write().await.probing = Some(generation);
        let timeout = self.timeout();

        let outcomes: Vec<ProbeOutcome> = stream::iter(self.candidates.iter().cloned())
            .map(move |c| async move { probe_candidate(&c, resources, probes, timeout).await })
            .buffered(self.concurrency())
            .collect()
            .await;

        let mut state = self.state.write().await;
        if !self.is_latest(generation) {
            tracing::debug!("Discarding superseded health check for '{}'", self.capability);
            let current_ok = state.current.as_deref().is_some_and(|c| state.is_available(c));
            return current_ok;
        }
        for outcome in outcomes {
            state.record(outcome);
        }
        state.probing = None;
        state.attempted = true;
        state.stale = false;

        if let Some(current) = state.current.clone() {
            if state.is_available(&current) {
                return true;
            }
            if state.forced {
                tracing::warn!(
                    "Capability '{}' forced backend '{}' is unhealthy",
                    self.capability,
                    current
                );
                return false;
            }
        }

        let fallback = self
            .candidates
            .iter()
            .find(|c| state.is_available(&c.name))
            .map(|c| c.name.clone());

        if fallback != state.current {
            match &fallback {
                Some(name) => tracing::info!(
                    "Capability '{}' falling back to backend '{}'",
                    self.capability,
                    name
                ),
                None => tracing::warn!("Capability '{}' degraded: no healthy backend", self.capability),
            }
        }
        state.current = fallback;
        state.forced = false;
        state.current.is_some()
    }
}
