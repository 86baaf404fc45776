//! stratum - configuration-driven resource resolution
//!
//! Discovers the credentials, connections and service endpoints declared in
//! one configuration document, layers environment and ambient identity
//! overrides on top, validates the result and selects a healthy backend for
//! each logical capability.
//!
//! # Module Structure
//!
//! - [`config`] - Configuration document and search paths
//! - [`resource`] - Discovery, extraction, overrides, validation, snapshots
//! - [`identity`] - Ambient runtime identity providers
//! - [`backend`] - Probes and per-capability backend selection
//! - [`engine`] - The engine object and its query API
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```ignore
//! let engine = stratum::Engine::from_path(None).await?;
//! let db = engine.get_by_id("primary_db");
//! let tracking = engine.get_backend_status("tracking").await;
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod resource;

pub use backend::{BackendStatus, CandidateStatus, SelectionPhase};
pub use config::{ConfigDocument, ConfigSource};
pub use engine::{Engine, EngineBuilder, HealthReport, RefreshSummary};
pub use error::{EngineError, ProbeError};
pub use resource::{Provenance, ResolvedBundle, ResourceStatus};
