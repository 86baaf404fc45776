//! Resource resolution layer
//!
//! This module turns the configuration document into validated bundles of
//! fields. Resource definitions are entirely data-driven: any entry that
//! declares a `type` is discovered, and kinds without a dedicated extractor
//! are kept verbatim, so new resource kinds need no code change.
//!
//! # Architecture
//!
//! - [`descriptor`] - Walks the document and builds the descriptor registry
//! - [`extract`] - Kind -> extractor table with a generic fallback
//! - [`overrides`] - Environment and ambient identity override layers
//! - [`validate`] - Per-kind completeness checks
//! - [`resolver`] - Runs one pass of the pipeline above
//! - [`registry`] - The immutable result of a pass and its queries
//! - [`snapshot`] - Best-effort, redacted persistence of each pass
//!
//! # Example
//!
//! ```ignore
//! use stratum::config::{ConfigDocument, Format};
//! use stratum::resource::discover;
//!
//! let doc = ConfigDocument::parse(yaml, Format::Yaml)?;
//! let registry = discover(&doc);
//! let bundles = resolver.resolve(registry.iter()).await;
//! ```

pub mod bundle;
pub mod descriptor;
pub mod extract;
pub mod overrides;
pub mod registry;
pub mod resolver;
pub mod snapshot;
pub mod validate;

pub use bundle::{Provenance, ProvenanceSummary, ResolvedBundle};
pub use descriptor::{discover, Descriptor, DescriptorRegistry, Shadowed};
pub use extract::{ExtractorFn, ExtractorRegistry};
pub use overrides::{default_rules, EnvSource, OverrideRule, ProcessEnv};
pub use registry::{ResolvedState, ResourceStatus};
pub use resolver::Resolver;
pub use snapshot::{Snapshot, SnapshotWriter};
pub use validate::{Validator, ValidatorFn};
