//! Ambient runtime identity
//!
//! An ambient identity supplies field values for cloud-identity credential
//! kinds from whatever the host environment already provides (instance
//! metadata, application default credentials, local SDK configuration).
//!
//! # Module Structure
//!
//! - [`gcp`] - Google Cloud identity via Application Default Credentials
//!
//! Providers are consulted once per kind per resolution pass, under a bounded
//! timeout; a provider that fails simply contributes nothing.

pub mod gcp;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use gcp::GcpAmbientIdentity;

/// Kinds that represent a cloud identity and may take ambient values
pub const CLOUD_IDENTITY_KINDS: &[&str] = &["gcp_credentials", "aws_credentials", "azure_credentials"];

/// Source of ambient identity fields
pub trait AmbientIdentity: Send + Sync {
    /// Whether this provider has anything to offer for `kind`
    fn supports(&self, kind: &str) -> bool;

    /// Field values for `kind`, or `None` when no identity is available
    fn fetch<'a>(&'a self, kind: &'a str) -> BoxFuture<'a, Option<Map<String, Value>>>;
}

/// Fetch the identity for `kind`, giving up after `timeout`
pub async fn fetch_bounded(
    identity: &dyn AmbientIdentity,
    kind: &str,
    timeout: Duration,
) -> Option<Map<String, Value>> {
    if !CLOUD_IDENTITY_KINDS.contains(&kind) || !identity.supports(kind) {
        return None;
    }
    match tokio::time::timeout(timeout, identity.fetch(kind)).await {
        Ok(fields) => fields.filter(|f| !f.is_empty()),
        Err(_) => {
            tracing::debug!(
                "Ambient identity for '{}' timed out after {}ms",
                kind,
                timeout.as_millis()
            );
            None
        }
    }
}

/// Disables the ambient identity layer
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentity;

impl AmbientIdentity for NoIdentity {
    fn supports(&self, _kind: &str) -> bool {
        false
    }

    fn fetch<'a>(&'a self, _kind: &'a str) -> BoxFuture<'a, Option<Map<String, Value>>> {
        async { None }.boxed()
    }
}

/// Fixed identity values per kind, for offline use and tests
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    by_kind: HashMap<String, Map<String, Value>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one field value for `kind`
    pub fn with(mut self, kind: &str, field: &str, value: impl Into<Value>) -> Self {
        self.by_kind
            .entry(kind.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
        self
    }
}

impl AmbientIdentity for StaticIdentity {
    fn supports(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    fn fetch<'a>(&'a self, kind: &'a str) -> BoxFuture<'a, Option<Map<String, Value>>> {
        let fields = self.by_kind.get(kind).cloned();
        async move { fields }.boxed()
    }
}

/// Tries each provider in order; the first one with values wins
#[derive(Clone, Default)]
pub struct ChainedIdentity {
    providers: Vec<Arc<dyn AmbientIdentity>>,
}

impl ChainedIdentity {
    pub fn new(providers: Vec<Arc<dyn AmbientIdentity>>) -> Self {
        Self { providers }
    }
}

impl AmbientIdentity for ChainedIdentity {
    fn supports(&self, kind: &str) -> bool {
        self.providers.iter().any(|p| p.supports(kind))
    }

    fn fetch<'a>(&'a self, kind: &'a str) -> BoxFuture<'a, Option<Map<String, Value>>> {
        async move {
            for provider in self.providers.iter().filter(|p| p.supports(kind)) {
                if let Some(fields) = provider.fetch(kind).await {
                    if !fields.is_empty() {
                        return Some(fields);
                    }
                }
            }
            None
        }
        .boxed()
    }
}
