//! GCP ambient identity
//!
//! Uses Application Default Credentials (service account key, gcloud user
//! credentials, or the instance metadata server) to supply `project_id` and
//! `access_token` for `gcp_credentials` bundles. When ADC has no project, the
//! active gcloud configuration on disk is consulted.

use super::AmbientIdentity;
use futures::future::BoxFuture;
use futures::FutureExt;
use gcp_auth::TokenProvider;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Default scopes for GCP API access
pub const DEFAULT_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Kind this provider serves
const GCP_KIND: &str = "gcp_credentials";

/// Refresh tokens this much before they actually expire
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Default token TTL if we can't determine expiry (conservative: 30 minutes)
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
struct CachedToken {
    token: String,
    /// When this token expires (with buffer applied)
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Ambient identity backed by `gcp_auth`
///
/// The token provider is created on first use and retried on later passes if
/// initialization failed.
#[derive(Clone, Default)]
pub struct GcpAmbientIdentity {
    provider: Arc<RwLock<Option<Arc<dyn TokenProvider>>>>,
    token_cache: Arc<RwLock<Option<CachedToken>>>,
}

impl GcpAmbientIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    async fn provider(&self) -> Option<Arc<dyn TokenProvider>> {
        if let Some(provider) = self.provider.read().await.as_ref() {
            return Some(provider.clone());
        }

        let mut slot = self.provider.write().await;
        if let Some(provider) = slot.as_ref() {
            return Some(provider.clone());
        }
        match gcp_auth::provider().await {
            Ok(provider) => {
                *slot = Some(provider.clone());
                Some(provider)
            }
            Err(e) => {
                tracing::debug!("No GCP application default credentials: {}", e);
                None
            }
        }
    }

    async fn access_token(&self, provider: &dyn TokenProvider) -> Option<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.is_valid() {
                    return Some(cached.token.clone());
                }
                tracing::debug!("Cached GCP token expired, fetching new token");
            }
        }

        let token = match provider.token(DEFAULT_SCOPES).await {
            Ok(token) => token.as_str().to_string(),
            Err(e) => {
                tracing::debug!("Failed to get GCP access token: {}", e);
                return None;
            }
        };

        let mut cache = self.token_cache.write().await;
        *cache = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + DEFAULT_TOKEN_TTL - TOKEN_EXPIRY_BUFFER,
        });
        Some(token)
    }

    async fn resolve(&self) -> Option<Map<String, Value>> {
        let mut fields = Map::new();

        if let Some(provider) = self.provider().await {
            match provider.project_id().await {
                Ok(project) if validate_project_id(&project) => {
                    fields.insert("project_id".to_string(), Value::String(project.to_string()));
                }
                Ok(_) => tracing::warn!("Invalid project ID format from application default credentials"),
                Err(e) => tracing::debug!("ADC has no project: {}", e),
            }
            if let Some(token) = self.access_token(provider.as_ref()).await {
                fields.insert("access_token".to_string(), Value::String(token));
            }
        }

        if !fields.contains_key("project_id") {
            if let Some(project) = gcloud_default_project() {
                fields.insert("project_id".to_string(), Value::String(project));
            }
        }

        (!fields.is_empty()).then_some(fields)
    }
}

impl AmbientIdentity for GcpAmbientIdentity {
    fn supports(&self, kind: &str) -> bool {
        kind == GCP_KIND
    }

    fn fetch<'a>(&'a self, kind: &'a str) -> BoxFuture<'a, Option<Map<String, Value>>> {
        async move {
            if kind != GCP_KIND {
                return None;
            }
            self.resolve().await
        }
        .boxed()
    }
}

/// Get the gcloud configuration directory
pub fn gcloud_config_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CLOUDSDK_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|p| p.join("gcloud"))
}

/// Validate a GCP project ID format
/// Project IDs must be 6-30 characters, lowercase letters, digits, and hyphens
/// Must start with a letter and cannot end with a hyphen
pub fn validate_project_id(project: &str) -> bool {
    if project.len() < 6 || project.len() > 30 {
        return false;
    }

    match project.chars().next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }

    if project.ends_with('-') {
        return false;
    }

    project
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Read `project` from the `[core]` section of a gcloud properties file
fn project_from_properties(content: &str) -> Option<String> {
    let mut in_core_section = true;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_core_section = line == "[core]";
            continue;
        }
        if !in_core_section {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() == "project" {
            let project = value.trim().to_string();
            if validate_project_id(&project) {
                return Some(project);
            }
        }
    }
    None
}

/// Project from the gcloud configuration files (not environment variables;
/// those belong to the environment override layer)
pub fn gcloud_default_project() -> Option<String> {
    let config_dir = gcloud_config_dir()?;

    if let Ok(content) = std::fs::read_to_string(config_dir.join("properties")) {
        if let Some(project) = project_from_properties(&content) {
            return Some(project);
        }
    }

    let active_config = std::fs::read_to_string(config_dir.join("active_config")).ok()?;
    let config_name = active_config.trim();

    // Guard against path traversal through the config name
    if !config_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        tracing::warn!("Invalid characters in active_config name");
        return None;
    }

    let config_path = config_dir
        .join("configurations")
        .join(format!("config_{}", config_name));
    let content = std::fs::read_to_string(config_path).ok()?;
    project_from_properties(&content)
}
