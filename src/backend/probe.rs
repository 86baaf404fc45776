//! Health probes
//!
//! A probe checks whether the backend described by a resolved bundle is
//! reachable. Probes never enforce their own deadline; the selector wraps
//! every call in a timeout.

use crate::error::ProbeError;
use crate::resource::extract::DATABASE_KINDS;
use crate::resource::ResolvedBundle;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Bundle fields that may hold an HTTP endpoint, in lookup order
const URL_FIELDS: &[&str] = &["health_url", "endpoint", "base_url", "url"];

/// Default ports for database flavours
const DEFAULT_PORTS: &[(&str, u16)] = &[
    ("postgres", 5432),
    ("postgresql", 5432),
    ("database_credentials", 5432),
    ("mysql", 3306),
    ("redis", 6379),
    ("mongodb", 27017),
];

/// Connectivity check against one backend
pub trait Probe: Send + Sync {
    fn check<'a>(&'a self, bundle: &'a ResolvedBundle) -> BoxFuture<'a, Result<(), ProbeError>>;
}

/// Truncate and strip control characters before logging a response body
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let cut = (0..=MAX_LOG_BODY_LENGTH)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... [truncated, {} bytes total]", &body[..cut], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

// =============================================================================
// HTTP
// =============================================================================

/// GET against the bundle's endpoint; healthy iff 2xx
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("stratum/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build probe HTTP client, using defaults: {}", e);
                Client::new()
            });
        Self { client }
    }

    /// Health URL for a bundle: first URL field, joined with `health_path`
    pub fn target(bundle: &ResolvedBundle) -> Result<url::Url, ProbeError> {
        let raw = bundle.str_field(URL_FIELDS).ok_or_else(|| {
            ProbeError::Unsupported(format!("'{}' has no endpoint", bundle.descriptor_id))
        })?;
        let mut target = url::Url::parse(raw)
            .map_err(|e| ProbeError::Unsupported(format!("invalid endpoint '{}': {}", raw, e)))?;

        if !matches!(target.scheme(), "http" | "https") {
            return Err(ProbeError::Unsupported(format!(
                "unsupported scheme '{}'",
                target.scheme()
            )));
        }

        if bundle.str_field(&["health_url"]).is_none() {
            if let Some(path) = bundle.str_field(&["health_path"]) {
                target = target
                    .join(path)
                    .map_err(|e| ProbeError::Unsupported(format!("invalid health_path: {}", e)))?;
            }
        }
        Ok(target)
    }

    async fn get(&self, bundle: &ResolvedBundle) -> Result<(), ProbeError> {
        let target = Self::target(bundle)?;
        tracing::debug!("Probing GET {}", target);

        let mut request = self.client.get(target.clone());
        if let Some(token) = bundle.str_field(&["token"]) {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProbeError::Connection(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // Only log a sanitized/truncated body to avoid leaking sensitive data
        let body = response.text().await.unwrap_or_default();
        tracing::debug!("Probe of {} failed: {} - {}", target, status, sanitize_for_log(&body));
        Err(ProbeError::Status(status.as_u16()))
    }
}

impl Probe for HttpProbe {
    fn check<'a>(&'a self, bundle: &'a ResolvedBundle) -> BoxFuture<'a, Result<(), ProbeError>> {
        self.get(bundle).boxed()
    }
}

// =============================================================================
// TCP
// =============================================================================

/// TCP connect to `host:port`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl TcpProbe {
    pub fn target(bundle: &ResolvedBundle) -> Result<(String, u16), ProbeError> {
        let host = bundle.str_field(&["host"]).ok_or_else(|| {
            ProbeError::Unsupported(format!("'{}' has no host", bundle.descriptor_id))
        })?;
        let port = bundle
            .port_field("port")
            .or_else(|| {
                DEFAULT_PORTS
                    .iter()
                    .find(|(kind, _)| *kind == bundle.kind)
                    .map(|(_, port)| *port)
            })
            .ok_or_else(|| {
                ProbeError::Unsupported(format!("'{}' has no port", bundle.descriptor_id))
            })?;
        Ok((host.to_string(), port))
    }
}

impl Probe for TcpProbe {
    fn check<'a>(&'a self, bundle: &'a ResolvedBundle) -> BoxFuture<'a, Result<(), ProbeError>> {
        async move {
            let (host, port) = Self::target(bundle)?;
            tracing::debug!("Probing tcp {}:{}", host, port);
            tokio::net::TcpStream::connect((host.as_str(), port))
                .await
                .map(|_| ())
                .map_err(|e| ProbeError::Connection(e.to_string()))
        }
        .boxed()
    }
}

// =============================================================================
// Local file store
// =============================================================================

/// Local directory or file backend; healthy iff `path` exists
///
/// With `create: true` in the bundle, a missing directory is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProbe;

impl Probe for FileProbe {
    fn check<'a>(&'a self, bundle: &'a ResolvedBundle) -> BoxFuture<'a, Result<(), ProbeError>> {
        async move {
            let path = bundle.str_field(&["path"]).ok_or_else(|| {
                ProbeError::Unsupported(format!("'{}' has no path", bundle.descriptor_id))
            })?;
            if tokio::fs::metadata(path).await.is_ok() {
                return Ok(());
            }
            let create = bundle
                .fields
                .get("create")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !create {
                return Err(ProbeError::Connection(format!("{} does not exist", path)));
            }
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| ProbeError::Connection(format!("cannot create {}: {}", path, e)))
        }
        .boxed()
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Picks a probe from the bundle's fields: http(s) URL -> http, host -> tcp,
/// path -> file
///
/// A URL with any other scheme (a `postgres://` connection string, say)
/// does not route to http; the bundle's `host` or `path` decides instead.
#[derive(Clone, Default)]
pub struct AutoProbe {
    http: HttpProbe,
    tcp: TcpProbe,
    file: FileProbe,
}

impl Probe for AutoProbe {
    fn check<'a>(&'a self, bundle: &'a ResolvedBundle) -> BoxFuture<'a, Result<(), ProbeError>> {
        if HttpProbe::target(bundle).is_ok() {
            self.http.check(bundle)
        } else if bundle.str_field(&["host"]).is_some() {
            self.tcp.check(bundle)
        } else if bundle.str_field(&["path"]).is_some() {
            self.file.check(bundle)
        } else if bundle.str_field(URL_FIELDS).is_some() {
            // Reports why the URL was refused
            self.http.check(bundle)
        } else {
            let id = bundle.descriptor_id.clone();
            async move { Err(ProbeError::Unsupported(format!("no probe fits '{}'", id))) }.boxed()
        }
    }
}

/// Candidate kind -> probe, with [`AutoProbe`] as the fallback
#[derive(Clone)]
pub struct ProbeRegistry {
    probes: HashMap<String, Arc<dyn Probe>>,
    fallback: Arc<dyn Probe>,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProbeRegistry {
    pub fn with_builtins() -> Self {
        let http = HttpProbe::new();
        let mut registry = Self {
            probes: HashMap::new(),
            fallback: Arc::new(AutoProbe {
                http: http.clone(),
                ..AutoProbe::default()
            }),
        };

        let http: Arc<dyn Probe> = Arc::new(http);
        registry.register("http", http.clone());
        registry.register("https", http);
        registry.register("tcp", Arc::new(TcpProbe));
        for kind in DATABASE_KINDS {
            registry.register(kind, Arc::new(TcpProbe));
        }
        registry.register("file", Arc::new(FileProbe));
        registry.register("local", Arc::new(FileProbe));
        registry
    }

    /// Register (or replace) the probe for a candidate kind
    pub fn register(&mut self, kind: &str, probe: Arc<dyn Probe>) {
        self.probes.insert(kind.to_string(), probe);
    }

    pub fn for_kind(&self, kind: &str) -> Arc<dyn Probe> {
        self.probes
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
