use std::sync::Arc;

use crate::config::{Backend, Config, Region};
use crate::error::RouteError;

/// Everything needed to serve one request: the resolved backend and region
/// and the original path (including the query string).
///
/// Fully determines the cache key and never changes after resolution.
#[derive(Clone, Debug)]
pub struct RequestContext {
    backend: Arc<Backend>,
    region: Arc<Region>,
    path: String,
}

impl RequestContext {
    pub fn new(backend: Arc<Backend>, region: Arc<Region>, path: impl Into<String>) -> Self {
        Self {
            backend,
            region,
            path: path.into(),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `<backend origin><original path>`.
    pub fn origin_url(&self) -> String {
        format!("{}{}", self.backend.origin, self.path)
    }
}

/// Resolves virtual hosts to backends and regions.
pub struct Router {
    backends: Vec<Arc<Backend>>,
    regions: Vec<Arc<Region>>,
    default_region: Option<Arc<Region>>,
}

impl Router {
    pub fn new(config: &Config) -> Self {
        let backends = config.backends.iter().cloned().map(Arc::new).collect();
        let regions: Vec<Arc<Region>> = config.regions.iter().cloned().map(Arc::new).collect();
        let default_region = config
            .default_region
            .as_deref()
            .and_then(|id| regions.iter().find(|region| region.id == id).cloned());

        Self {
            backends,
            regions,
            default_region,
        }
    }

    pub fn resolve(&self, host: Option<&str>, path: &str) -> Result<RequestContext, RouteError> {
        let host = host
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .ok_or(RouteError::NoHostHeader)?
            .to_ascii_lowercase();

        let backend = self
            .backend_for_host(&host)
            .ok_or(RouteError::UnknownBackend)?;
        let region = self
            .region_for_host(&host)
            .ok_or(RouteError::UnknownRegion)?;

        Ok(RequestContext::new(
            Arc::clone(backend),
            Arc::clone(region),
            path,
        ))
    }

    /// First configured backend whose id is a prefix of the host.
    ///
    /// `ftp.mozilla.org.usw2.proxxy.example.com` selects `ftp.mozilla.org`.
    pub fn backend_for_host(&self, host: &str) -> Option<&Arc<Backend>> {
        self.backends
            .iter()
            .find(|backend| host.starts_with(backend.id.as_str()))
    }

    /// First configured region whose `.<id>.` token appears in the host, else the default.
    pub fn region_for_host(&self, host: &str) -> Option<&Arc<Region>> {
        self.regions
            .iter()
            .find(|region| host.contains(&format!(".{}.", region.id)))
            .or(self.default_region.as_ref())
    }
}
