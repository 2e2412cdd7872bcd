use std::sync::Arc;
use std::time::{Duration, SystemTime};

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;

use crate::cache_key::CacheKey;
use crate::config::Backend;
use crate::error::ProxyError;
use crate::store::S3ClientPool;

/// Produces time-limited GET URLs for stored objects.
///
/// Signing is computed locally from the region's credentials; it never sends a
/// request to the store.
pub struct UrlSigner {
    pool: Arc<S3ClientPool>,
    default_ttl: Duration,
}

impl UrlSigner {
    pub fn new(pool: Arc<S3ClientPool>, default_ttl: Duration) -> Self {
        Self { pool, default_ttl }
    }

    /// The backend's own lifetime if it has one, else the global default.
    pub fn ttl_for(&self, backend: &Backend) -> Duration {
        backend.signed_url_ttl.unwrap_or(self.default_ttl)
    }

    pub async fn sign(&self, key: &CacheKey, ttl: Duration) -> Result<String, ProxyError> {
        self.sign_at(key, ttl, SystemTime::now()).await
    }

    /// Sign as of `start`; the URL expires at `start + ttl`.
    pub async fn sign_at(
        &self,
        key: &CacheKey,
        ttl: Duration,
        start: SystemTime,
    ) -> Result<String, ProxyError> {
        let region = self.pool.client(key.region())?;

        let presigning = PresigningConfig::builder()
            .start_time(start)
            .expires_in(ttl)
            .build()
            .map_err(|err| ProxyError::Signing(err.to_string()))?;

        let request = region
            .client
            .get_object()
            .bucket(key.bucket())
            .key(key.object_key())
            .presigned(presigning)
            .await
            .map_err(|err| ProxyError::Signing(DisplayErrorContext(&err).to_string()))?;

        Ok(request.uri().to_string())
    }
}
