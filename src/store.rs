use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::config::RequestChecksumCalculation;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::cache_key::CacheKey;
use crate::config::{Config, Region};
use crate::error::{ProxyError, truncate_body};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body read from the origin and written to the store without buffering.
pub type StreamingBody = BoxBody<Bytes, BoxError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Existence {
    Present,
    Absent,
}

pub enum StoreBody {
    /// Length declared up front; bytes are piped through as they arrive.
    Streaming {
        body: StreamingBody,
        content_length: u64,
    },
    /// Fully read into memory before the upload starts.
    Buffered(Bytes),
}

impl StoreBody {
    pub fn content_length(&self) -> u64 {
        match self {
            StoreBody::Streaming { content_length, .. } => *content_length,
            StoreBody::Buffered(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, StoreBody::Streaming { .. })
    }

    /// Read the whole body. Used by stores that need the bytes in memory.
    pub async fn into_bytes(self) -> Result<Bytes, BoxError> {
        match self {
            StoreBody::Streaming { body, .. } => Ok(body.collect().await?.to_bytes()),
            StoreBody::Buffered(bytes) => Ok(bytes),
        }
    }
}

pub struct PutObject {
    pub content_type: Option<String>,
    pub body: StoreBody,
}

/// The two store operations on the request path.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// `Absent` only for an explicit not-found; any other unexpected answer is an error.
    async fn head(&self, key: &CacheKey) -> Result<Existence, ProxyError>;

    async fn put(&self, key: &CacheKey, object: PutObject) -> Result<(), ProxyError>;
}

#[derive(Clone)]
pub(crate) struct RegionClient {
    pub(crate) client: aws_sdk_s3::Client,
    permits: Arc<Semaphore>,
}

impl RegionClient {
    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ProxyError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::StoreUnavailable("connection limiter closed".to_string()))
    }
}

/// Region-keyed S3 clients, created on first use and kept for the process lifetime.
///
/// Each region also carries a semaphore bounding concurrent store requests.
pub struct S3ClientPool {
    sdk_config: SdkConfig,
    regions: HashMap<String, Region>,
    max_connections: usize,
    clients: Mutex<HashMap<String, RegionClient>>,
}

impl S3ClientPool {
    pub fn new(sdk_config: &SdkConfig, config: &Config) -> Self {
        let regions = config
            .regions
            .iter()
            .map(|region| (region.id.clone(), region.clone()))
            .collect();

        Self {
            sdk_config: sdk_config.clone(),
            regions,
            max_connections: config.max_store_connections,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn client(&self, region_id: &str) -> Result<RegionClient, ProxyError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(region_id) {
            return Ok(client.clone());
        }

        let region = self.regions.get(region_id).ok_or_else(|| {
            ProxyError::StoreUnavailable(format!("no store configured for region {region_id}"))
        })?;

        debug!(region = %region.id, endpoint = %region.endpoint, "creating store client");
        let client = RegionClient {
            client: build_client(&self.sdk_config, region),
            permits: Arc::new(Semaphore::new(self.max_connections)),
        };
        clients.insert(region_id.to_string(), client.clone());
        Ok(client)
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn build_client(sdk_config: &SdkConfig, region: &Region) -> aws_sdk_s3::Client {
    aws_sdk_s3::Client::from_conf(
        aws_sdk_s3::config::Builder::from(sdk_config)
            .region(aws_sdk_s3::config::Region::new(region.name.clone()))
            .endpoint_url(region.endpoint_url())
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .build(),
    )
}

#[async_trait]
impl ObjectStore for S3ClientPool {
    async fn head(&self, key: &CacheKey) -> Result<Existence, ProxyError> {
        let region = self.client(key.region())?;
        let _permit = region.acquire().await?;

        debug!(bucket = %key.bucket(), key = %key.object_key(), "store HEAD");
        let result = region
            .client
            .head_object()
            .bucket(key.bucket())
            .key(key.object_key())
            .send()
            .await;

        match result {
            Ok(_) => Ok(Existence::Present),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(Existence::Absent),
            Err(err) => match err.raw_response() {
                Some(raw) => Err(ProxyError::UnexpectedStoreResponse {
                    status: raw.status().as_u16(),
                }),
                None => Err(ProxyError::StoreUnavailable(
                    DisplayErrorContext(&err).to_string(),
                )),
            },
        }
    }

    async fn put(&self, key: &CacheKey, object: PutObject) -> Result<(), ProxyError> {
        let region = self.client(key.region())?;
        let _permit = region.acquire().await?;

        let content_length = object.body.content_length();
        let content_length = i64::try_from(content_length).map_err(|_| {
            ProxyError::StoreUnavailable(format!("content length {content_length} out of range"))
        })?;
        let body = match object.body {
            StoreBody::Streaming { body, .. } => ByteStream::from_body_1_x(body),
            StoreBody::Buffered(bytes) => ByteStream::from(bytes),
        };

        debug!(bucket = %key.bucket(), key = %key.object_key(), content_length, "store PUT");
        let mut request = region
            .client
            .put_object()
            .bucket(key.bucket())
            .key(key.object_key())
            .content_length(content_length)
            .body(body);
        if let Some(content_type) = object.content_type {
            request = request.content_type(content_type);
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(err) => match err.raw_response() {
                Some(raw) => Err(ProxyError::StoreWriteFailed {
                    status: raw.status().as_u16(),
                    body: raw.body().bytes().map(truncate_body).unwrap_or_default(),
                }),
                None => Err(ProxyError::StoreUnavailable(
                    DisplayErrorContext(&err).to_string(),
                )),
            },
        }
    }
}
