use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use http::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use proxxy::{CacheKey, Existence, ObjectStore, ProxyError, PutObject};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub mod helpers;

/// An object as the mock store received it.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub content_type: Option<String>,
    pub body: Bytes,
    /// Whether the writer used the streaming upload path.
    pub streamed: bool,
    pub declared_length: u64,
}

/// In-memory object store for testing
#[derive(Clone, Default)]
pub struct MockStore {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    head_count: Arc<AtomicU64>,
    put_count: Arc<AtomicU64>,
    head_failure: Arc<Mutex<Option<ProxyError>>>,
    stale_heads: Arc<AtomicU64>,
    head_delay_ms: Arc<AtomicU64>,
    put_failures: Arc<Mutex<VecDeque<ProxyError>>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate storage with test data
    pub async fn insert(&self, key: &CacheKey, data: &[u8]) {
        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                content_type: None,
                body: Bytes::copy_from_slice(data),
                streamed: false,
                declared_length: data.len() as u64,
            },
        );
    }

    pub async fn object(&self, key: &CacheKey) -> Option<StoredObject> {
        self.objects.lock().await.get(&key.to_string()).cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub fn head_count(&self) -> u64 {
        self.head_count.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> u64 {
        self.put_count.load(Ordering::SeqCst)
    }

    /// Every HEAD fails with `error` until cleared.
    pub async fn fail_head_with(&self, error: Option<ProxyError>) {
        *self.head_failure.lock().await = error;
    }

    /// The next `count` HEADs report `Absent` whatever is stored, like a HEAD
    /// answered just before a concurrent upload finished.
    pub fn answer_stale_heads(&self, count: u64) {
        self.stale_heads.store(count, Ordering::SeqCst);
    }

    /// Every HEAD reads the store, then takes `delay` to answer.
    pub fn delay_heads(&self, delay: Duration) {
        self.head_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next PUT fails with `error`; later PUTs succeed.
    pub async fn fail_next_put_with(&self, error: ProxyError) {
        self.put_failures.lock().await.push_back(error);
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn head(&self, key: &CacheKey) -> Result<Existence, ProxyError> {
        self.head_count.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.head_failure.lock().await.clone() {
            return Err(error);
        }

        let stale = self
            .stale_heads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stale {
            return Ok(Existence::Absent);
        }

        let present = self.objects.lock().await.contains_key(&key.to_string());

        let delay = self.head_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if present {
            Ok(Existence::Present)
        } else {
            Ok(Existence::Absent)
        }
    }

    async fn put(&self, key: &CacheKey, object: PutObject) -> Result<(), ProxyError> {
        self.put_count.fetch_add(1, Ordering::SeqCst);

        let streamed = object.body.is_streaming();
        let declared_length = object.body.content_length();
        let body = object
            .body
            .into_bytes()
            .await
            .map_err(|err| ProxyError::OriginUnavailable(err.to_string()))?;

        if let Some(error) = self.put_failures.lock().await.pop_front() {
            return Err(error);
        }

        assert_eq!(
            body.len() as u64,
            declared_length,
            "declared length must match the uploaded body"
        );

        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                content_type: object.content_type,
                body,
                streamed,
                declared_length,
            },
        );
        Ok(())
    }
}

/// How the mock origin answers every request.
#[derive(Clone, Debug)]
pub struct OriginBehavior {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<&'static str>,
    /// Send the body as several chunks without a `Content-Length`.
    pub chunked: bool,
    pub delay: Duration,
}

impl OriginBehavior {
    pub fn ok(body: &'static str) -> Self {
        Self {
            status: StatusCode::OK,
            body: Bytes::from_static(body.as_bytes()),
            content_type: Some("application/octet-stream"),
            chunked: false,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            content_type: Some("text/plain"),
            ..Self::ok(body)
        }
    }

    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Local HTTP origin on `127.0.0.1:0` that counts and records requests.
pub struct MockOrigin {
    addr: SocketAddr,
    hits: Arc<AtomicU64>,
    paths: Arc<Mutex<Vec<String>>>,
}

impl MockOrigin {
    pub async fn start(behavior: OriginBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU64::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));

        let behavior = Arc::new(behavior);
        let server_hits = Arc::clone(&hits);
        let server_paths = Arc::clone(&paths);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };

                let behavior = Arc::clone(&behavior);
                let hits = Arc::clone(&server_hits);
                let paths = Arc::clone(&server_paths);
                let service = service_fn(move |request: http::Request<hyper::body::Incoming>| {
                    let behavior = Arc::clone(&behavior);
                    let hits = Arc::clone(&hits);
                    let paths = Arc::clone(&paths);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let path = request
                            .uri()
                            .path_and_query()
                            .map(|path| path.as_str().to_string())
                            .unwrap_or_default();
                        paths.lock().await.push(path);

                        if !behavior.delay.is_zero() {
                            tokio::time::sleep(behavior.delay).await;
                        }
                        Ok::<_, Infallible>(origin_response(&behavior))
                    }
                });

                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(socket), service)
                        .await;
                });
            }
        });

        Self { addr, hits, paths }
    }

    /// An address nothing listens on.
    pub async fn unreachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn paths(&self) -> Vec<String> {
        self.paths.lock().await.clone()
    }
}

fn origin_response(behavior: &OriginBehavior) -> Response<BoxBody<Bytes, Infallible>> {
    let body = if behavior.chunked {
        let chunks: Vec<Result<Frame<Bytes>, Infallible>> = behavior
            .body
            .chunks(3)
            .map(|chunk| Ok(Frame::data(Bytes::copy_from_slice(chunk))))
            .collect();
        BodyExt::boxed(StreamBody::new(stream::iter(chunks)))
    } else {
        Full::new(behavior.body.clone()).boxed()
    };

    let mut response = Response::builder()
        .status(behavior.status)
        .header("x-origin", "mock");
    if let Some(content_type) = behavior.content_type {
        response = response.header("content-type", content_type);
    }
    response.body(body).unwrap()
}
