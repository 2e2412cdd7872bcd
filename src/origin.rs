use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING, USER_AGENT};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ProxyError, error_chain};
use crate::route::RequestContext;
use crate::store::{BoxError, StreamingBody};

const USER_AGENT_VALUE: &str = concat!("proxxy/", env!("CARGO_PKG_VERSION"));

/// Outcome of an origin GET.
pub enum OriginResponse {
    /// `200 OK`: the body is handed to the store writer.
    Cacheable(CacheableResponse),
    /// Any other status: mirrored to every waiting client, never stored.
    PassThrough(PassThroughResponse),
    /// Any other status with a body too large to replay from memory. Each
    /// waiting client gets its own copy through [`OriginClient::relay`].
    Oversized { status: StatusCode },
}

pub struct CacheableResponse {
    pub content_type: Option<String>,
    /// `None` when the origin did not declare a length up front.
    pub content_length: Option<u64>,
    pub body: StreamingBody,
    /// Origin connection slot, held until the body has been consumed.
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl CacheableResponse {
    pub fn new(
        content_type: Option<String>,
        content_length: Option<u64>,
        body: StreamingBody,
    ) -> Self {
        Self {
            content_type,
            content_length,
            body,
            permit: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PassThroughResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PassThroughResponse {
    pub fn to_response(&self) -> Response<StreamingBody> {
        let mut response = Response::new(full_body(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

/// In-memory body in the streaming body type.
pub(crate) fn full_body(bytes: Bytes) -> StreamingBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Outbound HTTP(S) client for backend origins.
///
/// Concurrent requests are bounded per origin authority.
pub struct OriginClient {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    max_connections_per_host: usize,
    host_limits: Mutex<HashMap<String, Arc<Semaphore>>>,
    passthrough_max_body_bytes: usize,
}

impl OriginClient {
    pub fn new(config: &Config) -> crate::Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);

        let tls = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(err) => {
                warn!("No native root certificates ({err}), using bundled webpki roots");
                HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let https = tls
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_max_idle_per_host(config.max_origin_connections);

        Ok(Self {
            client: builder.build(https),
            max_connections_per_host: config.max_origin_connections,
            host_limits: Mutex::new(HashMap::new()),
            passthrough_max_body_bytes: config.passthrough_max_body_bytes,
        })
    }

    /// GET `<origin><path>`. Only transport failures are errors; any HTTP status
    /// the origin answers with is a response.
    pub async fn fetch(&self, ctx: &RequestContext) -> Result<OriginResponse, ProxyError> {
        let (response, permit) = self.send(ctx).await?;
        classify(response, Some(permit), self.passthrough_max_body_bytes).await
    }

    /// GET `<origin><path>` and hand the response back as-is, minus hop-by-hop
    /// headers. The body streams through and holds the connection slot until
    /// it is dropped.
    pub async fn relay(&self, ctx: &RequestContext) -> Result<Response<StreamingBody>, ProxyError> {
        let (response, permit) = self.send(ctx).await?;
        let (mut parts, body) = response.into_parts();
        parts.headers = strip_hop_headers(&parts.headers);

        let body = body
            .map_frame(move |frame| {
                let _slot = &permit;
                frame
            })
            .map_err(Into::<BoxError>::into);
        Ok(Response::from_parts(parts, BoxBody::new(body)))
    }

    async fn send(
        &self,
        ctx: &RequestContext,
    ) -> Result<(Response<Incoming>, OwnedSemaphorePermit), ProxyError> {
        let url = ctx.origin_url();
        let uri: Uri = url.parse().map_err(|err| {
            ProxyError::OriginUnavailable(format!("invalid origin url {url}: {err}"))
        })?;

        let permit = self.acquire_host_limit(&uri).await?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .body(Empty::new())
            .map_err(|err| ProxyError::OriginUnavailable(err.to_string()))?;

        debug!(url = %url, "origin GET");
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| ProxyError::OriginUnavailable(error_chain(&err)))?;

        Ok((response, permit))
    }

    async fn acquire_host_limit(&self, uri: &Uri) -> Result<OwnedSemaphorePermit, ProxyError> {
        let key = uri
            .authority()
            .map(|authority| authority.as_str().to_string())
            .unwrap_or_default();

        let semaphore = {
            let mut limits = self.host_limits.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                limits
                    .entry(key)
                    .or_insert_with(|| Arc::new(Semaphore::new(self.max_connections_per_host))),
            )
        };

        semaphore
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::OriginUnavailable("connection limiter closed".to_string()))
    }
}

/// Split an origin response into the cacheable and pass-through cases.
///
/// Pass-through bodies are read fully, up to `max_body_bytes`, so that the same
/// response can be replayed to every waiter. Anything larger is `Oversized`.
pub async fn classify<B>(
    response: Response<B>,
    permit: Option<OwnedSemaphorePermit>,
    max_body_bytes: usize,
) -> Result<OriginResponse, ProxyError>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();

    if parts.status != StatusCode::OK {
        let status = parts.status;
        if declared_length(&parts.headers).is_some_and(|len| len > max_body_bytes as u64) {
            return Ok(OriginResponse::Oversized { status });
        }

        let body = match Limited::new(body, max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                return Ok(OriginResponse::Oversized { status });
            }
            Err(err) => return Err(ProxyError::OriginUnavailable(error_chain(&*err))),
        };
        drop(permit);

        return Ok(OriginResponse::PassThrough(PassThroughResponse {
            status,
            headers: strip_hop_headers(&parts.headers),
            body,
        }));
    }

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    Ok(OriginResponse::Cacheable(CacheableResponse {
        content_type,
        content_length: declared_length(&parts.headers),
        body: BoxBody::new(body.map_err(Into::<BoxError>::into)),
        permit,
    }))
}

/// Content length the origin committed to, if any. A chunked response has none
/// even if it also sent a `Content-Length`.
fn declared_length(headers: &HeaderMap) -> Option<u64> {
    if headers.contains_key(TRANSFER_ENCODING) {
        return None;
    }
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn strip_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_header(name.as_str()) {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

fn is_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
