use std::sync::Arc;

use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE, HOST, LOCATION};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use tracing::{debug, error, info};

use crate::cache_key::{CacheKey, KeyStyle};
use crate::config::Config;
use crate::error::{ProxyError, RouteError};
use crate::origin::{OriginClient, OriginResponse, PassThroughResponse, full_body};
use crate::presence::PresenceCache;
use crate::route::{RequestContext, Router};
use crate::signer::UrlSigner;
use crate::single_flight::{FlightRole, SingleFlight};
use crate::store::{Existence, ObjectStore, S3ClientPool, StreamingBody};
use crate::telemetry;
use crate::writer::write_to_store;

/// What a populate produced, shared with every request that joined it.
#[derive(Clone, Debug)]
pub enum Populated {
    /// Stored and signed; every waiter redirects to the same URL.
    Stored { location: String },
    /// The origin answered with a non-cacheable status.
    PassThrough(Arc<PassThroughResponse>),
    /// Non-cacheable and too large to share; every waiter relays its own copy.
    Relay,
}

pub type Outcome = Result<Populated, ProxyError>;

/// Final answer for one request, before it is rendered as HTTP.
#[derive(Debug)]
pub enum Served {
    Redirect(String),
    PassThrough(Arc<PassThroughResponse>),
    Relay,
}

/// The GET pipeline: resolve, check, populate on miss, redirect.
pub struct ProxyService<S: ObjectStore = S3ClientPool> {
    router: Router,
    key_style: KeyStyle,
    store: Arc<S>,
    signer: UrlSigner,
    origin: OriginClient,
    uploads: SingleFlight<CacheKey, Outcome>,
    presence: Option<PresenceCache>,
}

impl<S: ObjectStore> ProxyService<S> {
    pub fn new(config: &Config, store: Arc<S>, signer: UrlSigner, origin: OriginClient) -> Self {
        Self {
            router: Router::new(config),
            key_style: config.key_style,
            store,
            signer,
            origin,
            uploads: SingleFlight::new(),
            presence: PresenceCache::new(
                config.presence_cache_max_entries,
                config.presence_cache_ttl,
            ),
        }
    }

    /// Number of cache keys currently being populated.
    pub fn in_flight_uploads(&self) -> usize {
        self.uploads.in_flight_count()
    }

    pub async fn handle<B>(self: Arc<Self>, request: Request<B>) -> Response<StreamingBody> {
        if request.method() != Method::GET {
            telemetry::record_request_rejected("method");
            debug!(method = %request.method(), "rejecting non-GET request");
            return error_response(&ProxyError::MethodNotAllowed);
        }

        let host = request_host(&request);
        let path = request
            .uri()
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");

        let ctx = match self.router.resolve(host, path) {
            Ok(ctx) => ctx,
            Err(err) => {
                telemetry::record_request_rejected(rejection_reason(err));
                info!(host = ?host, path, error = %err, "rejecting request");
                return error_response(&err.into());
            }
        };
        drop(request);

        let served = match self.serve(&ctx).await {
            Ok(Served::Relay) => self.origin.relay(&ctx).await,
            Ok(Served::Redirect(location)) => Ok(redirect(&location)),
            Ok(Served::PassThrough(response)) => Ok(response.to_response()),
            Err(err) => Err(err),
        };

        match served {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    ProxyError::StoreWriteFailed { status, body } => error!(
                        backend = %ctx.backend().id,
                        region = %ctx.region().id,
                        path = %ctx.path(),
                        status,
                        body = %body,
                        "store rejected upload"
                    ),
                    _ => error!(
                        backend = %ctx.backend().id,
                        region = %ctx.region().id,
                        path = %ctx.path(),
                        error = %err,
                        "request failed"
                    ),
                }
                error_response(&err)
            }
        }
    }

    /// Redirect on a hit; otherwise lead or join the populate for the key.
    pub async fn serve(self: &Arc<Self>, ctx: &RequestContext) -> Result<Served, ProxyError> {
        let key = CacheKey::derive(ctx, self.key_style);

        if self.exists(&key).await? {
            telemetry::record_cache_hit();
            debug!(key = %key, "cache hit");
            let ttl = self.signer.ttl_for(ctx.backend());
            return self.signer.sign(&key, ttl).await.map(Served::Redirect);
        }

        telemetry::record_cache_miss();
        debug!(key = %key, "cache miss");

        let this = Arc::clone(self);
        let leader_ctx = ctx.clone();
        let leader_key = key.clone();
        let (role, outcome) = self
            .uploads
            .run(key, move || async move {
                this.populate(&leader_ctx, &leader_key).await
            })
            .await;

        if role == FlightRole::Follower {
            telemetry::record_populate_coalesced();
        }

        match outcome.unwrap_or(Err(ProxyError::FlightAborted))? {
            Populated::Stored { location } => Ok(Served::Redirect(location)),
            Populated::PassThrough(response) => Ok(Served::PassThrough(response)),
            Populated::Relay => Ok(Served::Relay),
        }
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, ProxyError> {
        if let Some(presence) = &self.presence {
            if presence.contains(key).await {
                return Ok(true);
            }
        }

        match self.store.head(key).await {
            Ok(Existence::Present) => {
                if let Some(presence) = &self.presence {
                    presence.insert(key.clone()).await;
                }
                Ok(true)
            }
            Ok(Existence::Absent) => Ok(false),
            Err(err) => {
                telemetry::record_store_error();
                Err(err)
            }
        }
    }

    /// Leader work: fetch from the origin, store, sign. Runs on its own task.
    async fn populate(&self, ctx: &RequestContext, key: &CacheKey) -> Outcome {
        // A miss observed before an earlier populate of this key released its
        // ticket must not fetch the object a second time.
        if self.exists(key).await? {
            debug!(key = %key, "stored by an earlier populate");
            return self.signed(ctx, key).await;
        }

        let response = self.origin.fetch(ctx).await.inspect_err(|_| {
            telemetry::record_origin_error();
        })?;

        let cacheable = match response {
            OriginResponse::Cacheable(cacheable) => cacheable,
            OriginResponse::PassThrough(response) => {
                telemetry::record_origin_passthrough();
                info!(
                    backend = %ctx.backend().id,
                    path = %ctx.path(),
                    status = response.status.as_u16(),
                    "origin response not cacheable, passing through"
                );
                return Ok(Populated::PassThrough(Arc::new(response)));
            }
            OriginResponse::Oversized { status } => {
                telemetry::record_origin_passthrough();
                info!(
                    backend = %ctx.backend().id,
                    path = %ctx.path(),
                    status = status.as_u16(),
                    "origin response not cacheable and too large to share, relaying"
                );
                return Ok(Populated::Relay);
            }
        };

        let path = write_to_store(self.store.as_ref(), key, cacheable)
            .await
            .inspect_err(|err| match err {
                ProxyError::OriginUnavailable(_) => telemetry::record_origin_error(),
                _ => telemetry::record_store_error(),
            })?;
        telemetry::record_populate_stored(path);
        info!(key = %key, path = %path, "stored object");

        if let Some(presence) = &self.presence {
            presence.insert(key.clone()).await;
        }

        self.signed(ctx, key).await
    }

    async fn signed(&self, ctx: &RequestContext, key: &CacheKey) -> Outcome {
        let ttl = self.signer.ttl_for(ctx.backend());
        let location = self.signer.sign(key, ttl).await?;
        Ok(Populated::Stored { location })
    }
}

/// `Host` header, else the URI authority (HTTP/2 `:authority`).
fn request_host<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
}

fn rejection_reason(err: RouteError) -> &'static str {
    match err {
        RouteError::NoHostHeader => "no_host",
        RouteError::UnknownBackend => "unknown_backend",
        RouteError::UnknownRegion => "unknown_region",
    }
}

fn redirect(location: &str) -> Response<StreamingBody> {
    match HeaderValue::try_from(location) {
        Ok(location) => {
            let mut response = Response::new(full_body(Bytes::new()));
            *response.status_mut() = StatusCode::FOUND;
            response.headers_mut().insert(LOCATION, location);
            response
        }
        Err(err) => error_response(&ProxyError::Signing(err.to_string())),
    }
}

fn error_response(err: &ProxyError) -> Response<StreamingBody> {
    let mut response = Response::new(full_body(Bytes::from(err.to_string())));
    *response.status_mut() = err.status_code();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if matches!(err, ProxyError::MethodNotAllowed) {
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_wins_over_authority() {
        let request = Request::builder()
            .uri("http://authority.example/x")
            .header(HOST, "ftp.mozilla.org")
            .body(())
            .unwrap();
        assert_eq!(request_host(&request), Some("ftp.mozilla.org"));

        let request = Request::builder()
            .uri("http://authority.example/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&request), Some("authority.example"));

        let request = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_host(&request), None);
    }

    #[test]
    fn error_responses_are_plain_text() {
        let response = error_response(&ProxyError::Route(RouteError::UnknownBackend));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );

        let response = error_response(&ProxyError::MethodNotAllowed);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET");
    }

    #[test]
    fn redirect_sets_location() {
        let response = redirect("https://s3.example/bucket/key?X-Amz-Signature=abc");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://s3.example/bucket/key?X-Amz-Signature=abc"
        );

        let response = redirect("bad\nvalue");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
