use std::{convert::Infallible, sync::Arc, time::Duration};

use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::retry::RetryConfig;
use hyper::service::service_fn;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnBuilder,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub use cache_key::{CacheKey, KeyStyle};
pub use config::{Backend, Config, Region};
pub use error::{ApplicationError, ProxyError, RouteError};
pub use origin::{CacheableResponse, OriginClient, OriginResponse, PassThroughResponse};
pub use provision::provision_buckets;
pub use proxy_service::{Outcome, Populated, ProxyService, Served};
pub use route::{RequestContext, Router};
pub use signer::UrlSigner;
pub use single_flight::{Flight, FlightGuard, FlightRole, FlightWaiter, SingleFlight};
pub use store::{
    BoxError, Existence, ObjectStore, PutObject, S3ClientPool, StoreBody, StreamingBody,
};
pub use writer::{WritePath, write_to_store};

pub mod cache_key;
mod config;
mod error;
mod metrics_writer;
pub mod origin;
mod presence;
mod provision;
mod proxy_service;
pub mod route;
mod signer;
pub mod single_flight;
pub mod store;
mod telemetry;
mod writer;

pub type Result<T> = std::result::Result<T, ApplicationError>;

static CARGO_CRATE_NAME: &str = env!("CARGO_CRATE_NAME");

/// Shared AWS configuration with the static store credentials. Per-region
/// clients override region and endpoint.
pub async fn load_sdk_config(config: &Config) -> SdkConfig {
    let credentials = Credentials::new(
        &config.access_key_id,
        &config.secret_access_key,
        None,
        None,
        "proxxy-static",
    );

    let region = config
        .default_region
        .as_deref()
        .and_then(|id| config.region(id))
        .or_else(|| config.regions.first())
        .map(|region| aws_sdk_s3::config::Region::new(region.name.clone()));

    aws_config::defaults(BehaviorVersion::latest())
        .credentials_provider(credentials)
        .region(region)
        .retry_config(RetryConfig::disabled())
        .load()
        .await
}

pub async fn start_app(config: Config) -> Result<()> {
    let (metrics_provider, logs_provider) = telemetry::initialize_telemetry(&config)?;

    info!("Starting {CARGO_CRATE_NAME} with {config}");

    let sdk_config = load_sdk_config(&config).await;
    let pool = Arc::new(S3ClientPool::new(&sdk_config, &config));
    let signer = UrlSigner::new(Arc::clone(&pool), config.signed_url_ttl);
    let origin = OriginClient::new(&config)?;
    let proxy = Arc::new(ProxyService::new(&config, pool, signer, origin));

    if let Some(textfile_dir) = config.prometheus_textfile_dir.clone() {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            if let Err(err) = metrics_writer::start_metrics_writer(textfile_dir, proxy).await {
                error!("Metrics writer stopped: {err}");
            }
        });
    }

    let listener = TcpListener::bind(config.listen_addr).await?;
    let http_server = ConnBuilder::new(TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    info!("Listening on http://{}/", config.listen_addr);

    loop {
        let (socket, remote_addr) = tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!("Error accepting connection: {err}");
                        continue;
                    }
                }
            }
            _ = ctrl_c.as_mut() => { break; }
        };

        debug!("Accepted connection from {remote_addr}");

        let proxy = Arc::clone(&proxy);
        let service = service_fn(move |request| {
            let proxy = Arc::clone(&proxy);
            async move { Ok::<_, Infallible>(proxy.handle(request).await) }
        });

        let conn = http_server.serve_connection(TokioIo::new(socket), service);
        let conn = graceful.watch(conn.into_owned());
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Connection error: {err}");
            }
        });
    }

    info!("Shutting down gracefully...");

    tokio::select! {
        () = graceful.shutdown() => {
            info!("Graceful shutdown complete");
        },
        () = tokio::time::sleep(Duration::from_secs(10)) => {
            info!("Graceful shutdown timed out after 10s, aborting");
        }
    }

    telemetry::shutdown_metrics(metrics_provider);
    telemetry::shutdown_logs(logs_provider);

    Ok(())
}

/// Create and configure the cache buckets, then exit.
pub async fn run_provision(config: Config) -> Result<()> {
    let (metrics_provider, logs_provider) = telemetry::initialize_telemetry(&config)?;

    info!("Provisioning buckets with {config}");
    let sdk_config = load_sdk_config(&config).await;
    let result = provision_buckets(&config, &sdk_config).await;

    telemetry::shutdown_metrics(metrics_provider);
    telemetry::shutdown_logs(logs_provider);

    result
}
