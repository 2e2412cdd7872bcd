use std::{sync::LazyLock, time::Duration};

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::writer::WritePath;
use crate::{CARGO_CRATE_NAME, Config};

static RESOURCE: LazyLock<opentelemetry_sdk::Resource> = LazyLock::new(|| {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(CARGO_CRATE_NAME)
        .build()
});

// Prometheus registry and metrics

pub(crate) static PROMETHEUS_REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    Registry::new_custom(Some("proxxy".to_string()), None)
        .expect("Failed to create Prometheus registry")
});

static PROM_CACHE_HIT: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "cache_hit_total",
        "Requests answered with a redirect to an object already in the store",
    )
    .unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

static PROM_CACHE_MISS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "cache_miss_total",
        "Requests for objects not yet in the store",
    )
    .unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

static PROM_POPULATE_STORED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "populate_stored_total",
            "Origin responses written to the store, by upload path",
        ),
        &["path"],
    )
    .unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

static PROM_POPULATE_COALESCED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "populate_coalesced_total",
        "Cache misses that joined an upload already in flight",
    )
    .unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

static PROM_ORIGIN_PASSTHROUGH: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "origin_passthrough_total",
        "Non-cacheable origin responses mirrored to the client",
    )
    .unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

static PROM_ORIGIN_ERROR: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("origin_error_total", "Origin transport failures").unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

static PROM_STORE_ERROR: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "store_error_total",
        "Failed or unexpected object store operations",
    )
    .unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

static PROM_REQUEST_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "request_rejected_total",
            "Requests rejected before any store or origin call",
        ),
        &["reason"],
    )
    .unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

static PROM_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "single_flight_in_flight",
        "Cache keys with an origin fetch and upload in progress",
    )
    .unwrap();
    PROMETHEUS_REGISTRY
        .register(Box::new(gauge.clone()))
        .unwrap();
    gauge
});

pub(crate) fn initialize_telemetry(
    config: &Config,
) -> crate::Result<(
    opentelemetry_sdk::metrics::SdkMeterProvider,
    Option<opentelemetry_sdk::logs::SdkLoggerProvider>,
)> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let logs_provider = init_logs(config.otel_grpc_endpoint_url.as_deref())?;

    match logs_provider.as_ref() {
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        Some(logs_provider) => {
            let otel_layer = OpenTelemetryTracingBridge::new(logs_provider);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(otel_layer)
                .init();
        }
    }

    let metrics_provider = init_metrics(config.otel_grpc_endpoint_url.as_deref())?;

    Ok((metrics_provider, logs_provider))
}

fn init_logs(
    otel_grpc_endpoint_url: Option<&str>,
) -> crate::Result<Option<opentelemetry_sdk::logs::SdkLoggerProvider>> {
    let Some(otel_grpc_endpoint_url) = otel_grpc_endpoint_url else {
        return Ok(None);
    };

    let otlp_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_compression(Compression::Gzip)
        .with_endpoint(otel_grpc_endpoint_url)
        .with_timeout(Duration::from_secs(5))
        .build()?;

    let provider = opentelemetry_sdk::logs::SdkLoggerProvider::builder()
        .with_resource(RESOURCE.clone())
        .with_batch_exporter(otlp_exporter)
        .build();

    Ok(Some(provider))
}

pub(crate) fn shutdown_logs(logs_provider: Option<opentelemetry_sdk::logs::SdkLoggerProvider>) {
    let Some(logs_provider) = logs_provider else {
        return;
    };

    if let Err(error) = logs_provider.shutdown() {
        error!("Error during logs shutdown: {error:?}");
    }
}

fn init_metrics(
    otel_grpc_endpoint_url: Option<&str>,
) -> crate::Result<opentelemetry_sdk::metrics::SdkMeterProvider> {
    let builder =
        opentelemetry_sdk::metrics::SdkMeterProvider::builder().with_resource(RESOURCE.clone());

    let provider = match otel_grpc_endpoint_url {
        None => {
            info!("opentelemetry_stdout initialized");
            builder.with_periodic_exporter(opentelemetry_stdout::MetricExporter::default())
        }
        Some(otel_grpc_endpoint_url) => {
            info!("opentelemetry_otlp initialized");
            let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_compression(Compression::Gzip)
                .with_endpoint(otel_grpc_endpoint_url)
                .with_timeout(Duration::from_secs(5))
                .build()?;

            builder.with_periodic_exporter(otlp_exporter)
        }
    }
    .build();

    opentelemetry::global::set_meter_provider(provider.clone());

    Ok(provider)
}

pub(crate) fn shutdown_metrics(metric_provider: opentelemetry_sdk::metrics::SdkMeterProvider) {
    if let Err(error) = metric_provider.shutdown() {
        error!("Error during metric shutdown: {error:?}");
    }
}

// Cache metrics

static CACHE_HIT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_counter("cache.hit")
        .with_description("Requests answered with a redirect to an object already in the store")
        .build()
});

static CACHE_MISS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_counter("cache.miss")
        .with_description("Requests for objects not yet in the store")
        .build()
});

pub(crate) fn record_cache_hit() {
    CACHE_HIT.add(1, &[]);
    PROM_CACHE_HIT.inc();
}

pub(crate) fn record_cache_miss() {
    CACHE_MISS.add(1, &[]);
    PROM_CACHE_MISS.inc();
}

// Populate metrics

static POPULATE_STORED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_counter("populate.stored")
        .with_description("Origin responses written to the store, by upload path")
        .build()
});

static POPULATE_COALESCED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_counter("populate.coalesced")
        .with_description("Cache misses that joined an upload already in flight")
        .build()
});

static SINGLE_FLIGHT_IN_FLIGHT: LazyLock<Gauge<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_gauge("single_flight.in_flight")
        .with_description("Cache keys with an origin fetch and upload in progress")
        .build()
});

pub(crate) fn record_populate_stored(path: WritePath) {
    POPULATE_STORED.add(1, &[KeyValue::new("path", path.as_str())]);
    PROM_POPULATE_STORED
        .with_label_values(&[path.as_str()])
        .inc();
}

pub(crate) fn record_populate_coalesced() {
    POPULATE_COALESCED.add(1, &[]);
    PROM_POPULATE_COALESCED.inc();
}

pub(crate) fn record_in_flight(count: usize) {
    SINGLE_FLIGHT_IN_FLIGHT.record(count as u64, &[]);
    PROM_IN_FLIGHT.set(count as i64);
}

// Upstream metrics

static ORIGIN_PASSTHROUGH: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_counter("origin.passthrough")
        .with_description("Non-cacheable origin responses mirrored to the client")
        .build()
});

static ORIGIN_ERROR: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_counter("origin.error")
        .with_description("Origin transport failures")
        .build()
});

static STORE_ERROR: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_counter("store.error")
        .with_description("Failed or unexpected object store operations")
        .build()
});

pub(crate) fn record_origin_passthrough() {
    ORIGIN_PASSTHROUGH.add(1, &[]);
    PROM_ORIGIN_PASSTHROUGH.inc();
}

pub(crate) fn record_origin_error() {
    ORIGIN_ERROR.add(1, &[]);
    PROM_ORIGIN_ERROR.inc();
}

pub(crate) fn record_store_error() {
    STORE_ERROR.add(1, &[]);
    PROM_STORE_ERROR.inc();
}

static REQUEST_REJECTED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    opentelemetry::global::meter(CARGO_CRATE_NAME)
        .u64_counter("request.rejected")
        .with_description("Requests rejected before any store or origin call")
        .build()
});

/// `reason` is a short static label such as `method` or `unknown_backend`.
pub(crate) fn record_request_rejected(reason: &'static str) {
    REQUEST_REJECTED.add(1, &[KeyValue::new("reason", reason)]);
    PROM_REQUEST_REJECTED.with_label_values(&[reason]).inc();
}
