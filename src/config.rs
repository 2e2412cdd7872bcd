use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Formatter},
    net::SocketAddr,
    time::Duration,
};

use http::Uri;

use crate::cache_key::KeyStyle;

/// Longest lifetime a SigV4 presigned URL may carry.
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_BUCKET_PREFIX: &str = "mozilla-releng-proxxy-";

const DEFAULT_BACKENDS: &str = "\
    ftp.mozilla.org=https://ftp.mozilla.org,\
    runtime-binaries.pvt.build.mozilla.org=http://runtime-binaries.pvt.build.mozilla.org,\
    pypi.pvt.build.mozilla.org=http://pypi.pvt.build.mozilla.org,\
    pypi.pub.build.mozilla.org=http://pypi.pub.build.mozilla.org";

const DEFAULT_REGIONS: &str = "\
    use1=us-east-1|s3-external-1.amazonaws.com|,\
    usw2=us-west-2|s3-us-west-2.amazonaws.com|us-west-2";

/// An upstream origin, selected when the request host starts with `id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub id: String,
    /// Scheme and authority (and optional base path) without a trailing slash.
    pub origin: String,
    /// Overrides the global signed-URL lifetime for objects of this backend.
    pub signed_url_ttl: Option<Duration>,
}

/// An object-store deployment, selected when the request host contains `.<id>.`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub id: String,
    /// Store region name used for signing, e.g. `us-west-2`.
    pub name: String,
    pub endpoint: String,
    /// Bucket location constraint; empty for the store's default location.
    pub location: String,
    pub bucket: String,
}

impl Region {
    /// Endpoint as a URL, defaulting to `https` when configured as a bare host.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            format!("https://{}", self.endpoint)
        }
    }
}

pub struct Config {
    pub listen_addr: SocketAddr,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_prefix: String,
    /// In configuration order; the first backend whose id prefixes the host wins.
    pub backends: Vec<Backend>,
    pub regions: Vec<Region>,
    /// `None` makes an unrecognised region a client error.
    pub default_region: Option<String>,
    pub signed_url_ttl: Duration,
    pub expiration_days: i32,
    pub key_style: KeyStyle,
    pub max_origin_connections: usize,
    pub max_store_connections: usize,
    pub passthrough_max_body_bytes: usize,
    pub presence_cache_max_entries: usize,
    pub presence_cache_ttl: Duration,
    pub worker_threads: usize,
    pub otel_grpc_endpoint_url: Option<String>,
    pub prometheus_textfile_dir: Option<String>,
}

impl Config {
    pub fn from_env(vars: &HashMap<String, String>) -> Self {
        let bucket_prefix = vars
            .get("BUCKET_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BUCKET_PREFIX.to_string());

        let config = Self {
            listen_addr: vars
                .get("LISTEN_ADDR")
                .map(|s| s.parse().expect("invalid LISTEN_ADDR"))
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000))),
            access_key_id: vars
                .get("AWS_ACCESS_KEY")
                .cloned()
                .expect("AWS_ACCESS_KEY is required"),
            secret_access_key: vars
                .get("AWS_SECRET_KEY")
                .cloned()
                .expect("AWS_SECRET_KEY is required"),
            backends: parse_backends(
                vars.get("BACKENDS")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_BACKENDS),
            ),
            regions: parse_regions(
                vars.get("REGIONS")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_REGIONS),
                &bucket_prefix,
            ),
            bucket_prefix,
            default_region: match vars.get("DEFAULT_REGION") {
                Some(region) if region.trim().is_empty() => None,
                Some(region) => Some(region.trim().to_ascii_lowercase()),
                None => Some("use1".to_string()),
            },
            signed_url_ttl: vars
                .get("SIGNED_URL_TTL_SECONDS")
                .map(|s| Duration::from_secs(s.parse().expect("invalid SIGNED_URL_TTL_SECONDS")))
                .unwrap_or(Duration::from_secs(3600)),
            expiration_days: vars
                .get("EXPIRATION_DAYS")
                .map(|s| s.parse().expect("invalid EXPIRATION_DAYS"))
                .unwrap_or(30),
            key_style: match vars
                .get("CACHE_KEY_FILENAME")
                .map(|s| s.parse::<bool>().expect("invalid CACHE_KEY_FILENAME"))
            {
                Some(true) => KeyStyle::HashWithFilename,
                _ => KeyStyle::Hash,
            },
            max_origin_connections: vars
                .get("MAX_ORIGIN_CONNECTIONS")
                .map(|s| s.parse().expect("invalid MAX_ORIGIN_CONNECTIONS"))
                .unwrap_or(25),
            max_store_connections: vars
                .get("MAX_STORE_CONNECTIONS")
                .map(|s| s.parse().expect("invalid MAX_STORE_CONNECTIONS"))
                .unwrap_or(25),
            passthrough_max_body_bytes: vars
                .get("PASSTHROUGH_MAX_BODY_BYTES")
                .map(|s| s.parse().expect("invalid PASSTHROUGH_MAX_BODY_BYTES"))
                .unwrap_or(8 * 1024 * 1024),
            presence_cache_max_entries: vars
                .get("PRESENCE_CACHE_MAX_ENTRIES")
                .map(|s| s.parse().expect("invalid PRESENCE_CACHE_MAX_ENTRIES"))
                .unwrap_or(0),
            presence_cache_ttl: vars
                .get("PRESENCE_CACHE_TTL_SECONDS")
                .map(|s| {
                    Duration::from_secs(s.parse().expect("invalid PRESENCE_CACHE_TTL_SECONDS"))
                })
                .unwrap_or(Duration::from_secs(60)),
            worker_threads: vars
                .get("WORKER_THREADS")
                .map(|s| s.parse().expect("invalid WORKER_THREADS"))
                .unwrap_or(4),
            otel_grpc_endpoint_url: vars.get("OTEL_GRPC_ENDPOINT_URL").cloned(),
            prometheus_textfile_dir: vars.get("PROMETHEUS_TEXTFILE_DIR").cloned(),
        };

        config.validate();
        config
    }

    pub fn region(&self, id: &str) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == id)
    }

    fn validate(&self) {
        if self.backends.is_empty() {
            panic!("Invalid configuration: at least one backend must be configured");
        }

        if self.regions.is_empty() {
            panic!("Invalid configuration: at least one region must be configured");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                panic!("Invalid configuration: duplicate backend {}", backend.id);
            }

            let uri: Uri = backend.origin.parse().unwrap_or_else(|err| {
                panic!(
                    "Invalid configuration: backend {} has invalid url {}: {err}",
                    backend.id, backend.origin
                )
            });
            if !matches!(uri.scheme_str(), Some("http" | "https")) || uri.authority().is_none() {
                panic!(
                    "Invalid configuration: backend {} url must be http(s)://host, got {}",
                    backend.id, backend.origin
                );
            }

            if let Some(ttl) = backend.signed_url_ttl {
                validate_ttl(&format!("backend {} signed_url_ttl", backend.id), ttl);
            }
        }

        let mut seen = HashSet::new();
        for region in &self.regions {
            if !seen.insert(region.id.as_str()) {
                panic!("Invalid configuration: duplicate region {}", region.id);
            }

            let endpoint = region.endpoint_url();
            let valid = endpoint
                .parse::<Uri>()
                .map(|uri| uri.authority().is_some())
                .unwrap_or(false);
            if !valid {
                panic!(
                    "Invalid configuration: region {} has invalid endpoint {}",
                    region.id, region.endpoint
                );
            }
        }

        if let Some(default_region) = &self.default_region {
            if self.region(default_region).is_none() {
                panic!(
                    "Invalid configuration: default_region {} is not a configured region",
                    default_region
                );
            }
        }

        validate_ttl("signed_url_ttl", self.signed_url_ttl);

        if self.expiration_days <= 0 {
            panic!("Invalid configuration: expiration_days must be greater than 0");
        }

        if self.max_origin_connections == 0 {
            panic!("Invalid configuration: max_origin_connections must be greater than 0");
        }

        if self.max_store_connections == 0 {
            panic!("Invalid configuration: max_store_connections must be greater than 0");
        }

        if self.presence_cache_max_entries > 0 && self.presence_cache_ttl.is_zero() {
            panic!("Invalid configuration: presence_cache_ttl must be greater than 0");
        }

        if self.worker_threads == 0 {
            panic!("Invalid configuration: worker_threads must be greater than 0");
        }
    }
}

fn validate_ttl(name: &str, ttl: Duration) {
    if ttl.is_zero() || ttl > MAX_SIGNED_URL_TTL {
        panic!(
            "Invalid configuration: {name} must be between 1 and {} seconds",
            MAX_SIGNED_URL_TTL.as_secs()
        );
    }
}

/// Parse `id=url[@ttl_secs]` entries separated by commas. Only an all-digit
/// suffix is a TTL, so `http://user@host` keeps its userinfo.
fn parse_backends(list: &str) -> Vec<Backend> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, rest) = entry
                .split_once('=')
                .unwrap_or_else(|| panic!("invalid BACKENDS entry: {entry}"));
            let ttl_suffix = rest
                .rsplit_once('@')
                .filter(|(_, ttl)| !ttl.is_empty() && ttl.bytes().all(|b| b.is_ascii_digit()));
            let (origin, signed_url_ttl) = match ttl_suffix {
                Some((origin, ttl)) => {
                    let secs = ttl
                        .parse()
                        .unwrap_or_else(|_| panic!("invalid BACKENDS ttl: {entry}"));
                    (origin, Some(Duration::from_secs(secs)))
                }
                None => (rest, None),
            };

            Backend {
                id: id.trim().to_ascii_lowercase(),
                origin: origin.trim().trim_end_matches('/').to_string(),
                signed_url_ttl,
            }
        })
        .collect()
}

/// Parse `id=region|endpoint|location` entries separated by commas.
fn parse_regions(list: &str, bucket_prefix: &str) -> Vec<Region> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, rest) = entry
                .split_once('=')
                .unwrap_or_else(|| panic!("invalid REGIONS entry: {entry}"));
            let mut fields = rest.split('|').map(str::trim);
            let (Some(name), Some(endpoint)) = (fields.next(), fields.next()) else {
                panic!("invalid REGIONS entry: {entry}");
            };
            let location = fields.next().unwrap_or_default();
            let id = id.trim().to_ascii_lowercase();

            Region {
                bucket: format!("{bucket_prefix}{id}"),
                id,
                name: name.to_string(),
                endpoint: endpoint.to_string(),
                location: location.to_string(),
            }
        })
        .collect()
}

impl Display for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let backends: Vec<&str> = self.backends.iter().map(|b| b.id.as_str()).collect();
        let regions: Vec<&str> = self.regions.iter().map(|r| r.id.as_str()).collect();
        write!(
            f,
            "Config{{ listen_addr: {}, bucket_prefix: {}, backends: {:?}, regions: {:?}, \
             default_region: {:?}, signed_url_ttl: {}s, expiration_days: {}, key_style: {:?}, \
             max_origin_connections: {}, max_store_connections: {}, \
             passthrough_max_body_bytes: {}, presence_cache_max_entries: {}, \
             presence_cache_ttl: {}s, worker_threads: {}, otel_grpc_endpoint_url: {:?}, \
             prometheus_textfile_dir: {:?} }}",
            self.listen_addr,
            self.bucket_prefix,
            backends,
            regions,
            self.default_region,
            self.signed_url_ttl.as_secs(),
            self.expiration_days,
            self.key_style,
            self.max_origin_connections,
            self.max_store_connections,
            self.passthrough_max_body_bytes,
            self.presence_cache_max_entries,
            self.presence_cache_ttl.as_secs(),
            self.worker_threads,
            self.otel_grpc_endpoint_url,
            self.prometheus_textfile_dir,
        )
    }
}
