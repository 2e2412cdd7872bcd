use http::StatusCode;

/// Upper bound on how much of a failed store response body is kept for diagnostics.
pub const STORE_ERROR_BODY_LIMIT: usize = 1024;

/// Application-level errors for the proxy.
///
/// This enum wraps the error types that can occur during startup, bucket
/// provisioning and while the listener is running.
pub enum ApplicationError {
    /// I/O error (e.g., binding the listener, loading TLS roots).
    Io(std::io::Error),
    /// OpenTelemetry OTLP exporter build error.
    Otlp(opentelemetry_otlp::ExporterBuildError),
    /// Object store rejected an administrative operation.
    Store(String),
    /// Internal application error with description.
    Internal(String),
}

impl std::error::Error for ApplicationError {}

impl std::fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            ApplicationError::Io(io_error) => write!(f, "IO error: {io_error:?}"),
            ApplicationError::Otlp(otlp_error) => write!(f, "Otlp error: {otlp_error:?}"),
            ApplicationError::Store(message) => write!(f, "Store error: {message}"),
            Self::Internal(message) => write!(f, "Internal error: {message}"),
        }
    }
}

impl std::fmt::Debug for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl From<std::io::Error> for ApplicationError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<opentelemetry_otlp::ExporterBuildError> for ApplicationError {
    fn from(value: opentelemetry_otlp::ExporterBuildError) -> Self {
        Self::Otlp(value)
    }
}

/// Why a request could not be mapped onto a backend and region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteError {
    NoHostHeader,
    UnknownBackend,
    UnknownRegion,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            RouteError::NoHostHeader => "no host header",
            RouteError::UnknownBackend => "unknown backend",
            RouteError::UnknownRegion => "unknown region",
        };
        f.write_str(message)
    }
}

/// Errors on the request path.
///
/// `Clone` because one populate outcome is handed to every request that joined
/// the same in-flight upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyError {
    /// The request could not be routed. Always a client error.
    Route(RouteError),
    /// Anything other than `GET`.
    MethodNotAllowed,
    /// The origin could not be reached or its body could not be read.
    OriginUnavailable(String),
    /// The object store could not be reached.
    StoreUnavailable(String),
    /// The object store answered an existence check with neither found nor not-found.
    UnexpectedStoreResponse { status: u16 },
    /// The object store rejected an upload.
    StoreWriteFailed { status: u16, body: String },
    /// A signed URL could not be produced.
    Signing(String),
    /// The task populating the cache went away without reporting an outcome.
    FlightAborted,
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Route(_) => StatusCode::BAD_REQUEST,
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::error::Error for ProxyError {}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Route(route) => write!(f, "{route}"),
            ProxyError::MethodNotAllowed => write!(f, "method not allowed"),
            ProxyError::OriginUnavailable(detail) => write!(f, "origin unavailable: {detail}"),
            ProxyError::StoreUnavailable(detail) => write!(f, "store unavailable: {detail}"),
            ProxyError::UnexpectedStoreResponse { status } => {
                write!(f, "unexpected store HEAD status code: {status}")
            }
            ProxyError::StoreWriteFailed { status, .. } => {
                write!(f, "unexpected store PUT status code: {status}")
            }
            ProxyError::Signing(detail) => write!(f, "signing failed: {detail}"),
            ProxyError::FlightAborted => write!(f, "upload aborted before completion"),
        }
    }
}

impl From<RouteError> for ProxyError {
    fn from(value: RouteError) -> Self {
        Self::Route(value)
    }
}

/// Render an error together with its chain of sources, outermost first.
pub(crate) fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Lossy, bounded rendering of a store error body.
pub(crate) fn truncate_body(body: &[u8]) -> String {
    if body.len() <= STORE_ERROR_BODY_LIMIT {
        return String::from_utf8_lossy(body).into_owned();
    }

    let mut message = String::from_utf8_lossy(&body[..STORE_ERROR_BODY_LIMIT]).into_owned();
    message.push_str("...(truncated)");
    message
}
