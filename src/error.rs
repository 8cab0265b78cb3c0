use http::Method;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can escape the pipeline as a rejection.
///
/// HTTP status codes are not errors at the pipeline level: a 4xx (including
/// 429, which the rate limiter absorbs) resolves normally as a [`Response`]
/// for the caller to interpret. Only network faults and exhausted 5xx retries
/// reject, plus the construction errors below.
///
/// [`Response`]: crate::Response
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request options require a hostname")]
    MissingHostname,
    #[error("request path must start with '/': {path}")]
    InvalidPath { path: String },
    #[error("request body requires a content-type header")]
    MissingContentType,
    #[error("authorization header requires a secure transport")]
    InsecureAuthorization,
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to initialize tls transport: {message}")]
    TlsInit { message: String },
    #[error("http transport error for {method} {uri}: {source}")]
    Transport {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("response body too large ({actual_bytes} bytes > {limit_bytes} bytes)")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
    #[error("failed to decode response content-encoding {encoding}: {message}")]
    DecodeContentEncoding { encoding: String, message: String },
    #[error("HTTP Error {status}")]
    ServerError { status: u16 },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    TooManyRedirects {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl Error {
    /// True for the rejection class the failure-retry layer re-dispatches on.
    pub const fn is_server_error(&self) -> bool {
        matches!(self, Self::ServerError { .. })
    }
}
