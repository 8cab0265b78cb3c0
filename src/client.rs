use std::time::{Duration, SystemTime};

use http::StatusCode;
use http::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::debug;

use crate::FloodgateResult;
use crate::backoff::{BackoffPolicy, retry_with_backoff, retry_with_backoff_if};
use crate::error::Error;
use crate::rate_limit::{
    Admission, FALLBACK_WINDOW_MAX, RateLimitFeedback, RateLimiterRegistry, endpoint_key,
};
use crate::redirect::{apply_target, resolve_target};
use crate::request::RequestOptions;
use crate::response::Response;
use crate::transport::{DEFAULT_ATTEMPT_TIMEOUT, RequestExecutor};
use crate::util::{
    merge_headers, parse_header_name, parse_header_value, parse_retry_after, truncate_body,
};

const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

pub struct ClientBuilder {
    attempt_timeout: Duration,
    backoff: BackoffPolicy,
    max_redirects: usize,
    max_response_body_bytes: usize,
    default_headers: HeaderMap,
    fallback_window_limit: u32,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            backoff: BackoffPolicy::standard(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            default_headers: HeaderMap::new(),
            fallback_window_limit: FALLBACK_WINDOW_MAX,
        }
    }

    /// Wall-clock budget for a single attempt; retries each get a fresh one.
    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout.max(Duration::from_millis(1));
        self
    }

    /// Delay schedule shared by the network-fault and server-failure retry
    /// layers.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> FloodgateResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    /// Capacity assumed for destinations that never advertise a budget.
    pub fn fallback_window_limit(mut self, fallback_window_limit: u32) -> Self {
        self.fallback_window_limit = fallback_window_limit.max(1);
        self
    }

    pub fn try_build(self) -> FloodgateResult<Client> {
        Ok(Client {
            executor: RequestExecutor::new(self.attempt_timeout, self.max_response_body_bytes)?,
            backoff: self.backoff,
            max_redirects: self.max_redirects,
            default_headers: self.default_headers,
            fallback_window_limit: self.fallback_window_limit,
            rate_limits: RateLimiterRegistry::new(),
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build floodgate client: {error}"))
    }
}

/// The layered request pipeline: redirect following over rate-limited
/// admission over failure-retried single-attempt execution.
///
/// One client carries one [`RateLimiterRegistry`], so every feature fanning
/// out through the same client shares the same per-destination budgets.
pub struct Client {
    executor: RequestExecutor,
    backoff: BackoffPolicy,
    max_redirects: usize,
    default_headers: HeaderMap,
    fallback_window_limit: u32,
    rate_limits: RateLimiterRegistry,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The admission state backing this client, inspectable for diagnostics.
    pub fn rate_limits(&self) -> &RateLimiterRegistry {
        &self.rate_limits
    }

    /// Runs the full pipeline and resolves with whatever non-retryable
    /// status the destination settled on. 3xx responses with a usable
    /// target are followed, each hop re-entering the pipeline against the
    /// new destination with its own buckets and retry budget.
    pub async fn execute(&self, options: RequestOptions) -> FloodgateResult<Response> {
        let mut options = options;
        options.headers = merge_headers(&self.default_headers, &options.headers);
        options.validate()?;

        for _hop in 0..=self.max_redirects {
            let response = self.execute_rate_limited(&options).await?;
            match resolve_target(response.status(), response.headers()) {
                Some(target) => {
                    debug!(from = %options.uri_text(), status = response.status().as_u16(), "following redirect");
                    apply_target(&mut options, target);
                    options.validate()?;
                }
                None => return Ok(response),
            }
        }
        Err(Error::TooManyRedirects {
            max_redirects: self.max_redirects,
            method: options.method.clone(),
            uri: options.uri_text(),
        })
    }

    /// Convenience for JSON APIs: defaults the `accept` header, converts any
    /// non-2xx status into an error, and decodes the body.
    pub async fn fetch_json<T>(&self, options: RequestOptions) -> FloodgateResult<T>
    where
        T: DeserializeOwned,
    {
        self.fetch_ok(options).await?.json()
    }

    /// Like [`Client::fetch_json`] but hands back the body as text.
    pub async fn fetch_text(&self, options: RequestOptions) -> FloodgateResult<String> {
        Ok(self.fetch_ok(options).await?.text_lossy())
    }

    async fn fetch_ok(&self, mut options: RequestOptions) -> FloodgateResult<Response> {
        if !options.headers.contains_key(ACCEPT) {
            options
                .headers
                .insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
        let method = options.method.clone();
        let uri = options.uri_text();

        let response = self.execute(options).await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                method,
                uri,
                body: truncate_body(response.body()),
            });
        }
        Ok(response)
    }

    /// Admission-controlled dispatch. Parks until every window under both
    /// bucket granularities has budget, charges the in-flight counts for the
    /// duration of the attempt, refreshes the budgets from whatever headers
    /// come back, and swallows 429s as pure admission signals.
    async fn execute_rate_limited(&self, options: &RequestOptions) -> FloodgateResult<Response> {
        let host_key = options.hostname.clone();
        let path_key = endpoint_key(&options.hostname, &options.path);
        let fallback_max = options
            .fallback_limit
            .unwrap_or(self.fallback_window_limit);

        loop {
            match self.rate_limits.try_admit(&host_key, &path_key) {
                Admission::RetryAfter(wait) => {
                    debug!(bucket = %path_key, wait_secs = wait.as_secs(), "holding request for budget");
                    sleep(wait).await;
                    continue;
                }
                Admission::Ready => {}
            }

            let guard = InFlightGuard {
                registry: &self.rate_limits,
                host_key: &host_key,
                path_key: &path_key,
            };
            let outcome = self.execute_checked(options).await;
            drop(guard);
            let response = outcome?;

            let feedback = RateLimitFeedback::from_headers(response.headers(), SystemTime::now());
            self.rate_limits
                .ingest(&host_key, &path_key, feedback, fallback_max);

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(response.headers(), SystemTime::now());
                self.rate_limits
                    .note_throttled(&host_key, &path_key, retry_after);
                continue;
            }
            return Ok(response);
        }
    }

    /// A 5xx from the network-retried executor becomes a rejection fed back
    /// through the same backoff schedule; everything else passes through.
    async fn execute_checked(&self, options: &RequestOptions) -> FloodgateResult<Response> {
        let executor = &self.executor;
        let backoff = self.backoff;
        retry_with_backoff_if(
            backoff,
            move || async move {
                let response =
                    retry_with_backoff(backoff, move || executor.execute_once(options)).await?;
                if response.status().is_server_error() {
                    return Err(Error::ServerError {
                        status: response.status().as_u16(),
                    });
                }
                Ok(response)
            },
            Error::is_server_error,
        )
        .await
    }
}

/// Decrements both in-flight counts however the dispatch resolves.
struct InFlightGuard<'a> {
    registry: &'a RateLimiterRegistry,
    host_key: &'a str,
    path_key: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(self.host_key, self.path_key);
    }
}
