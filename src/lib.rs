//! `floodgate` is a resilient, rate-limited HTTP request pipeline for
//! services that fan out to many third-party REST APIs at once.
//!
//! A call runs through four layers, outermost first:
//!
//! 1. **Redirect following** — a 3xx with a usable `Location` re-enters the
//!    whole pipeline against the new destination, which gets its own rate
//!    limiting and retry behavior; hops are capped.
//! 2. **Rate limiting** — admission control against per-host and
//!    per-endpoint budgets learned live from vendor response headers
//!    (`x-app-rate-limit` style multi-window pairs, or the
//!    `x-ratelimit-limit`/`-remaining`/`-reset` triple), with a
//!    conservative in-flight surcharge so concurrent callers never overrun
//!    a budget the server has not confirmed yet. 429s never surface; they
//!    only teach the limiter when to try again.
//! 3. **Server-failure retry** — any 5xx is retried on a doubling delay up
//!    to a give-up ceiling.
//! 4. **Execution** — one timed attempt over a pooled TLS transport with
//!    transparent gzip decoding, itself retried on network faults under the
//!    same backoff contract.
//!
//! # Quick Start
//!
//! ```no_run
//! use floodgate::{Client, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder().try_build()?;
//!
//!     let profile: serde_json::Value = client
//!         .fetch_json(
//!             RequestOptions::get("api.example.com")
//!                 .path("/v1/users/1234/profile")
//!                 .try_header("authorization", "Bearer token")?,
//!         )
//!         .await?;
//!
//!     println!("{profile}");
//!     Ok(())
//! }
//! ```
//!
//! Statuses other than 3xx/429/5xx resolve normally from
//! [`Client::execute`]; interpreting a 4xx is the caller's business. The
//! convenience [`Client::fetch_json`] / [`Client::fetch_text`] wrappers are
//! for callers that only want a decoded 2xx body.

mod backoff;
mod client;
mod error;
mod rate_limit;
mod redirect;
mod request;
mod response;
mod transport;
mod util;

pub use crate::backoff::{BackoffPolicy, retry_with_backoff, retry_with_backoff_if};
pub use crate::client::{Client, ClientBuilder};
pub use crate::error::Error;
pub use crate::rate_limit::{
    RateLimitFeedback, RateLimitWindow, RateLimiterRegistry, WindowSpec,
};
pub use crate::request::RequestOptions;
pub use crate::response::Response;

pub type FloodgateResult<T> = std::result::Result<T, Error>;
