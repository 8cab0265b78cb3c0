//! Adaptive per-destination admission control.
//!
//! Every destination is tracked at two granularities at once: the exact
//! hostname, and hostname plus canonicalized path (digit-bearing segments
//! dropped, so `/users/123` and `/users/456` share one endpoint bucket).
//! Each bucket holds a list of [`RateLimitWindow`]s — vendors may publish a
//! short burst window and a long sustained window side by side — seeded with
//! a capacity-1 canary before any server feedback exists and replaced
//! wholesale from live response headers after every request.
//!
//! Admission adds the in-flight count to the server-confirmed count before
//! comparing against capacity: server feedback always lags actual send
//! volume under concurrent fan-out, so the sum is a conservative bound.
//! Under a large simultaneous burst this can leave roughly half the true
//! budget unused, which is the accepted trade-off for never overrunning a
//! budget from an uncoordinated set of callers.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use http::HeaderMap;
use tracing::warn;

use crate::util::lock_unpoisoned;

pub(crate) const FALLBACK_WINDOW_MAX: u32 = 100;
const FALLBACK_WINDOW_LENGTH_SECS: u64 = 1;

const APP_RATE_LIMIT: &str = "x-app-rate-limit";
const METHOD_RATE_LIMIT: &str = "x-method-rate-limit";
const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// One admission budget over a fixed period.
#[derive(Clone, Debug)]
pub struct RateLimitWindow {
    max: u32,
    length_secs: u64,
    count: u32,
    opened_at: Instant,
    fake: bool,
    next_secs: Option<u64>,
}

impl RateLimitWindow {
    fn confirmed(spec: WindowSpec, now: Instant) -> Self {
        Self {
            max: spec.max,
            length_secs: spec.length_secs.max(1),
            count: spec.count,
            opened_at: now,
            fake: false,
            next_secs: None,
        }
    }

    fn fabricated(max: u32, length_secs: u64, now: Instant) -> Self {
        Self {
            max: max.max(1),
            length_secs: length_secs.max(1),
            count: 0,
            opened_at: now,
            fake: true,
            next_secs: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        let since_open = now.saturating_duration_since(self.opened_at);
        if since_open > Duration::from_secs(self.length_secs) {
            return true;
        }
        match self.next_secs {
            Some(next) => since_open > Duration::from_secs(next),
            None => false,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.count = 0;
        self.opened_at = now;
    }

    /// How long a blocked caller parks before rechecking this window.
    fn horizon_secs(&self) -> u64 {
        match self.next_secs {
            Some(next) => next.min(self.length_secs),
            None => self.length_secs,
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn length_secs(&self) -> u64 {
        self.length_secs
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Fabricated locally rather than confirmed by the server.
    pub fn is_fake(&self) -> bool {
        self.fake
    }

    /// Early forced-reset hint picked up from a 429 Retry-After.
    pub fn retry_hint_secs(&self) -> Option<u64> {
        self.next_secs
    }
}

/// Normalized `max` / `length` / `count` triple parsed from vendor headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSpec {
    pub max: u32,
    pub length_secs: u64,
    pub count: u32,
}

/// Which convention a response advertised its budgets in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitFeedback {
    /// `x-app-rate-limit(-count)` plus the `x-method-rate-limit` analogues:
    /// comma-separated `max:length` pairs, app-wide budgets for the host
    /// bucket and method-scoped budgets for the endpoint bucket. An absent
    /// side falls back to a fabricated window so the bucket is not starved
    /// by an earlier canary.
    MultiWindow {
        app: Vec<WindowSpec>,
        method: Vec<WindowSpec>,
    },
    /// `x-ratelimit-limit` / `-remaining` / `-reset` (epoch seconds): one
    /// window serving both buckets.
    SingleWindow(WindowSpec),
    /// No recognized headers; both buckets get a fabricated window.
    Unknown,
}

impl RateLimitFeedback {
    pub fn from_headers(headers: &HeaderMap, now: SystemTime) -> Self {
        if headers.contains_key(APP_RATE_LIMIT) || headers.contains_key(METHOD_RATE_LIMIT) {
            return Self::MultiWindow {
                app: parse_paired_windows(headers, APP_RATE_LIMIT),
                method: parse_paired_windows(headers, METHOD_RATE_LIMIT),
            };
        }
        match parse_single_window(headers, now) {
            Some(spec) => Self::SingleWindow(spec),
            None => Self::Unknown,
        }
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok()
}

fn parse_pairs(raw: &str) -> Vec<(u32, u64)> {
    raw.split(',')
        .filter_map(|token| {
            let (first, second) = token.trim().split_once(':')?;
            Some((first.trim().parse().ok()?, second.trim().parse().ok()?))
        })
        .collect()
}

/// `"20:1,100:120"` limits joined with their `"5:1,40:120"` companion counts;
/// counts reported in several dimensions for the same length are summed.
fn parse_paired_windows(headers: &HeaderMap, name: &str) -> Vec<WindowSpec> {
    let Some(raw_limits) = header_str(headers, name) else {
        return Vec::new();
    };
    let count_header = format!("{name}-count");
    let counts = header_str(headers, &count_header)
        .map(parse_pairs)
        .unwrap_or_default();

    parse_pairs(raw_limits)
        .into_iter()
        .map(|(max, length_secs)| WindowSpec {
            max,
            length_secs,
            count: counts
                .iter()
                .filter(|(_, length)| *length == length_secs)
                .fold(0_u32, |sum, (count, _)| sum.saturating_add(*count)),
        })
        .collect()
}

fn parse_single_window(headers: &HeaderMap, now: SystemTime) -> Option<WindowSpec> {
    let max: u32 = header_str(headers, RATE_LIMIT_LIMIT)?.trim().parse().ok()?;
    let remaining: u32 = header_str(headers, RATE_LIMIT_REMAINING)?
        .trim()
        .parse()
        .ok()?;
    let reset: u64 = header_str(headers, RATE_LIMIT_RESET)?.trim().parse().ok()?;
    let now_secs = now.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
    Some(WindowSpec {
        max,
        length_secs: reset.saturating_sub(now_secs).max(1),
        count: max.saturating_sub(remaining),
    })
}

/// Drops every path segment containing an ASCII digit so parameterized
/// endpoints collapse into one logical bucket.
pub(crate) fn canonical_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.chars().any(|character| character.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn endpoint_key(hostname: &str, path: &str) -> String {
    format!("{hostname}{}", canonical_path(path))
}

#[derive(Debug)]
pub(crate) enum Admission {
    /// In-flight counts were charged; pair with [`RateLimiterRegistry::release`].
    Ready,
    /// Some window would be overrun; park for this long and re-check.
    RetryAfter(Duration),
}

#[derive(Default)]
struct RegistryState {
    windows: BTreeMap<String, Vec<RateLimitWindow>>,
    active: BTreeMap<String, u32>,
}

impl RegistryState {
    fn ensure_bucket(&mut self, key: &str, now: Instant) {
        let needs_canary = self.windows.get(key).is_none_or(Vec::is_empty);
        if needs_canary {
            self.windows
                .insert(key.to_owned(), vec![RateLimitWindow::fabricated(1, 1, now)]);
        }
        self.active.entry(key.to_owned()).or_insert(0);
    }
}

/// Shared admission state for every bucket a client has talked to.
///
/// An explicit instance (one per client, one per test) rather than process
/// globals; entries are created lazily and live until replaced by fresher
/// server feedback. Nothing is durable.
#[derive(Default)]
pub struct RateLimiterRegistry {
    state: Mutex<RegistryState>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn try_admit(&self, host_key: &str, endpoint_key: &str) -> Admission {
        self.try_admit_at(host_key, endpoint_key, Instant::now())
    }

    /// Reset pass, admission check, and in-flight increment as one critical
    /// section; the lock never spans I/O or sleeps.
    fn try_admit_at(&self, host_key: &str, endpoint_key: &str, now: Instant) -> Admission {
        let mut state = lock_unpoisoned(&self.state);
        state.ensure_bucket(host_key, now);
        state.ensure_bucket(endpoint_key, now);

        let RegistryState { windows, active } = &mut *state;
        let mut blocked_horizon: Option<u64> = None;
        for key in [host_key, endpoint_key] {
            let in_flight = active.get(key).copied().unwrap_or(0);
            let Some(bucket) = windows.get_mut(key) else {
                continue;
            };
            for window in bucket.iter_mut() {
                if window.is_expired(now) {
                    window.reset(now);
                }
                if window.count.saturating_add(in_flight) >= window.max {
                    let horizon = window.horizon_secs();
                    blocked_horizon =
                        Some(blocked_horizon.map_or(horizon, |current| current.max(horizon)));
                }
            }
        }
        if let Some(secs) = blocked_horizon {
            return Admission::RetryAfter(Duration::from_secs(secs));
        }

        for key in [host_key, endpoint_key] {
            if let Some(count) = active.get_mut(key) {
                *count += 1;
            }
        }
        Admission::Ready
    }

    pub(crate) fn release(&self, host_key: &str, endpoint_key: &str) {
        let mut state = lock_unpoisoned(&self.state);
        for key in [host_key, endpoint_key] {
            if let Some(count) = state.active.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Replaces both buckets' window lists from response feedback.
    /// Authoritative data supersedes fabricated or stale data wholesale.
    pub(crate) fn ingest(
        &self,
        host_key: &str,
        endpoint_key: &str,
        feedback: RateLimitFeedback,
        fallback_max: u32,
    ) {
        self.ingest_at(host_key, endpoint_key, feedback, fallback_max, Instant::now());
    }

    fn ingest_at(
        &self,
        host_key: &str,
        endpoint_key: &str,
        feedback: RateLimitFeedback,
        fallback_max: u32,
        now: Instant,
    ) {
        let fallback = || {
            vec![RateLimitWindow::fabricated(
                fallback_max,
                FALLBACK_WINDOW_LENGTH_SECS,
                now,
            )]
        };
        let confirmed = |specs: Vec<WindowSpec>| {
            specs
                .into_iter()
                .map(|spec| RateLimitWindow::confirmed(spec, now))
                .collect::<Vec<_>>()
        };

        let (host_windows, endpoint_windows) = match feedback {
            RateLimitFeedback::MultiWindow { app, method } => (
                if app.is_empty() {
                    fallback()
                } else {
                    confirmed(app)
                },
                if method.is_empty() {
                    fallback()
                } else {
                    confirmed(method)
                },
            ),
            RateLimitFeedback::SingleWindow(spec) => {
                (confirmed(vec![spec]), confirmed(vec![spec]))
            }
            RateLimitFeedback::Unknown => (fallback(), fallback()),
        };

        let mut state = lock_unpoisoned(&self.state);
        state.windows.insert(host_key.to_owned(), host_windows);
        state
            .windows
            .insert(endpoint_key.to_owned(), endpoint_windows);
    }

    /// Records a 429: every window currently at capacity under either bucket
    /// is stamped with the Retry-After hint as its early-reset horizon.
    pub(crate) fn note_throttled(
        &self,
        host_key: &str,
        endpoint_key: &str,
        retry_after: Option<Duration>,
    ) {
        let next_secs = retry_after
            .map(|duration| duration.as_secs())
            .filter(|secs| *secs > 0);

        let mut state = lock_unpoisoned(&self.state);
        let RegistryState { windows, active } = &mut *state;
        for key in [host_key, endpoint_key] {
            let in_flight = active.get(key).copied().unwrap_or(0);
            let Some(bucket) = windows.get_mut(key) else {
                continue;
            };
            if let Some(next) = next_secs {
                for window in bucket.iter_mut() {
                    if window.count.saturating_add(in_flight) >= window.max {
                        window.next_secs = Some(next);
                    }
                }
            }
            warn!(
                bucket = key,
                windows = %format_windows(bucket),
                "http rate limit hit"
            );
        }
    }

    pub fn windows_snapshot(&self, bucket: &str) -> Vec<RateLimitWindow> {
        lock_unpoisoned(&self.state)
            .windows
            .get(bucket)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_count(&self, bucket: &str) -> u32 {
        lock_unpoisoned(&self.state)
            .active
            .get(bucket)
            .copied()
            .unwrap_or(0)
    }
}

fn format_windows(windows: &[RateLimitWindow]) -> String {
    windows
        .iter()
        .map(|window| {
            format!(
                "{}/{} ({},{})",
                window.count,
                window.max,
                window.length_secs,
                window
                    .next_secs
                    .map_or_else(|| "-".to_owned(), |next| next.to_string())
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}
