//! Adaptive rate limiter for inference endpoints.
//!
//! Epistemic foundation:
//! - K_i: OpenAI-compatible endpoints may return `x-ratelimit-*` headers
//! - K_i: 429 errors require exponential backoff
//! - I^B: Exact rate limits unknowable until headers received

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on 429 backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Throttle state for a single model.
#[derive(Debug, Default)]
pub struct ModelThrottle {
    /// Remaining requests in current window
    pub remaining_requests: Option<u32>,
    /// Remaining tokens in current window
    pub remaining_tokens: Option<u32>,
    /// When the request window resets
    pub reset_requests_at: Option<Instant>,
    /// When the token window resets
    pub reset_tokens_at: Option<Instant>,
    /// Consecutive 429 responses
    pub consecutive_429s: u32,
    /// Backoff until this time
    pub backoff_until: Option<Instant>,
}

impl ModelThrottle {
    /// Time to wait before the next request, relative to `now`.
    pub fn wait_time_at(&self, now: Instant) -> Duration {
        let until = |deadline: Option<Instant>| {
            deadline
                .filter(|&t| t > now)
                .map(|t| t - now)
                .unwrap_or(Duration::ZERO)
        };

        let mut wait = until(self.backoff_until);
        if self.remaining_requests == Some(0) {
            wait = wait.max(until(self.reset_requests_at));
        }
        if self.remaining_tokens == Some(0) {
            wait = wait.max(until(self.reset_tokens_at));
        }
        wait
    }

    /// Record a 429 and extend the backoff window to `base * 2^n`.
    pub fn record_429(&mut self, now: Instant, base: Duration) {
        self.consecutive_429s += 1;
        let backoff = base
            .saturating_mul(2u32.saturating_pow(self.consecutive_429s))
            .min(MAX_BACKOFF);
        self.backoff_until = Some(now + backoff);
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_ms = backoff.as_millis() as u64,
            "Rate limited (429), backing off"
        );
    }

    /// Clear backoff after a successful request.
    pub fn record_success(&mut self) {
        self.consecutive_429s = 0;
        self.backoff_until = None;
    }

    /// Update windows from response headers.
    pub fn update_from_headers(&mut self, headers: &HeaderMap, now: Instant) {
        let header = |key: &str| headers.get(key).and_then(|v| v.to_str().ok());

        if let Some(n) = header("x-ratelimit-remaining-requests").and_then(|s| s.parse().ok()) {
            self.remaining_requests = Some(n);
        }
        if let Some(n) = header("x-ratelimit-remaining-tokens").and_then(|s| s.parse().ok()) {
            self.remaining_tokens = Some(n);
        }
        if let Some(d) = header("x-ratelimit-reset-requests").and_then(parse_reset) {
            self.reset_requests_at = Some(now + d);
        }
        if let Some(d) = header("x-ratelimit-reset-tokens").and_then(parse_reset) {
            self.reset_tokens_at = Some(now + d);
        }
    }
}

/// Parse a reset header value.
///
/// Accepts plain seconds ("1.5") and compound durations ("150ms", "6m0s", "1h2m").
pub fn parse_reset(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let mut total = 0f64;
    let mut number = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let n: f64 = number.parse().ok()?;
        number.clear();
        total += match c {
            'h' => n * 3600.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                n / 1000.0
            }
            'm' => n * 60.0,
            's' => n,
            _ => return None,
        };
    }
    if !number.is_empty() {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}

/// Adaptive per-model rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    states: DashMap<String, ModelThrottle>,
    base_backoff: Duration,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            states: DashMap::new(),
            base_backoff: Duration::from_secs(1),
            total_requests: AtomicU64::new(0),
            total_429s: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backoff after the first 429; it doubles on each consecutive one.
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Wait if necessary before making a request to the given model.
    ///
    /// Returns the duration waited.
    pub async fn wait_if_needed(&self, model: &str) -> Duration {
        let wait_time = self
            .states
            .get(model)
            .map(|s| s.wait_time_at(Instant::now()))
            .unwrap_or(Duration::ZERO);

        if wait_time > Duration::ZERO {
            debug!(
                model = model,
                wait_ms = wait_time.as_millis(),
                "Waiting for rate limit"
            );
            self.total_wait_ms
                .fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait_time).await;
        }

        wait_time
    }

    /// Record a request result.
    pub fn record_request(&self, model: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let mut state = self.states.entry(model.to_string()).or_default();
        state.update_from_headers(headers, now);

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            state.record_429(now, self.base_backoff);
        } else if status < 400 {
            state.record_success();
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_429s = self.total_429s.load(Ordering::Relaxed);

        RateLimiterStats {
            total_requests,
            total_429s,
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            models_tracked: self.states.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
    pub models_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_reset_formats() {
        assert_eq!(parse_reset("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_reset("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_reset("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_reset("6m0s"), Some(Duration::from_secs(360)));
        assert_eq!(parse_reset("1h2m"), Some(Duration::from_secs(3720)));
        assert_eq!(parse_reset("soon"), None);
        assert_eq!(parse_reset("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_reset("5x"), None);
        assert_eq!(parse_reset("-1"), None);
        assert_eq!(parse_reset("inf"), None);
        assert_eq!(parse_reset("NaN"), None);
    }

    #[test]
    fn test_exhausted_window_blocks_until_reset() {
        let now = Instant::now();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-remaining-requests",
            HeaderValue::from_static("0"),
        );
        headers.insert("x-ratelimit-reset-requests", HeaderValue::from_static("3s"));

        let mut state = ModelThrottle::default();
        state.update_from_headers(&headers, now);
        assert_eq!(state.wait_time_at(now), Duration::from_secs(3));
        assert_eq!(
            state.wait_time_at(now + Duration::from_secs(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let now = Instant::now();
        let mut state = ModelThrottle::default();
        state.record_429(now, Duration::from_secs(1));
        assert_eq!(state.wait_time_at(now), Duration::from_secs(2));
        state.record_429(now, Duration::from_secs(1));
        assert_eq!(state.wait_time_at(now), Duration::from_secs(4));
        for _ in 0..40 {
            state.record_429(now, Duration::from_secs(1));
        }
        assert_eq!(state.wait_time_at(now), MAX_BACKOFF);
        state.record_success();
        assert_eq!(state.wait_time_at(now), Duration::ZERO);
    }

    #[test]
    fn test_limiter_counts_requests() {
        let limiter = RateLimiter::new();
        limiter.record_request("m", 200, &HeaderMap::new());
        limiter.record_request("m", 429, &HeaderMap::new());
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_429s, 1);
        assert_eq!(stats.models_tracked, 1);
    }
}
