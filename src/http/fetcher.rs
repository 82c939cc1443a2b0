// =============================================================================
// HTTP Fetcher — rate-limited, circuit-broken provider client
// =============================================================================
//
// The API key is appended to the query string at transmit time only; it is
// never logged. `sanitize_url` replaces it with `***` in any URL that reaches
// a log line.
// =============================================================================

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::FetchErrorKind;
use crate::rate_limiter::RateLimiter;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 1_500;
const BACKOFF_CAP_MS: u64 = 30_000;

/// HTTP client wrapping `reqwest`, gated by a shared [`RateLimiter`] and
/// [`CircuitBreaker`]. One instance is shared process-wide.
pub struct HttpFetcher {
    client: reqwest::Client,
    api_key: Option<String>,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(api_key: Option<String>, rate_limiter: RateLimiter, circuit_breaker: CircuitBreaker) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            api_key,
            rate_limiter,
            circuit_breaker,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Fetch and decode one JSON document, acquiring a rate slot and checking
    /// the circuit breaker first. Retries on rate-limit signals up to
    /// [`MAX_RATE_LIMIT_RETRIES`] times with exponential backoff.
    #[instrument(skip(self, cancel), fields(label = %label))]
    pub async fn fetch_json(
        &self,
        url_without_key: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchErrorKind> {
        if self.api_key.is_none() {
            return Err(FetchErrorKind::Paused);
        }

        let mut attempt = 0u32;
        loop {
            self.circuit_breaker.admit()?;
            self.rate_limiter.acquire(cancel).await?;

            let url = self.build_url(url_without_key);
            let result = self.send_once(&url, label, cancel).await;

            match result {
                Ok(body) => {
                    self.circuit_breaker.record_success();
                    return Ok(body);
                }
                Err(kind) => {
                    self.circuit_breaker.record_failure(kind.is_infrastructure());

                    let retryable = matches!(kind, FetchErrorKind::RateLimited);
                    if !retryable || attempt >= MAX_RATE_LIMIT_RETRIES {
                        return Err(kind);
                    }

                    let backoff_ms = (BACKOFF_BASE_MS * 2u64.pow(attempt)).min(BACKOFF_CAP_MS);
                    attempt += 1;
                    warn!(
                        label,
                        attempt,
                        backoff_ms,
                        "rate limited — backing off before retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchErrorKind::Aborted),
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                }
            }
        }
    }

    /// Try URL candidates in order, returning the first non-empty array.
    /// Rate-limit/paused errors short-circuit immediately (no point trying
    /// the next candidate against the same crippled provider). Returns an
    /// empty vec only if every candidate parsed successfully but returned no
    /// rows.
    pub async fn fetch_array_with_fallback(
        &self,
        label: &str,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, FetchErrorKind> {
        let mut last_err = None;
        for url in urls {
            match self.fetch_json(url, label, cancel).await {
                Ok(body) => {
                    let rows = extract_array(&body);
                    if !rows.is_empty() {
                        return Ok(rows);
                    }
                    last_err = None;
                }
                Err(kind @ (FetchErrorKind::RateLimited | FetchErrorKind::Paused)) => {
                    return Err(kind);
                }
                Err(kind) => {
                    last_err = Some(kind);
                }
            }
        }
        match last_err {
            Some(kind) => Err(kind),
            None => Ok(Vec::new()),
        }
    }

    fn build_url(&self, url_without_key: &str) -> String {
        let api_key = self.api_key.as_deref().unwrap_or("");
        let separator = if url_without_key.contains('?') { '&' } else { '?' };
        format!("{url_without_key}{separator}apiKey={}", percent_encode(api_key))
    }

    async fn send_once(
        &self,
        url: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchErrorKind> {
        debug!(label, url = %sanitize_url(url), "issuing request");

        let send_fut = self.client.get(url).send();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchErrorKind::Aborted),
            result = tokio::time::timeout(self.timeout, send_fut) => match result {
                Ok(inner) => inner.map_err(|e| FetchErrorKind::Network(e.to_string()))?,
                Err(_) => return Err(FetchErrorKind::Timeout { label: label.to_string() }),
            },
        };

        let status = resp.status();

        if status.as_u16() == 429 {
            return Err(FetchErrorKind::RateLimited);
        }
        if status.as_u16() == 403 {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            if looks_subscription_restricted(&body) {
                return Err(FetchErrorKind::SubscriptionRestricted);
            }
            return Err(FetchErrorKind::BadStatus(403));
        }
        if !status.is_success() {
            return Err(FetchErrorKind::BadStatus(status.as_u16()));
        }

        let body_fut = resp.json::<Value>();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchErrorKind::Aborted),
            result = tokio::time::timeout(self.timeout, body_fut) => match result {
                Ok(inner) => inner.map_err(|e| FetchErrorKind::BadPayload(e.to_string()))?,
                Err(_) => return Err(FetchErrorKind::Timeout { label: label.to_string() }),
            },
        };

        if looks_rate_limited(&body) {
            return Err(FetchErrorKind::RateLimited);
        }
        if looks_like_error_body(&body) {
            return Err(FetchErrorKind::BadPayload(body.to_string()));
        }

        Ok(body)
    }
}

/// Tolerant array extraction: accepts `{results: […]}`, `{historical: […]}`,
/// or a bare top-level array.
fn extract_array(body: &Value) -> Vec<Value> {
    if let Some(arr) = body.get("results").and_then(|v| v.as_array()) {
        return arr.clone();
    }
    if let Some(arr) = body.get("historical").and_then(|v| v.as_array()) {
        return arr.clone();
    }
    if let Some(arr) = body.as_array() {
        return arr.clone();
    }
    Vec::new()
}

fn looks_like_error_body(body: &Value) -> bool {
    if body.get("status").and_then(|v| v.as_str()) == Some("ERROR") {
        return true;
    }
    body.get("error").is_some() || body.get("message").and_then(|v| v.as_str()).is_some()
}

fn looks_rate_limited(body: &Value) -> bool {
    let note = body.get("Note").or_else(|| body.get("message")).and_then(|v| v.as_str());
    match note {
        Some(text) => {
            let lower = text.to_lowercase();
            lower.contains("rate limit") || lower.contains("api call frequency")
        }
        None => false,
    }
}

fn looks_subscription_restricted(body: &Value) -> bool {
    let text = body
        .get("error")
        .or_else(|| body.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    text.contains("subscription") || text.contains("not entitled") || text.contains("upgrade")
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Replace the `apiKey=...` query value with `***` so secrets never reach a
/// log line.
pub fn sanitize_url(url: &str) -> String {
    match url.find("apiKey=") {
        Some(idx) => {
            let (head, tail) = url.split_at(idx);
            let value_end = tail.find('&').map(|i| i + idx).unwrap_or(url.len());
            format!("{head}apiKey=***{}", &url[value_end..])
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_url_masks_the_api_key() {
        let url = "https://api.example.com/v2/aggs?symbol=AAPL&apiKey=SECRET123&sort=asc";
        let sanitized = sanitize_url(url);
        assert!(!sanitized.contains("SECRET123"));
        assert!(sanitized.contains("apiKey=***"));
        assert!(sanitized.contains("sort=asc"));
    }

    #[test]
    fn sanitize_url_handles_trailing_key() {
        let url = "https://api.example.com/v2/aggs?symbol=AAPL&apiKey=SECRET123";
        let sanitized = sanitize_url(url);
        assert_eq!(sanitized, "https://api.example.com/v2/aggs?symbol=AAPL&apiKey=***");
    }

    #[test]
    fn sanitize_url_is_a_no_op_without_a_key() {
        let url = "https://api.example.com/v2/aggs?symbol=AAPL";
        assert_eq!(sanitize_url(url), url);
    }

    #[test]
    fn extract_array_prefers_results_field() {
        let body = serde_json::json!({"results": [{"t": 1}], "historical": [{"t": 2}]});
        let rows = extract_array(&body);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["t"], 1);
    }

    #[test]
    fn extract_array_falls_back_to_historical_field() {
        let body = serde_json::json!({"historical": [{"t": 2}, {"t": 3}]});
        assert_eq!(extract_array(&body).len(), 2);
    }

    #[test]
    fn extract_array_accepts_bare_top_level_array() {
        let body = serde_json::json!([{"t": 1}, {"t": 2}, {"t": 3}]);
        assert_eq!(extract_array(&body).len(), 3);
    }

    #[test]
    fn looks_rate_limited_detects_alpha_vantage_style_note() {
        let body = serde_json::json!({"Note": "Thank you for using our API. Please consider an API call frequency upgrade."});
        assert!(looks_rate_limited(&body));
    }

    #[test]
    fn looks_like_error_body_detects_status_error() {
        let body = serde_json::json!({"status": "ERROR", "message": "bad symbol"});
        assert!(looks_like_error_body(&body));
    }

    #[test]
    fn percent_encode_escapes_reserved_characters() {
        assert_eq!(percent_encode("a b"), "a%20b");
        assert_eq!(percent_encode("AAPL"), "AAPL");
    }
}
