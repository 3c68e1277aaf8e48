//! Retrying execution of remote operations
//!
//! [`RetryingTransport`] runs any async operation that reports a classified
//! [`TransportError`]. Transient failures are retried with exponential
//! backoff (`base * 2^attempt`), honoring a server-supplied delay when one is
//! present. Terminal failures return immediately.
//!
//! [`HttpClient`] layers HTTP status classification on top:
//!
//! | response                         | classification |
//! |----------------------------------|----------------|
//! | 2xx with decodable body          | success        |
//! | 429                              | transient, `Retry-After` honored |
//! | 408, 5xx                         | transient      |
//! | other 4xx                        | terminal       |
//! | timeout / connection error       | transient      |
//! | body that is not valid JSON      | transient      |

use crate::error::{IngestError, TransportError};
use crate::framework::clock::Clock;
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt bound and backoff base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
        }
    }

    /// Delay after the failed attempt with 0-based index `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Executes operations under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryingTransport {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryingTransport {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out
    pub async fn execute<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(TransportError::Transient {
                    message,
                    retry_after,
                }) => {
                    if attempt + 1 == attempts {
                        last = message;
                        break;
                    }
                    let delay = retry_after.unwrap_or_else(|| self.policy.backoff(attempt));
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient failure, retrying"
                    );
                    last = message;
                    self.clock.sleep(delay).await;
                },
                Err(err) => {
                    debug!(operation = label, error = %err, "Terminal failure, not retrying");
                    return Err(err);
                },
            }
        }

        warn!(operation = label, attempts, error = %last, "Retries exhausted");
        Err(TransportError::Exhausted { attempts, last })
    }
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub bearer_token: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: "AvianBiosurveillance/1.0 (research project)".to_string(),
            bearer_token: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// reqwest client wrapped in a [`RetryingTransport`]
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    transport: RetryingTransport,
    bearer_token: Option<String>,
}

impl HttpClient {
    pub fn new(config: &HttpConfig, clock: Arc<dyn Clock>) -> Result<Self, IngestError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(TransportError::from)?;

        Ok(Self {
            client,
            transport: RetryingTransport::new(config.retry, clock),
            bearer_token: config.bearer_token.clone(),
        })
    }

    pub fn transport(&self) -> &RetryingTransport {
        &self.transport
    }

    /// POST a JSON body and decode a JSON response
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        self.transport
            .execute(url, move || async move {
                let response = self.authorize(self.client.post(url).json(body)).send().await?;
                decode_json(check_status(response)?).await
            })
            .await
    }

    /// GET with query parameters and decode a JSON response
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, TransportError> {
        self.transport
            .execute(url, move || async move {
                let response = self.authorize(self.client.get(url).query(query)).send().await?;
                decode_json(check_status(response)?).await
            })
            .await
    }

    /// GET a response whose status has been checked; the body is left unread
    /// so the caller can stream it.
    pub async fn get_stream(&self, url: &str) -> Result<Response, TransportError> {
        self.transport
            .execute(url, move || async move {
                let response = self.client.get(url).send().await?;
                check_status(response)
            })
            .await
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

/// Classify a response status; `Ok` passes the response through
pub fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(classify_status(status, response.headers(), response.url().as_str()))
}

pub fn classify_status(status: StatusCode, headers: &HeaderMap, url: &str) -> TransportError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        TransportError::rate_limited(format!("rate limited ({status}) by {url}"), retry_after(headers))
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        TransportError::transient(format!("server error {status} from {url}"))
    } else {
        TransportError::terminal(format!("HTTP {status} from {url}"))
    }
}

/// `Retry-After` in delta-seconds form
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn decode_json(response: Response) -> Result<Value, TransportError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TransportError::transient(format!("malformed JSON response: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::clock::ManualClock;
    use chrono::Utc;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transport(max_attempts: u32) -> (RetryingTransport, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let policy = RetryPolicy::new(max_attempts, Duration::from_secs(2));
        (RetryingTransport::new(policy, clock.clone()), clock)
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let (transport, clock) = transport(5);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = transport
            .execute("ping", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::transient("503"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn test_terminal_is_not_retried() {
        let (transport, clock) = transport(5);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = transport
            .execute("ping", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::terminal("HTTP 401"))
            })
            .await;

        assert_eq!(result.unwrap_err(), TransportError::terminal("HTTP 401"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_overrides_backoff() {
        let (transport, clock) = transport(2);

        let result: Result<(), _> = transport
            .execute("ping", || async {
                Err(TransportError::rate_limited("429", Some(Duration::from_secs(7))))
            })
            .await;

        assert_eq!(
            result.unwrap_err(),
            TransportError::Exhausted {
                attempts: 2,
                last: "429".into()
            }
        );
        // no sleep after the final attempt
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(7)]);
    }

    #[test]
    fn test_classify_status() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));

        match classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "u") {
            TransportError::Transient { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(12)))
            },
            other => panic!("expected transient, got {other:?}"),
        }
        assert!(classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "u").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, &HeaderMap::new(), "u").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, &HeaderMap::new(), "u").is_transient());
    }

    #[test]
    fn test_retry_after_http_date_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }
}
