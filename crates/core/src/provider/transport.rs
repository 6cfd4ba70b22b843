use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::TaskError;
use crate::provider::ProviderSettings;

const MAX_BACKOFF_SECS: f64 = 60.0;

/// Per-call retry for transport failures. HTTP error statuses are never
/// retried at this layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay before the attempt following `attempt` (1-based):
    /// `backoff_factor * 2^(attempt - 1)` seconds, capped at one minute.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.backoff_factor * 2f64.powi(exponent);
        if !secs.is_finite() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs.min(MAX_BACKOFF_SECS))
    }
}

/// Validate a provider base URL and strip its trailing slash.
pub fn normalize_base_url(raw: &str, allow_insecure_http: bool) -> Result<Url, TaskError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(TaskError::configuration("provider base_url is not configured"));
    }

    let parsed = Url::parse(value)
        .map_err(|err| TaskError::configuration(format!("invalid provider base_url: {err}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_insecure_http => {}
        scheme => {
            return Err(TaskError::configuration(format!(
                "provider base_url must use HTTPS, got '{scheme}'"
            )))
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(TaskError::configuration(
            "provider base_url must include a host, e.g. https://api.example.com",
        ));
    }

    let trimmed = value.trim_end_matches('/');
    Url::parse(trimmed)
        .map_err(|err| TaskError::configuration(format!("invalid provider base_url: {err}")))
}

/// Bearer-authenticated JSON client shared by the provider variants.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: Url,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpTransport {
    /// Build a transport from process-wide settings. `api_key_override`
    /// replaces the configured key for this client only.
    pub fn new(settings: &ProviderSettings, api_key_override: Option<&str>) -> Result<Self, TaskError> {
        let base_url = normalize_base_url(&settings.base_url, settings.allow_insecure_http)?;

        let api_key = api_key_override
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| settings.api_key.trim());
        if api_key.is_empty() {
            return Err(TaskError::configuration("provider API key is not configured"));
        }

        let mut auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| TaskError::configuration("invalid API key characters"))?;
        auth_value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| {
                TaskError::configuration(format!("failed to build HTTP client: {err}"))
            })?;

        Ok(Self {
            base_url,
            client,
            retry: settings.retry,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Append `segments` to the base URL. Each segment is percent-encoded, so
    /// remote task ids stay a single path segment.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, TaskError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TaskError::configuration("provider base_url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn get_json(&self, segments: &[&str]) -> Result<Value, TaskError> {
        let url = self.endpoint(segments)?;
        self.request_json(Method::GET, url, None).await
    }

    pub async fn post_json(&self, segments: &[&str], body: &Value) -> Result<Value, TaskError> {
        let url = self.endpoint(segments)?;
        self.request_json(Method::POST, url, Some(body)).await
    }

    async fn request_json(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, TaskError> {
        let context = format!("{method} {}", url.path());
        let max_attempts = self.retry.max_attempts();

        let mut attempt = 1;
        loop {
            match self.send_once(&method, &url, body, &context).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    debug!(
                        request = %context,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "provider request failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(TaskError::Upstream {
                    status,
                    message,
                    transient: true,
                }) if max_attempts > 1 => {
                    return Err(TaskError::Upstream {
                        status,
                        message: format!("{message} (after {max_attempts} attempts)"),
                        transient: true,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&Value>,
        context: &str,
    ) -> Result<Value, TaskError> {
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| TaskError::transport(context, &err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TaskError::http_status(context, status.as_u16(), &text));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| TaskError::transport(context, &err))?;

        serde_json::from_slice(&bytes)
            .map_err(|err| TaskError::upstream(format!("{context} returned invalid JSON: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap as AxumHeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::provider::testing::{local_settings as settings, spawn_stub};

    #[test]
    fn normalize_rejects_empty_and_plain_http() {
        assert!(matches!(
            normalize_base_url("  ", false),
            Err(TaskError::Configuration(_))
        ));

        let err = normalize_base_url("http://api.example.com", false).unwrap_err();
        assert!(err.to_string().contains("must use HTTPS"), "got: {err}");

        assert!(normalize_base_url("http://api.example.com", true).is_ok());
        assert!(normalize_base_url("ftp://api.example.com", true).is_err());
    }

    #[test]
    fn normalize_strips_trailing_slash() {
        let url = normalize_base_url("https://api.example.com/proxy/", false).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/proxy");
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let mut cfg = settings("https://api.example.com");
        cfg.api_key = String::new();
        let err = HttpTransport::new(&cfg, None).unwrap_err();
        assert_eq!(
            err,
            TaskError::configuration("provider API key is not configured")
        );

        assert!(HttpTransport::new(&cfg, Some("sk-override")).is_ok());
    }

    #[test]
    fn endpoint_appends_segments_and_encodes_ids() {
        let transport = HttpTransport::new(&settings("https://api.example.com/proxy/"), None).unwrap();

        let url = transport
            .endpoint(&["v2", "videos", "generations", "a/b c"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/proxy/v2/videos/generations/a%2Fb%20c"
        );

        let root = HttpTransport::new(&settings("https://api.example.com"), None).unwrap();
        let url = root.endpoint(&["v1", "video", "veo", "tasks", "42"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/video/veo/tasks/42");
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_factor: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));

        let none = RetryPolicy {
            max_retries: 0,
            backoff_factor: 0.0,
        };
        assert_eq!(none.max_attempts(), 1);
        assert_eq!(none.backoff(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn post_json_sends_bearer_token_and_body() {
        let router = Router::new().route(
            "/v1/echo",
            post(|headers: AxumHeaderMap, Json(body): Json<Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({ "auth": auth, "body": body }))
            }),
        );
        let base = spawn_stub(router).await;
        let transport = HttpTransport::new(&settings(&base), Some("sk-user")).unwrap();

        let response = transport
            .post_json(&["v1", "echo"], &json!({"prompt": "a cat"}))
            .await
            .unwrap();

        assert_eq!(response["auth"], "Bearer sk-user");
        assert_eq!(response["body"]["prompt"], "a cat");
    }

    #[tokio::test]
    async fn get_json_passes_encoded_id_as_one_segment() {
        let router = Router::new().route(
            "/tasks/{id}",
            get(|Path(id): Path<String>| async move { Json(json!({ "id": id })) }),
        );
        let base = spawn_stub(router).await;
        let transport = HttpTransport::new(&settings(&base), None).unwrap();

        let response = transport.get_json(&["tasks", "abc/def"]).await.unwrap();
        assert_eq!(response["id"], "abc/def");
    }

    #[tokio::test]
    async fn http_error_status_is_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/tasks/{id}",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::SERVICE_UNAVAILABLE, "busy")
                }),
            )
            .with_state(Arc::clone(&hits));
        let base = spawn_stub(router).await;
        let transport = HttpTransport::new(&settings(&base), None).unwrap();

        let err = transport.get_json(&["tasks", "1"]).await.unwrap_err();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            TaskError::Upstream {
                status: Some(503),
                transient: false,
                ..
            }
        ));
        assert!(err.to_string().contains("HTTP 503: busy"), "got: {err}");
    }

    #[tokio::test]
    async fn request_timeout_is_retried_up_to_max_attempts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/slow",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Json(json!({}))
                }),
            )
            .with_state(Arc::clone(&hits));
        let base = spawn_stub(router).await;

        let mut cfg = settings(&base);
        cfg.request_timeout = Duration::from_millis(100);
        let transport = HttpTransport::new(&cfg, None).unwrap();

        let err = transport.get_json(&["slow"]).await.unwrap_err();

        assert!(err.is_transient(), "got: {err:?}");
        assert!(err.to_string().contains("after 3 attempts"), "got: {err}");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(&settings(&format!("http://{addr}")), None).unwrap();
        let err = transport.get_json(&["anything"]).await.unwrap_err();
        assert!(err.is_transient(), "got: {err:?}");
    }

    #[tokio::test]
    async fn non_json_success_body_is_an_upstream_error() {
        let router = Router::new().route("/plain", get(|| async { "not json" }));
        let base = spawn_stub(router).await;
        let transport = HttpTransport::new(&settings(&base), None).unwrap();

        let err = transport.get_json(&["plain"]).await.unwrap_err();
        assert!(err.to_string().contains("invalid JSON"), "got: {err}");
        assert!(!err.is_transient());
    }
}
