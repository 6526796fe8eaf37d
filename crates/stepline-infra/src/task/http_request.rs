//! `http_request` task handler.
//!
//! Config:
//!
//! ```json
//! {
//!   "url": "https://api.example.com/orders",
//!   "method": "POST",
//!   "headers": {"authorization": "Bearer ..."},
//!   "body": {"order_id": 42},
//!   "timeout_secs": 10
//! }
//! ```
//!
//! Only `url` is required. A JSON object or array body is sent as JSON, a
//! string body as text. The result is
//! `{"status_code": 200, "body": ..., "headers": {...}}`, with the body
//! decoded as JSON when it parses and kept as text otherwise.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use stepline_core::execution::step_executor::TaskHandler;
use stepline_types::config::HttpConfig;
use stepline_types::execution::StepExecutionError;

#[derive(Debug, Deserialize)]
struct HttpRequestConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Performs one HTTP call per step invocation.
#[derive(Clone)]
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }

    fn build_request(
        &self,
        config: &HttpRequestConfig,
    ) -> Result<reqwest::RequestBuilder, StepExecutionError> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                StepExecutionError::configuration(format!("invalid method '{}'", config.method))
            })?;
        let url = reqwest::Url::parse(&config.url).map_err(|e| {
            StepExecutionError::configuration(format!("invalid url '{}': {e}", config.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StepExecutionError::configuration(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }

        let mut request = self.client.request(method, url);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match &config.body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(body) => request.json(body),
        };
        if let Some(secs) = config.timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }
        Ok(request)
    }
}

impl TaskHandler for HttpRequestHandler {
    async fn execute(&self, config: &Value) -> Result<Value, StepExecutionError> {
        let config: HttpRequestConfig = serde_json::from_value(config.clone())
            .map_err(|e| StepExecutionError::configuration(format!("invalid http_request config: {e}")))?;

        let request = self.build_request(&config)?;
        tracing::debug!(method = %config.method, url = %config.url, "sending http request");

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = response.text().await.map_err(classify_transport_error)?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if let Some(err) = classify_status(status, &body) {
            return Err(err);
        }

        Ok(json!({
            "status_code": status.as_u16(),
            "body": body,
            "headers": headers,
        }))
    }
}

fn classify_transport_error(err: reqwest::Error) -> StepExecutionError {
    if err.is_timeout() {
        StepExecutionError::timeout(format!("http request timed out: {err}"))
    } else if err.is_builder() {
        StepExecutionError::configuration(format!("invalid http request: {err}"))
    } else if err.is_decode() {
        StepExecutionError::invalid_response(format!("unreadable response body: {err}"))
    } else {
        StepExecutionError::unavailable(format!("http request failed: {err}"))
    }
}

/// `None` for 2xx; otherwise the failure the status maps to.
fn classify_status(status: StatusCode, body: &Value) -> Option<StepExecutionError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("{status} {}", snippet(body));
    let err = if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        StepExecutionError::unavailable(detail)
    } else {
        StepExecutionError::invalid_response(detail)
    };
    Some(err)
}

fn snippet(body: &Value) -> String {
    let text = match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Json;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use stepline_types::execution::FailureKind;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn handler() -> HttpRequestHandler {
        HttpRequestHandler::new(&HttpConfig::default()).unwrap()
    }

    fn test_app() -> Router {
        Router::new()
            .route("/ok", get(|| async { Json(json!({"n": 1})) }))
            .route("/text", get(|| async { "plain" }))
            .route(
                "/echo",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    let token = headers
                        .get("x-token")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({"received": body, "token": token}))
                }),
            )
            .route(
                "/down",
                get(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "maintenance") }),
            )
            .route(
                "/busy",
                get(|| async { (AxumStatus::TOO_MANY_REQUESTS, "slow down") }),
            )
            .route(
                "/missing",
                get(|| async { (AxumStatus::NOT_FOUND, "no such thing") }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
    }

    #[tokio::test]
    async fn test_get_returns_status_and_json_body() {
        let base = serve(test_app()).await;
        let result = handler()
            .execute(&json!({"url": format!("{base}/ok")}))
            .await
            .unwrap();
        assert_eq!(result["status_code"], 200);
        assert_eq!(result["body"], json!({"n": 1}));
        assert!(result["headers"]["content-type"]
            .as_str()
            .unwrap()
            .contains("application/json"));
    }

    #[tokio::test]
    async fn test_non_json_body_is_kept_as_text() {
        let base = serve(test_app()).await;
        let result = handler()
            .execute(&json!({"url": format!("{base}/text")}))
            .await
            .unwrap();
        assert_eq!(result["body"], "plain");
    }

    #[tokio::test]
    async fn test_post_sends_json_body_and_headers() {
        let base = serve(test_app()).await;
        let result = handler()
            .execute(&json!({
                "url": format!("{base}/echo"),
                "method": "post",
                "headers": {"x-token": "abc"},
                "body": {"order": 7}
            }))
            .await
            .unwrap();
        assert_eq!(result["body"]["received"], json!({"order": 7}));
        assert_eq!(result["body"]["token"], "abc");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let base = serve(test_app()).await;
        let h = handler();

        let down = h
            .execute(&json!({"url": format!("{base}/down")}))
            .await
            .unwrap_err();
        assert_eq!(down.kind, FailureKind::Unavailable);
        assert!(down.detail.contains("maintenance"));

        let busy = h
            .execute(&json!({"url": format!("{base}/busy")}))
            .await
            .unwrap_err();
        assert_eq!(busy.kind, FailureKind::Unavailable);

        let missing = h
            .execute(&json!({"url": format!("{base}/missing")}))
            .await
            .unwrap_err();
        assert_eq!(missing.kind, FailureKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_request_timeout_is_timeout_kind() {
        let base = serve(test_app()).await;
        let err = handler()
            .execute(&json!({"url": format!("{base}/slow"), "timeout_secs": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = handler()
            .execute(&json!({"url": format!("http://{addr}/")}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Unavailable);
    }

    #[tokio::test]
    async fn test_bad_config_is_configuration_error() {
        let h = handler();
        for config in [
            json!({}),
            json!({"url": "not a url"}),
            json!({"url": "ftp://example.com/file"}),
            json!({"url": "http://example.com", "method": "NOT A METHOD"}),
        ] {
            let err = h.execute(&config).await.unwrap_err();
            assert_eq!(err.kind, FailureKind::ConfigurationError, "{config}");
        }
    }
}
