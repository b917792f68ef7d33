use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::Client;
use serde_json::Value;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::engine::masking::mask_text;
use crate::error::EngineError;
use crate::models::api::HttpMethod;

/// Longest the caller will sleep for backoff or a Retry-After hint.
const MAX_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A fully substituted request, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub data: Value,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues one HTTP request, retrying transient transport failures with
/// exponential backoff and honoring 429 Retry-After hints. Non-2xx
/// responses are returned to the caller, not raised here.
pub async fn call_http(
    client: &Client,
    request: &ResolvedRequest,
    retries: u32,
    retry_delay: Option<Duration>,
    secrets: &[String],
) -> Result<HttpResponse, EngineError> {
    let base_delay = retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);
    let mut attempt: u32 = 0;

    loop {
        let response = send_once(client, request).await;

        match response {
            Ok(resp) if resp.status == 429 => {
                let wait = retry_after(&resp.headers).unwrap_or_else(|| backoff(attempt, base_delay));
                if wait > MAX_WAIT {
                    return Err(EngineError::RateLimitExceeded {
                        wait_secs: wait.as_secs(),
                    });
                }
                if attempt >= retries {
                    return Ok(resp);
                }
                debug!(url = %request.url, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Ok(resp) => return Ok(resp),
            Err(err) => {
                if attempt >= retries {
                    return Err(EngineError::Transport(mask_text(&err, secrets)));
                }
                let wait = backoff(attempt, base_delay);
                warn!(
                    url = %request.url,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "transport error, retrying: {}",
                    mask_text(&err, secrets)
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

async fn send_once(client: &Client, request: &ResolvedRequest) -> Result<HttpResponse, String> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|e| e.to_string())?;

    let mut header_map = HeaderMap::new();
    for (k, v) in &request.headers {
        let value = if k.eq_ignore_ascii_case("authorization") {
            normalize_authorization(v)
        } else {
            v.clone()
        };
        if let (Ok(name), Ok(val)) = (HeaderName::try_from(k.as_str()), HeaderValue::from_str(&value))
        {
            header_map.insert(name, val);
        }
    }

    let query: Vec<(&str, &str)> = request
        .query_params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut builder = client
        .request(method, &request.url)
        .timeout(request.timeout)
        .headers(header_map)
        .query(&query);

    if let Some(body) = &request.body {
        if !body.is_empty() && !matches!(request.method, HttpMethod::GET | HttpMethod::HEAD) {
            builder = match serde_json::from_str::<Value>(body) {
                Ok(json_body) => builder.json(&json_body),
                Err(_) => builder.body(body.clone()),
            };
        }
    }

    let resp = builder.send().await.map_err(|e| e.to_string())?;

    let status = resp.status().as_u16();
    let status_text = resp
        .status()
        .canonical_reason()
        .unwrap_or_default()
        .to_string();
    let mut headers = HashMap::new();
    for (k, v) in resp.headers().iter() {
        if let Ok(s) = v.to_str() {
            headers.insert(k.as_str().to_string(), s.to_string());
        }
    }
    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_default()
        .to_lowercase();

    let text = resp.text().await.map_err(|e| e.to_string())?;
    let data = if content_type.contains("application/json") {
        serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
    } else {
        Value::String(text)
    };

    Ok(HttpResponse {
        status,
        status_text,
        data,
        headers,
    })
}

/// Repairs common hand-written Authorization header mistakes: doubled
/// scheme prefixes and unencoded Basic credentials.
pub fn normalize_authorization(value: &str) -> String {
    let trimmed = value.trim();

    if let Some(token) = strip_scheme(trimmed, "Bearer") {
        return format!("Bearer {}", token);
    }
    if let Some(token) = strip_scheme(trimmed, "Basic") {
        if is_base64(&token) {
            return format!("Basic {}", token);
        }
        return format!("Basic {}", STANDARD.encode(token.as_bytes()));
    }
    trimmed.to_string()
}

/// Strips one or more repetitions of `scheme` and returns the remainder.
fn strip_scheme(value: &str, scheme: &str) -> Option<String> {
    let prefix = format!("{} ", scheme);
    let mut rest = value;
    let mut matched = false;
    loop {
        let lower = rest.to_lowercase();
        if lower.starts_with(&prefix.to_lowercase()) {
            rest = rest[prefix.len()..].trim_start();
            matched = true;
        } else {
            break;
        }
    }
    matched.then(|| rest.to_string())
}

fn is_base64(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
}

fn backoff(attempt: u32, base: Duration) -> Duration {
    let shift = attempt.min(30);
    let delay = base.saturating_mul(1u32 << shift.min(16));
    delay.min(MAX_WAIT)
}

/// Retry-After as either delta-seconds or an HTTP-date.
fn retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER.as_str())?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = OffsetDateTime::parse(raw.trim(), &Rfc2822).ok()?;
    let delta = at - OffsetDateTime::now_utc();
    if delta.is_negative() {
        return Some(Duration::ZERO);
    }
    Some(Duration::from_secs(delta.whole_seconds() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use axum::{routing::get, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn bearer_bearer_is_deduped() {
        assert_eq!(normalize_authorization("Bearer Bearer tok"), "Bearer tok");
        assert_eq!(normalize_authorization("Bearer tok"), "Bearer tok");
    }

    #[test]
    fn basic_basic_is_deduped_and_encoded() {
        let normalized = normalize_authorization("Basic Basic user:pass");
        assert_eq!(
            normalized,
            format!("Basic {}", STANDARD.encode("user:pass"))
        );
    }

    #[test]
    fn basic_with_valid_base64_is_untouched() {
        let encoded = STANDARD.encode("user:pass");
        assert_eq!(
            normalize_authorization(&format!("Basic {encoded}")),
            format!("Basic {encoded}")
        );
    }

    #[test]
    fn non_auth_values_pass_through() {
        assert_eq!(normalize_authorization("token abc"), "token abc");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff(0, base), Duration::from_secs(1));
        assert_eq!(backoff(1, base), Duration::from_secs(2));
        assert_eq!(backoff(3, base), Duration::from_secs(8));
        assert_eq!(backoff(20, base), MAX_WAIT);
    }

    #[test]
    fn retry_after_parses_seconds() {
        let headers = HashMap::from([("retry-after".to_string(), "7".to_string())]);
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_parses_http_date_in_past_as_zero() {
        let headers = HashMap::from([(
            "retry-after".to_string(),
            "Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
        )]);
        assert_eq!(retry_after(&headers), Some(Duration::ZERO));
    }

    fn request_to(url: String) -> ResolvedRequest {
        ResolvedRequest {
            method: HttpMethod::GET,
            url,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn returns_parsed_json_on_success() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/ok",
            get(|| async { axum::Json(serde_json::json!({"hello": "world"})) }),
        );
        let server = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = Client::new();
        let resp = call_http(
            &client,
            &request_to(format!("http://{addr}/ok")),
            0,
            None,
            &[],
        )
        .await
        .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.data, serde_json::json!({"hello": "world"}));
        server.abort();
    }

    #[tokio::test]
    async fn honors_retry_after_on_429() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        let app = Router::new().route(
            "/flaky",
            get(move || {
                let hits = hits_clone.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        (
                            axum::http::StatusCode::TOO_MANY_REQUESTS,
                            [("retry-after", "0")],
                            "slow down",
                        )
                            .into_response()
                    } else {
                        axum::Json(serde_json::json!({"ok": true})).into_response()
                    }
                }
            }),
        );
        let server = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = Client::new();
        let resp = call_http(
            &client,
            &request_to(format!("http://{addr}/flaky")),
            2,
            None,
            &[],
        )
        .await
        .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn excessive_retry_after_fails_fast() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/limited",
            get(|| async {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "120")],
                    "slow down",
                )
            }),
        );
        let server = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = Client::new();
        let err = call_http(
            &client,
            &request_to(format!("http://{addr}/limited")),
            3,
            None,
            &[],
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            EngineError::RateLimitExceeded { wait_secs: 120 }
        ));
        server.abort();
    }

    #[tokio::test]
    async fn transport_errors_are_masked() {
        let client = Client::new();
        let mut request = request_to("http://127.0.0.1:1/unreachable?key=supersecret".to_string());
        request.timeout = Duration::from_millis(200);
        let err = call_http(&client, &request, 0, None, &["supersecret".to_string()])
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("supersecret"));
    }
}
