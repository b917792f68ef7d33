use std::collections::{HashMap, HashSet};
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{ServerDefaults, MAX_PAGINATION_ITERATIONS_WITHOUT_STOP};
use crate::engine::expression::evaluate_predicate;
use crate::engine::http::{call_http, HttpResponse, ResolvedRequest};
use crate::engine::masking::{mask_json, mask_text};
use crate::engine::parsing::{body_error_message, is_html_response, parse_body};
use crate::engine::templating::{filter_unresolved, merge_scope, substitute, VariableScope};
use crate::error::EngineError;
use crate::models::api::{ApiConfig, PaginationType, RequestOptions};

/// Aggregated result of driving an endpoint to exhaustion.
#[derive(Debug, Clone)]
pub struct PaginationOutcome {
    pub data: Value,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// Iterates a paginated endpoint: substitutes per-page variables, issues
/// requests, deduplicates repeated pages, and accumulates extracted data.
///
/// Endpoints without pagination (or with DISABLED) take exactly one trip
/// through the same path.
pub async fn fetch_all(
    client: &Client,
    config: &ApiConfig,
    scope: &VariableScope,
    options: &RequestOptions,
    defaults: &ServerDefaults,
    secrets: &[String],
) -> Result<PaginationOutcome, EngineError> {
    let pagination_type = config
        .pagination
        .as_ref()
        .map(|p| p.pagination_type)
        .unwrap_or(PaginationType::Disabled);
    let stop_condition = config
        .pagination
        .as_ref()
        .and_then(|p| p.stop_condition.clone());
    let cursor_path = config.pagination.as_ref().and_then(|p| p.cursor_path.clone());
    let page_size = config
        .pagination
        .as_ref()
        .map(|p| p.page_size_or_default())
        .unwrap_or_else(|| "50".to_string());
    let page_size_count = page_size.parse::<i64>().unwrap_or(50);

    let max_iterations = if stop_condition.is_some() {
        defaults.max_pagination_requests
    } else {
        MAX_PAGINATION_ITERATIONS_WITHOUT_STOP
    };

    let timeout = options.timeout.unwrap_or(defaults.http_timeout);
    let retries = options.retries.unwrap_or(defaults.max_call_retries);

    let mut page: i64 = 1;
    let mut offset: i64 = 0;
    let mut cursor = Value::Null;
    let mut has_more = true;
    let mut loop_counter: usize = 0;
    let mut seen_hashes: HashSet<u64> = HashSet::new();
    let mut all_results: Vec<Value> = Vec::new();
    let mut pushed_single_object = false;
    let mut first_hash: Option<u64> = None;
    let mut previous_hash: Option<u64> = None;
    let mut has_valid_data = false;
    let mut last_status: u16 = 0;
    let mut last_headers: HashMap<String, String> = HashMap::new();

    while has_more && loop_counter < max_iterations {
        let page_vars = VariableScope::from([
            ("page".to_string(), json!(page)),
            ("offset".to_string(), json!(offset)),
            ("cursor".to_string(), cursor.clone()),
            ("limit".to_string(), json!(page_size)),
            ("pageSize".to_string(), json!(page_size)),
        ]);
        let call_scope = merge_scope(&[scope, &page_vars]);

        let request = build_request(config, &call_scope, timeout);
        let response = call_http(client, &request, retries, options.retry_delay, secrets).await?;
        last_status = response.status;
        last_headers = response.headers.clone();

        let body = check_and_parse(config, &response, secrets)?;
        let extracted = extract_data_path(&body, config.data_path.as_deref());

        debug!(
            endpoint = %request.url,
            iteration = loop_counter,
            status = response.status,
            "fetched page"
        );

        if let Some(stop_expr) = &stop_condition {
            let hash = crate::utils::hash::stable_hash(&extracted);
            let empty = is_empty_value(&extracted);

            if loop_counter == 0 {
                first_hash = Some(hash);
                has_valid_data = !empty;
            } else if loop_counter == 1 {
                if first_hash == Some(hash) && !empty {
                    return Err(EngineError::PaginationConfig(format!(
                        "the first two pages of {} were identical; the request is not \
                         applying the pagination variables",
                        config.id
                    )));
                }
            } else if previous_hash == Some(hash) {
                break;
            }
            previous_hash = Some(hash);

            let page_info = json!({
                "page": page,
                "offset": offset,
                "cursor": cursor,
                "totalFetched": all_results.len(),
            });
            let should_stop = evaluate_predicate(
                stop_expr,
                HashMap::from([
                    ("response".to_string(), extracted.clone()),
                    ("pageInfo".to_string(), page_info),
                ]),
                defaults.expression_timeout,
            )
            .await?;

            accumulate(&mut all_results, &extracted, &mut pushed_single_object);

            if loop_counter == 1 && !should_stop && !has_valid_data && empty {
                return Err(EngineError::StopCondition(format!(
                    "stop condition `{stop_expr}` did not fire although the first two \
                     responses were empty"
                )));
            }
            if should_stop {
                has_more = false;
            }
        } else {
            match &extracted {
                Value::Array(items) => {
                    if (items.len() as i64) < page_size_count {
                        has_more = false;
                    }
                    let hash = crate::utils::hash::stable_hash(&extracted);
                    if !seen_hashes.insert(hash) {
                        break;
                    }
                    all_results.extend(items.iter().cloned());
                }
                other if !is_empty_value(other) => {
                    all_results.push(other.clone());
                    pushed_single_object = true;
                    has_more = false;
                }
                _ => {
                    has_more = false;
                }
            }
        }

        match pagination_type {
            PaginationType::PageBased => page += 1,
            PaginationType::OffsetBased => offset += page_size_count,
            PaginationType::CursorBased => {
                cursor = cursor_path
                    .as_deref()
                    .map(|path| strict_path(&body, path))
                    .unwrap_or(Value::Null);
                if cursor.is_null() {
                    has_more = false;
                }
            }
            PaginationType::Disabled => has_more = false,
        }

        loop_counter += 1;
    }

    let data = assemble(
        pagination_type,
        all_results,
        pushed_single_object,
        cursor,
    );

    Ok(PaginationOutcome {
        data,
        status: last_status,
        headers: last_headers,
    })
}

fn build_request(config: &ApiConfig, scope: &VariableScope, timeout: Duration) -> ResolvedRequest {
    let host = substitute(&config.url_host, scope);
    let path = substitute(&config.url_path, scope);
    let url = join_url(&host, &path);

    let headers = filter_unresolved(
        config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, scope)))
            .collect(),
    );
    let query_params = filter_unresolved(
        config
            .query_params
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, scope)))
            .collect(),
    );
    let body = config.body.as_ref().map(|b| substitute(b, scope));

    ResolvedRequest {
        method: config.method,
        url,
        headers,
        query_params,
        body,
        timeout,
    }
}

pub fn join_url(host: &str, path: &str) -> String {
    let host = host.trim_end_matches('/');
    let path = path.trim();
    if path.is_empty() {
        host.to_string()
    } else {
        format!("{}/{}", host, path.trim_start_matches('/'))
    }
}

/// Validates a page before it enters accumulation: status, HTML smell test,
/// string-body format detection, and remote error envelopes.
fn check_and_parse(
    config: &ApiConfig,
    response: &HttpResponse,
    secrets: &[String],
) -> Result<Value, EngineError> {
    if let Value::String(raw) = &response.data {
        if is_html_response(raw) {
            return Err(EngineError::HtmlResponse(format!(
                "endpoint {} answered with an HTML page; the URL is probably wrong",
                config.id
            )));
        }
    }

    if !response.is_success() {
        let detail = match &response.data {
            Value::String(s) => s.chars().take(500).collect::<String>(),
            other => other.to_string().chars().take(500).collect::<String>(),
        };
        return Err(EngineError::ApiCall {
            status: response.status,
            message: mask_text(
                &format!("{} {}: {detail}", response.status, response.status_text),
                secrets,
            ),
            masked_config: masked_config_json(config, secrets),
        });
    }

    let body = match &response.data {
        Value::String(raw) => parse_body(raw),
        other => other.clone(),
    };

    if let Some(remote_error) = body_error_message(&body) {
        return Err(EngineError::ApiCall {
            status: response.status,
            message: mask_text(&format!("response body reports an error: {remote_error}"), secrets),
            masked_config: masked_config_json(config, secrets),
        });
    }

    Ok(body)
}

fn masked_config_json(config: &ApiConfig, secrets: &[String]) -> Option<Value> {
    serde_json::to_value(config)
        .ok()
        .map(|v| mask_json(&v, secrets))
}

/// Dot-path walk where a missing segment falls through, leaving the value
/// reached so far unchanged; malformed paths degrade instead of failing.
pub fn extract_data_path(body: &Value, path: Option<&str>) -> Value {
    let Some(path) = path else {
        return body.clone();
    };
    let mut current = body;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(arr) => segment.parse::<usize>().ok().and_then(|i| arr.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => break,
        }
    }
    current.clone()
}

/// Strict dot-path walk used for cursors: missing segments yield null.
fn strict_path(body: &Value, path: &str) -> Value {
    let mut current = body;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(arr) => segment.parse::<usize>().ok().and_then(|i| arr.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn accumulate(results: &mut Vec<Value>, extracted: &Value, pushed_single_object: &mut bool) {
    match extracted {
        Value::Array(items) => results.extend(items.iter().cloned()),
        Value::Null => {}
        other => {
            results.push(other.clone());
            *pushed_single_object = true;
        }
    }
}

fn assemble(
    pagination_type: PaginationType,
    results: Vec<Value>,
    pushed_single_object: bool,
    cursor: Value,
) -> Value {
    if pagination_type == PaginationType::CursorBased {
        if pushed_single_object && results.len() == 1 {
            if let Value::Object(mut map) = results.into_iter().next().unwrap_or(Value::Null) {
                map.insert("next_cursor".to_string(), cursor);
                return Value::Object(map);
            }
            return json!({ "next_cursor": cursor, "results": [] });
        }
        return json!({ "next_cursor": cursor, "results": results });
    }

    let mut results = results;
    match results.len() {
        1 => results.remove(0),
        _ => Value::Array(results),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::api::{HttpMethod, Pagination};
    use axum::extract::Query;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn defaults() -> ServerDefaults {
        ServerDefaults::default()
    }

    async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), handle)
    }

    fn paged_config(host: &str, pagination: Pagination) -> ApiConfig {
        ApiConfig {
            id: "test-endpoint".into(),
            url_host: host.into(),
            url_path: "/items".into(),
            method: HttpMethod::GET,
            pagination: Some(pagination),
            ..Default::default()
        }
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("https://a.com/", "/v1/x"), "https://a.com/v1/x");
        assert_eq!(join_url("https://a.com", "v1/x"), "https://a.com/v1/x");
        assert_eq!(join_url("https://a.com/", ""), "https://a.com");
    }

    #[test]
    fn data_path_missing_segment_falls_through() {
        let body = json!({"data": {"items": [1, 2]}});
        assert_eq!(
            extract_data_path(&body, Some("data.items")),
            json!([1, 2])
        );
        // `nope` is missing: the walk stops at `data` and keeps it.
        assert_eq!(
            extract_data_path(&body, Some("data.nope")),
            json!({"items": [1, 2]})
        );
        assert_eq!(extract_data_path(&body, None), body);
    }

    #[tokio::test]
    async fn page_based_two_pages_concatenate() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let app = Router::new().route(
            "/items",
            get(move || {
                let hits = hits_clone.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        axum::Json(json!([{"id": 1}, {"id": 2}]))
                    } else {
                        axum::Json(json!([{"id": 3}]))
                    }
                }
            }),
        );
        let (host, server) = serve(app).await;

        let config = paged_config(
            &host,
            Pagination {
                pagination_type: PaginationType::PageBased,
                page_size: "2".into(),
                cursor_path: None,
                stop_condition: None,
            },
        );

        let outcome = fetch_all(
            &Client::new(),
            &config,
            &VariableScope::new(),
            &RequestOptions::default(),
            &defaults(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(outcome.data, json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn offset_variables_are_substituted_per_page() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let app = Router::new().route(
            "/items",
            get(
                move |Query(params): Query<HashMap<String, String>>| {
                    let seen = seen_clone.clone();
                    async move {
                        let offset = params.get("offset").cloned().unwrap_or_default();
                        let limit = params.get("limit").cloned().unwrap_or_default();
                        seen.lock().unwrap().push((offset.clone(), limit));
                        if offset == "0" {
                            axum::Json(json!([{"id": 1}, {"id": 2}]))
                        } else {
                            axum::Json(json!([{"id": 3}]))
                        }
                    }
                },
            ),
        );
        let (host, server) = serve(app).await;

        let mut config = paged_config(
            &host,
            Pagination {
                pagination_type: PaginationType::OffsetBased,
                page_size: "2".into(),
                cursor_path: None,
                stop_condition: None,
            },
        );
        config.query_params = HashMap::from([
            ("offset".to_string(), "{offset}".to_string()),
            ("limit".to_string(), "{limit}".to_string()),
        ]);

        let outcome = fetch_all(
            &Client::new(),
            &config,
            &VariableScope::new(),
            &RequestOptions::default(),
            &defaults(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(outcome.data, json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        let recorded = seen.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![
                ("0".to_string(), "2".to_string()),
                ("2".to_string(), "2".to_string())
            ]
        );
        server.abort();
    }

    #[tokio::test]
    async fn cursor_based_collects_until_null_cursor() {
        let app = Router::new().route(
            "/items",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                match params.get("cursor").map(|s| s.as_str()) {
                    None | Some("") | Some("undefined") => axum::Json(json!({
                        "data": [{"id": 1}, {"id": 2}],
                        "meta": {"next_cursor": "c1"}
                    })),
                    Some(_) => axum::Json(json!({
                        "data": [{"id": 3}],
                        "meta": {"next_cursor": null}
                    })),
                }
            }),
        );
        let (host, server) = serve(app).await;

        let mut config = paged_config(
            &host,
            Pagination {
                pagination_type: PaginationType::CursorBased,
                page_size: "2".into(),
                cursor_path: Some("meta.next_cursor".into()),
                stop_condition: None,
            },
        );
        config.data_path = Some("data".into());
        config.query_params =
            HashMap::from([("cursor".to_string(), "{cursor}".to_string())]);

        let outcome = fetch_all(
            &Client::new(),
            &config,
            &VariableScope::new(),
            &RequestOptions::default(),
            &defaults(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(
            outcome.data,
            json!({
                "next_cursor": null,
                "results": [{"id": 1}, {"id": 2}, {"id": 3}]
            })
        );
        server.abort();
    }

    #[tokio::test]
    async fn html_responses_are_rejected() {
        let app = Router::new().route(
            "/items",
            get(|| async {
                (
                    [("content-type", "text/html")],
                    "<!DOCTYPE html><html><body>login</body></html>",
                )
            }),
        );
        let (host, server) = serve(app).await;

        let config = ApiConfig {
            id: "html-endpoint".into(),
            url_host: host,
            url_path: "/items".into(),
            ..Default::default()
        };

        let err = fetch_all(
            &Client::new(),
            &config,
            &VariableScope::new(),
            &RequestOptions::default(),
            &defaults(),
            &[],
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("Received HTML response"));
        server.abort();
    }

    #[tokio::test]
    async fn identical_first_pages_with_stop_condition_fail() {
        let app = Router::new().route(
            "/items",
            get(|| async { axum::Json(json!([{"id": 1}, {"id": 2}])) }),
        );
        let (host, server) = serve(app).await;

        let config = paged_config(
            &host,
            Pagination {
                pagination_type: PaginationType::PageBased,
                page_size: "2".into(),
                cursor_path: None,
                stop_condition: Some("$count($response) = 0".into()),
            },
        );

        let err = fetch_all(
            &Client::new(),
            &config,
            &VariableScope::new(),
            &RequestOptions::default(),
            &defaults(),
            &[],
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("pagination parameters"));
        server.abort();
    }

    #[tokio::test]
    async fn duplicate_pages_without_stop_condition_terminate_after_two_requests() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let app = Router::new().route(
            "/items",
            get(move || {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!([{"id": 1}, {"id": 2}]))
                }
            }),
        );
        let (host, server) = serve(app).await;

        let config = paged_config(
            &host,
            Pagination {
                pagination_type: PaginationType::PageBased,
                page_size: "2".into(),
                cursor_path: None,
                stop_condition: None,
            },
        );

        let outcome = fetch_all(
            &Client::new(),
            &config,
            &VariableScope::new(),
            &RequestOptions::default(),
            &defaults(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(outcome.data, json!([{"id": 1}, {"id": 2}]));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn remote_error_bodies_become_api_call_errors() {
        let app = Router::new().route(
            "/items",
            get(|| async { axum::Json(json!({"error": "invalid key sk_test_99"})) }),
        );
        let (host, server) = serve(app).await;

        let config = ApiConfig {
            id: "err-endpoint".into(),
            url_host: host,
            url_path: "/items".into(),
            ..Default::default()
        };

        let err = fetch_all(
            &Client::new(),
            &config,
            &VariableScope::new(),
            &RequestOptions::default(),
            &defaults(),
            &["sk_test_99".to_string()],
        )
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("reports an error"));
        assert!(!message.contains("sk_test_99"));
        server.abort();
    }

    #[tokio::test]
    async fn single_object_response_returns_the_object() {
        let app = Router::new().route(
            "/items",
            get(|| async { axum::Json(json!({"id": 7, "name": "solo"})) }),
        );
        let (host, server) = serve(app).await;

        let config = ApiConfig {
            id: "single".into(),
            url_host: host,
            url_path: "/items".into(),
            ..Default::default()
        };

        let outcome = fetch_all(
            &Client::new(),
            &config,
            &VariableScope::new(),
            &RequestOptions::default(),
            &defaults(),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(outcome.data, json!({"id": 7, "name": "solo"}));
        assert_eq!(outcome.status, 200);
        server.abort();
    }
}
