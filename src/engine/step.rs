use std::collections::HashMap;

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::ServerDefaults;
use crate::engine::pagination::{fetch_all, join_url};
use crate::engine::postgres::{is_postgres_url, PostgresCaller, SqlStatement};
use crate::engine::templating::{merge_scope, scope_from_json, substitute, VariableScope};
use crate::error::EngineError;
use crate::models::api::{ApiConfig, RequestOptions};

#[derive(Debug, Clone)]
pub struct StepResponse {
    pub data: Value,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}

/// Executes a single configured call: builds the variable scope, routes by
/// URL scheme to the Postgres or HTTP path, and extracts the payload.
pub async fn execute_api_call(
    client: &Client,
    postgres: &PostgresCaller,
    config: &ApiConfig,
    payload: &Value,
    credentials: &HashMap<String, String>,
    options: &RequestOptions,
    defaults: &ServerDefaults,
) -> Result<StepResponse, EngineError> {
    let scope = build_scope(payload, credentials);
    let secrets: Vec<String> = credentials
        .values()
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .collect();

    let endpoint = join_url(
        &substitute(&config.url_host, &scope),
        &substitute(&config.url_path, &scope),
    );

    if is_postgres_url(&endpoint) {
        debug!(config_id = %config.id, "routing step to postgres caller");
        let body = config
            .body
            .as_ref()
            .map(|b| substitute(b, &scope))
            .unwrap_or_default();
        let statement = SqlStatement::from_body(&body)?;
        let timeout = options.timeout.unwrap_or(defaults.http_timeout);
        let response = postgres.execute(&endpoint, &statement, timeout).await?;
        return Ok(StepResponse {
            data: response.data,
            status_code: response.status,
            headers: response.headers,
        });
    }

    let outcome = fetch_all(client, config, &scope, options, defaults, &secrets).await?;

    validate_shape(config, &outcome.data)?;

    Ok(StepResponse {
        data: outcome.data,
        status_code: outcome.status,
        headers: outcome.headers,
    })
}

/// `{...payload, ...credentials}`; pagination variables are layered on top
/// by the pagination driver per iteration.
pub fn build_scope(payload: &Value, credentials: &HashMap<String, String>) -> VariableScope {
    let payload_scope = scope_from_json(payload);
    let credential_scope: VariableScope = credentials
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    merge_scope(&[&payload_scope, &credential_scope])
}

/// Cheap structural check against the configured response schema: only the
/// top-level `type` is enforced. Semantic validation belongs to the LLM
/// response evaluator.
fn validate_shape(config: &ApiConfig, data: &Value) -> Result<(), EngineError> {
    let Some(expected) = config
        .response_schema
        .as_ref()
        .and_then(|s| s.get("type"))
        .and_then(|t| t.as_str())
    else {
        return Ok(());
    };

    let matches = match expected {
        "array" => data.is_array(),
        "object" => data.is_object(),
        "string" => data.is_string(),
        "number" | "integer" => data.is_number(),
        "boolean" => data.is_boolean(),
        _ => true,
    };

    if !matches {
        return Err(EngineError::ApiCall {
            status: 200,
            message: format!(
                "response shape mismatch for {}: expected top-level {expected}",
                config.id
            ),
            masked_config: None,
        });
    }
    Ok(())
}
