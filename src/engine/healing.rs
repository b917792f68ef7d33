use std::collections::HashMap;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ServerDefaults;
use crate::engine::masking::mask_text;
use crate::engine::postgres::PostgresCaller;
use crate::engine::step::{execute_api_call, StepResponse};
use crate::error::EngineError;
use crate::llm::prompts::{
    evaluator_prompt, repair_context, repair_system_prompt, repair_tools,
    SEARCH_DOCUMENTATION_TOOL, SUBMIT_TOOL,
};
use crate::llm::{ChatMessage, LlmClient, LlmReply, ResponseVerdict};
use crate::models::api::{ApiConfig, RequestOptions};
use crate::models::integration::Integration;

/// Error messages fed to the model are capped at this many characters.
const ERROR_MESSAGE_LIMIT: usize = 2000;
/// Tool round-trips allowed within one repair attempt.
const MAX_TOOL_ROUNDS: usize = 10;

/// Shared handles the healer needs to execute and repair a call.
pub struct HealingContext<'a> {
    pub llm: &'a dyn LlmClient,
    pub client: &'a Client,
    pub postgres: &'a PostgresCaller,
    pub defaults: &'a ServerDefaults,
}

/// A successful call together with the configuration that finally worked
/// (which may differ from the input if the model repaired it).
#[derive(Debug)]
pub struct HealedCall {
    pub response: StepResponse,
    pub config: ApiConfig,
}

/// Runs a configured call under the self-healing loop: execute, judge,
/// repair, retry, bounded by the retry budget. Fatal errors and disabled
/// modes surface immediately.
pub async fn execute_with_healing(
    ctx: &HealingContext<'_>,
    config: &ApiConfig,
    integration: Option<&Integration>,
    payload: &Value,
    credentials: &HashMap<String, String>,
    options: &RequestOptions,
) -> Result<HealedCall, EngineError> {
    let budget = options.retries.unwrap_or(ctx.defaults.max_call_retries);
    let healing = options.self_healing.heals_requests();
    let secrets: Vec<String> = credentials.values().cloned().collect();
    let documentation = integration.map(|i| i.documentation.as_str()).unwrap_or("");

    let mut current = config.clone();
    let mut conversation: Vec<ChatMessage> = Vec::new();
    let mut retry_count: u32 = 0;

    loop {
        let outcome = execute_api_call(
            ctx.client,
            ctx.postgres,
            &current,
            payload,
            credentials,
            options,
            ctx.defaults,
        )
        .await;

        let failure = match outcome {
            Ok(response) => {
                if healing && !options.test_mode {
                    match evaluate_response(ctx, &response.data, &current.instruction, documentation)
                        .await
                    {
                        Some(verdict) if !verdict.success => {
                            format!("response rejected by evaluator: {}", verdict.short_reason)
                        }
                        _ => {
                            return Ok(HealedCall {
                                response,
                                config: current,
                            })
                        }
                    }
                } else {
                    return Ok(HealedCall {
                        response,
                        config: current,
                    });
                }
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) if !healing => return Err(err),
            Err(err) => {
                let masked = mask_text(&err.to_string(), &secrets);
                if retry_count >= budget {
                    return Err(final_error(err, masked));
                }
                masked
            }
        };

        if retry_count >= budget {
            return Err(EngineError::ApiCall {
                status: 500,
                message: truncate(&failure, ERROR_MESSAGE_LIMIT),
                masked_config: serde_json::to_value(&current).ok(),
            });
        }

        retry_count += 1;
        let temperature = (retry_count as f32 * 0.1).min(1.0);
        debug!(config_id = %current.id, retry_count, temperature, "attempting repair");

        current = repair_config(
            ctx,
            &mut conversation,
            &current,
            integration,
            payload,
            credentials,
            &failure,
            temperature,
        )
        .await?;
    }
}

fn final_error(err: EngineError, masked_message: String) -> EngineError {
    match err {
        EngineError::ApiCall {
            status,
            masked_config,
            ..
        } => EngineError::ApiCall {
            status,
            message: truncate(&masked_message, ERROR_MESSAGE_LIMIT),
            masked_config,
        },
        other => other,
    }
}

/// One repair attempt: extends the running conversation with the failure,
/// lets the model search documentation, and expects a submitted config.
#[allow(clippy::too_many_arguments)]
async fn repair_config(
    ctx: &HealingContext<'_>,
    conversation: &mut Vec<ChatMessage>,
    current: &ApiConfig,
    integration: Option<&Integration>,
    payload: &Value,
    credentials: &HashMap<String, String>,
    failure: &str,
    temperature: f32,
) -> Result<ApiConfig, EngineError> {
    let documentation = integration.map(|i| i.documentation.as_str()).unwrap_or("");

    if conversation.is_empty() {
        let mut credential_names: Vec<String> = credentials.keys().cloned().collect();
        credential_names.sort();
        let payload_sample = sample_payload(payload, ctx.defaults.llm_context_length);
        conversation.push(ChatMessage::system(repair_system_prompt()));
        conversation.push(ChatMessage::user(repair_context(
            current,
            integration.and_then(|i| i.specific_instructions.as_deref()),
            &search_documentation(documentation, &current.instruction),
            &payload_sample,
            &credential_names,
        )));
    }

    conversation.push(ChatMessage::user(format!(
        "The call failed: {}",
        truncate(failure, ERROR_MESSAGE_LIMIT)
    )));

    let tools = repair_tools();

    for _ in 0..MAX_TOOL_ROUNDS {
        let reply = ctx
            .llm
            .chat(conversation, &tools, temperature)
            .await
            .map_err(|e| EngineError::Abort(format!("llm call failed: {e}")))?;

        match reply {
            LlmReply::ToolCall { name, arguments } if name == SEARCH_DOCUMENTATION_TOOL => {
                let query = arguments
                    .get("query")
                    .and_then(|q| q.as_str())
                    .unwrap_or_default();
                let excerpt = search_documentation(documentation, query);
                conversation.push(ChatMessage::assistant(format!(
                    "searchDocumentation({query})"
                )));
                conversation.push(ChatMessage::tool(if excerpt.is_empty() {
                    "no matching documentation".to_string()
                } else {
                    excerpt
                }));
            }
            LlmReply::ToolCall { name, arguments } if name == SUBMIT_TOOL => {
                let candidate = arguments.get("config").cloned().unwrap_or(arguments);
                match serde_json::from_value::<ApiConfig>(candidate) {
                    Ok(mut repaired) => {
                        if repaired.id.is_empty() {
                            repaired.id = current.id.clone();
                        }
                        return Ok(repaired);
                    }
                    Err(parse_err) => {
                        conversation.push(ChatMessage::user(format!(
                            "submitted config did not parse: {parse_err}; submit the full \
                             configuration object"
                        )));
                    }
                }
            }
            LlmReply::ToolCall { name, .. } => {
                conversation.push(ChatMessage::user(format!(
                    "unknown tool {name}; use searchDocumentation or submit"
                )));
            }
            LlmReply::FinalObject { value } => {
                let candidate = value.get("config").cloned().unwrap_or(value);
                if let Ok(mut repaired) = serde_json::from_value::<ApiConfig>(candidate) {
                    if repaired.id.is_empty() {
                        repaired.id = current.id.clone();
                    }
                    return Ok(repaired);
                }
                conversation.push(ChatMessage::user(
                    "answer did not contain a parseable configuration; call submit".to_string(),
                ));
            }
            LlmReply::Error { message } => {
                return Err(EngineError::Abort(message));
            }
        }
    }

    Err(EngineError::Abort(
        "model exhausted tool rounds without submitting a configuration".to_string(),
    ))
}

/// Asks the model whether a successful response actually serves the
/// instruction. Evaluator malfunction is treated as acceptance so a flaky
/// judge cannot fail healthy calls.
async fn evaluate_response(
    ctx: &HealingContext<'_>,
    data: &Value,
    instruction: &str,
    documentation: &str,
) -> Option<ResponseVerdict> {
    let sample = sample_payload(data, ctx.defaults.llm_context_length);
    let prompt = evaluator_prompt(
        &sample,
        instruction,
        &search_documentation(documentation, instruction),
    );

    let reply = ctx
        .llm
        .chat(&[ChatMessage::user(prompt)], &[], 0.0)
        .await;

    match reply {
        Ok(LlmReply::FinalObject { value }) => match serde_json::from_value(value) {
            Ok(verdict) => Some(verdict),
            Err(err) => {
                warn!(?err, "response evaluator returned an unparseable verdict");
                None
            }
        },
        Ok(other) => {
            warn!(?other, "response evaluator returned a non-verdict reply");
            None
        }
        Err(err) => {
            warn!(%err, "response evaluator call failed");
            None
        }
    }
}

/// Keyword search over the integration documentation: the text is split
/// into chunks and the best-scoring chunks are returned joined.
pub fn search_documentation(documentation: &str, query: &str) -> String {
    if documentation.trim().is_empty() || query.trim().is_empty() {
        return String::new();
    }

    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect();
    if terms.is_empty() {
        return String::new();
    }

    let chunks = chunk_documentation(documentation, 1200);
    let mut scored: Vec<(usize, &String)> = chunks
        .iter()
        .map(|chunk| {
            let lower = chunk.to_lowercase();
            let score = terms.iter().map(|t| lower.matches(t.as_str()).count()).sum();
            (score, chunk)
        })
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    scored
        .into_iter()
        .take(3)
        .map(|(_, chunk)| chunk.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn chunk_documentation(documentation: &str, target_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in documentation.split("\n\n") {
        if !current.is_empty() && current.len() + paragraph.len() > target_len {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Payload excerpt bounded to a tenth of the model context.
fn sample_payload(payload: &Value, context_length: usize) -> String {
    if payload.is_null() {
        return String::new();
    }
    let rendered = serde_json::to_string(payload).unwrap_or_default();
    truncate(&rendered, context_length / 10)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::models::api::SelfHealingMode;
    use axum::routing::get;
    use axum::Router;
    use mockall::Sequence;
    use serde_json::json;

    async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), handle)
    }

    fn items_app() -> Router {
        Router::new()
            .route("/right", get(|| async { axum::Json(json!([{"id": 1}])) }))
            .route(
                "/wrong",
                get(|| async { (axum::http::StatusCode::NOT_FOUND, "not here") }),
            )
    }

    fn config_for(host: &str, path: &str) -> ApiConfig {
        ApiConfig {
            id: "fetch-items".into(),
            url_host: host.into(),
            url_path: path.into(),
            instruction: "fetch the items".into(),
            ..Default::default()
        }
    }

    fn options(mode: SelfHealingMode) -> RequestOptions {
        RequestOptions {
            self_healing: mode,
            test_mode: true,
            retries: Some(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_with_healing_disabled_never_calls_the_model() {
        let (host, server) = serve(items_app()).await;
        let llm = MockLlmClient::new();
        let ctx = HealingContext {
            llm: &llm,
            client: &Client::new(),
            postgres: &PostgresCaller::new(),
            defaults: &ServerDefaults::default(),
        };

        let result = execute_with_healing(
            &ctx,
            &config_for(&host, "/right"),
            None,
            &json!({}),
            &HashMap::new(),
            &options(SelfHealingMode::Disabled),
        )
        .await
        .unwrap();

        assert_eq!(result.response.data, json!([{"id": 1}]));
        server.abort();
    }

    #[tokio::test]
    async fn failing_call_is_repaired_by_submitted_config() {
        let (host, server) = serve(items_app()).await;
        let repaired = config_for(&host, "/right");
        let repaired_json = serde_json::to_value(&repaired).unwrap();

        let mut llm = MockLlmClient::new();
        llm.expect_chat().times(1).returning(move |_, _, _| {
            Ok(LlmReply::ToolCall {
                name: SUBMIT_TOOL.to_string(),
                arguments: json!({ "config": repaired_json.clone() }),
            })
        });

        let ctx = HealingContext {
            llm: &llm,
            client: &Client::new(),
            postgres: &PostgresCaller::new(),
            defaults: &ServerDefaults::default(),
        };

        let result = execute_with_healing(
            &ctx,
            &config_for(&host, "/wrong"),
            None,
            &json!({}),
            &HashMap::new(),
            &options(SelfHealingMode::Enabled),
        )
        .await
        .unwrap();

        assert_eq!(result.response.data, json!([{"id": 1}]));
        assert_eq!(result.config.url_path, "/right");
        server.abort();
    }

    #[tokio::test]
    async fn model_error_reply_aborts() {
        let (host, server) = serve(items_app()).await;
        let mut llm = MockLlmClient::new();
        llm.expect_chat().times(1).returning(|_, _, _| {
            Ok(LlmReply::Error {
                message: "credentials are invalid".to_string(),
            })
        });

        let ctx = HealingContext {
            llm: &llm,
            client: &Client::new(),
            postgres: &PostgresCaller::new(),
            defaults: &ServerDefaults::default(),
        };

        let err = execute_with_healing(
            &ctx,
            &config_for(&host, "/wrong"),
            None,
            &json!({}),
            &HashMap::new(),
            &options(SelfHealingMode::Enabled),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::Abort(_)));
        server.abort();
    }

    #[tokio::test]
    async fn negative_verdict_triggers_repair_then_reevaluation() {
        let (host, server) = serve(items_app()).await;
        let repaired_json = serde_json::to_value(config_for(&host, "/right")).unwrap();

        let mut llm = MockLlmClient::new();
        let mut seq = Sequence::new();
        llm.expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Ok(LlmReply::FinalObject {
                    value: json!({"success": false, "shortReason": "wrong shape"}),
                })
            });
        llm.expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _, _| {
                Ok(LlmReply::ToolCall {
                    name: SUBMIT_TOOL.to_string(),
                    arguments: json!({ "config": repaired_json.clone() }),
                })
            });
        llm.expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Ok(LlmReply::FinalObject {
                    value: json!({"success": true}),
                })
            });

        let ctx = HealingContext {
            llm: &llm,
            client: &Client::new(),
            postgres: &PostgresCaller::new(),
            defaults: &ServerDefaults::default(),
        };

        let mut opts = options(SelfHealingMode::Enabled);
        opts.test_mode = false;

        let result = execute_with_healing(
            &ctx,
            &config_for(&host, "/right"),
            None,
            &json!({}),
            &HashMap::new(),
            &opts,
        )
        .await
        .unwrap();

        assert_eq!(result.response.data, json!([{"id": 1}]));
        server.abort();
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_masked_api_error() {
        let (host, server) = serve(items_app()).await;
        let broken = config_for(&host, "/wrong");
        let broken_json = serde_json::to_value(&broken).unwrap();

        let mut llm = MockLlmClient::new();
        llm.expect_chat().returning(move |_, _, _| {
            Ok(LlmReply::ToolCall {
                name: SUBMIT_TOOL.to_string(),
                arguments: json!({ "config": broken_json.clone() }),
            })
        });

        let ctx = HealingContext {
            llm: &llm,
            client: &Client::new(),
            postgres: &PostgresCaller::new(),
            defaults: &ServerDefaults::default(),
        };

        let err = execute_with_healing(
            &ctx,
            &broken,
            None,
            &json!({}),
            &HashMap::new(),
            &options(SelfHealingMode::Enabled),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::ApiCall { status: 404, .. }));
        server.abort();
    }

    #[test]
    fn documentation_search_ranks_matching_chunks() {
        let docs = "Authentication\n\nUse the Authorization header with a Bearer token.\n\n\
                    Pagination\n\nPass page and per_page query parameters.\n\n\
                    Webhooks\n\nRegister a webhook URL in settings.";
        let excerpt = search_documentation(docs, "pagination page parameters");
        assert!(excerpt.contains("per_page"));
        let nothing = search_documentation(docs, "zzzzz");
        assert!(nothing.is_empty());
    }

    #[test]
    fn truncate_respects_character_limit() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
    }
}
