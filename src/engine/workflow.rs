use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ServerDefaults;
use crate::datastore::DataStore;
use crate::engine::expression::evaluate;
use crate::engine::healing::{execute_with_healing, HealedCall, HealingContext};
use crate::engine::postgres::PostgresCaller;
use crate::error::EngineError;
use crate::llm::{ChatMessage, LlmClient, LlmReply};
use crate::models::api::{
    ApiConfig, AuthType, ConfigSnapshot, RequestOptions, RunResult,
};
use crate::models::integration::Integration;
use crate::models::workflow::{ExecutionMode, ExecutionStep, StepResult, Workflow, WorkflowResult};
use crate::services::oauth::{build_oauth_headers, is_token_expired, refresh_oauth_token};
use time::OffsetDateTime;

/// A workflow to execute: stored (loaded by id) or supplied inline.
pub enum WorkflowRef {
    Id(String),
    Inline(Box<Workflow>),
}

/// The execution runtime. One instance per process; every public operation
/// is independent and may run concurrently.
pub struct Orchestrator {
    store: Arc<dyn DataStore>,
    llm: Arc<dyn LlmClient>,
    http: Client,
    postgres: PostgresCaller,
    defaults: ServerDefaults,
    /// Serializes OAuth refresh per (org, integration) so concurrent steps
    /// cannot race a token rotation.
    refresh_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn DataStore>, llm: Arc<dyn LlmClient>, defaults: ServerDefaults) -> Self {
        Self {
            store,
            llm,
            http: Client::new(),
            postgres: PostgresCaller::new(),
            defaults,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    fn healing_context(&self) -> HealingContext<'_> {
        HealingContext {
            llm: self.llm.as_ref(),
            client: &self.http,
            postgres: &self.postgres,
            defaults: &self.defaults,
        }
    }

    /// Executes a single configured call outside any workflow, recording a
    /// run either way.
    pub async fn call(
        &self,
        org_id: &str,
        config: &ApiConfig,
        payload: &Value,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
    ) -> RunResult {
        let run_id = Uuid::new_v4().to_string();
        let started_at = OffsetDateTime::now_utc();

        let mut run = RunResult {
            id: run_id,
            success: false,
            data: None,
            error: None,
            started_at,
            completed_at: None,
            config: ConfigSnapshot::Api(config.clone()),
            status_code: None,
            headers: HashMap::new(),
        };
        if let Err(err) = self.store.upsert_run(org_id, &run).await {
            warn!(%err, "failed to record run start");
        }

        let ctx = self.healing_context();
        match execute_with_healing(&ctx, config, None, payload, credentials, options).await {
            Ok(HealedCall { response, config }) => {
                run.success = true;
                run.data = Some(response.data);
                run.status_code = Some(response.status_code);
                run.headers = response.headers;
                run.config = ConfigSnapshot::Api(config);
            }
            Err(err) => {
                run.error = Some(err.to_string());
                run.status_code = err.status_code();
            }
        }
        run.completed_at = Some(OffsetDateTime::now_utc());

        if let Err(err) = self.store.upsert_run(org_id, &run).await {
            warn!(%err, "failed to finalize run");
        }
        run
    }

    /// Executes a workflow end to end. Always returns a `WorkflowResult`;
    /// failures land in `error` with `success = false`.
    pub async fn execute_workflow(
        &self,
        org_id: &str,
        reference: WorkflowRef,
        payload: Value,
        credentials: HashMap<String, String>,
        options: RequestOptions,
    ) -> WorkflowResult {
        let started_at = OffsetDateTime::now_utc();
        let run_id = Uuid::new_v4().to_string();

        let workflow = match self.resolve_workflow(org_id, reference).await {
            Ok(workflow) => workflow,
            Err(err) => {
                return WorkflowResult {
                    id: run_id,
                    success: false,
                    data: None,
                    error: Some(err.to_string()),
                    started_at,
                    completed_at: OffsetDateTime::now_utc(),
                    config: Workflow::default(),
                    step_results: Vec::new(),
                }
            }
        };

        let mut run = RunResult {
            id: run_id.clone(),
            success: false,
            data: None,
            error: None,
            started_at,
            completed_at: None,
            config: ConfigSnapshot::Workflow(workflow.clone()),
            status_code: None,
            headers: HashMap::new(),
        };
        if let Err(err) = self.store.upsert_run(org_id, &run).await {
            warn!(%err, "failed to record workflow run start");
        }

        let workflow_timeout = options
            .workflow_timeout
            .unwrap_or(self.defaults.workflow_timeout);
        let outcome = tokio::time::timeout(
            workflow_timeout,
            self.run_steps(org_id, &workflow, &payload, &credentials, &options),
        )
        .await;

        let (step_results, data, error) = match outcome {
            Ok(result) => result,
            Err(_) => (
                Vec::new(),
                None,
                Some(EngineError::Timeout(workflow_timeout).to_string()),
            ),
        };

        let success = error.is_none();
        let completed_at = OffsetDateTime::now_utc();

        run.success = success;
        run.data = data.clone();
        run.error = error.clone();
        run.completed_at = Some(completed_at);
        if let Err(err) = self.store.upsert_run(org_id, &run).await {
            warn!(%err, "failed to finalize workflow run");
        }

        WorkflowResult {
            id: run_id,
            success,
            data,
            error,
            started_at,
            completed_at,
            config: workflow,
            step_results,
        }
    }

    async fn resolve_workflow(
        &self,
        org_id: &str,
        reference: WorkflowRef,
    ) -> Result<Workflow, EngineError> {
        let workflow = match reference {
            WorkflowRef::Inline(workflow) => *workflow,
            WorkflowRef::Id(id) => self
                .store
                .get_workflow(org_id, &id)
                .await?
                .ok_or_else(|| EngineError::Abort(format!("workflow {id} not found")))?,
        };
        workflow.validate().map_err(EngineError::Abort)?;
        Ok(workflow)
    }

    async fn run_steps(
        &self,
        org_id: &str,
        workflow: &Workflow,
        payload: &Value,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
    ) -> (Vec<StepResult>, Option<Value>, Option<String>) {
        let mut integrations = match self
            .store
            .get_many_integrations(org_id, &workflow.integration_ids)
            .await
        {
            Ok(list) => list
                .into_iter()
                .map(|i| (i.id.clone(), i))
                .collect::<HashMap<_, _>>(),
            Err(err) => return (Vec::new(), None, Some(err.to_string())),
        };

        let mut step_results: Vec<StepResult> = Vec::new();
        let mut step_outputs: Map<String, Value> = Map::new();

        for step in &workflow.steps {
            if let Some(integration_id) = &step.integration_id {
                if let Err(err) = self
                    .ensure_fresh_token(org_id, integration_id, &mut integrations)
                    .await
                {
                    warn!(%err, integration_id, "token refresh failed; continuing with stale token");
                }
            }
            let integration = step
                .integration_id
                .as_ref()
                .and_then(|id| integrations.get(id));

            let step_credentials =
                merge_credentials(credentials, integration, integrations.len());

            match self
                .run_step(step, integration, payload, &step_outputs, &step_credentials, options)
                .await
            {
                Ok((raw, transformed)) => {
                    step_outputs.insert(step.id.clone(), transformed.clone());
                    step_results.push(StepResult {
                        step_id: step.id.clone(),
                        success: true,
                        raw_data: Some(raw),
                        transformed_data: Some(transformed),
                        error: None,
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    step_results.push(StepResult {
                        step_id: step.id.clone(),
                        success: false,
                        raw_data: None,
                        transformed_data: None,
                        error: Some(message.clone()),
                    });
                    return (
                        step_results,
                        None,
                        Some(format!("step {} failed: {message}", step.id)),
                    );
                }
            }
        }

        let steps_value = Value::Object(step_outputs);
        let data = match &workflow.final_transform {
            Some(transform) if !transform.trim().is_empty() => {
                let bindings = HashMap::from([
                    ("steps".to_string(), steps_value.clone()),
                    ("payload".to_string(), payload.clone()),
                    ("credentials".to_string(), credentials_value(credentials)),
                ]);
                match self.apply_mapping_with(transform, &bindings, options).await {
                    Ok(value) => value,
                    Err(err) => {
                        return (
                            step_results,
                            None,
                            Some(format!("final transform failed: {err}")),
                        )
                    }
                }
            }
            _ => steps_value,
        };

        (step_results, Some(data), None)
    }

    async fn run_step(
        &self,
        step: &ExecutionStep,
        integration: Option<&Integration>,
        payload: &Value,
        step_outputs: &Map<String, Value>,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
    ) -> Result<(Value, Value), EngineError> {
        let bindings = HashMap::from([
            ("payload".to_string(), payload.clone()),
            ("credentials".to_string(), credentials_value(credentials)),
            ("steps".to_string(), Value::Object(step_outputs.clone())),
        ]);

        let step_payload = match &step.input_mapping {
            Some(mapping) if !mapping.trim().is_empty() => {
                evaluate(mapping, bindings.clone(), self.defaults.expression_timeout).await?
            }
            _ => default_step_scope(payload, step_outputs),
        };

        let config = prepare_config(step, integration);
        let ctx = self.healing_context();

        let raw = match step.execution_mode {
            ExecutionMode::Direct => {
                let healed = execute_with_healing(
                    &ctx,
                    &config,
                    integration,
                    &step_payload,
                    credentials,
                    options,
                )
                .await?;
                healed.response.data
            }
            ExecutionMode::Loop => {
                let selector = step.loop_selector.as_deref().unwrap_or_default();
                let selected = if selector.trim().is_empty() {
                    Value::Null
                } else {
                    evaluate(selector, bindings.clone(), self.defaults.expression_timeout).await?
                };
                let items = match selected {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                let cap = step
                    .loop_max_iters
                    .unwrap_or(self.defaults.max_loop_iterations)
                    .min(items.len());
                if cap < items.len() {
                    debug!(
                        step_id = %step.id,
                        total = items.len(),
                        cap,
                        "loop selector produced more items than the iteration cap"
                    );
                }

                let semaphore = Arc::new(Semaphore::new(self.defaults.max_loop_concurrency));
                let iterations = items.into_iter().take(cap).enumerate().map(|(index, item)| {
                    let semaphore = semaphore.clone();
                    let config = &config;
                    let ctx = &ctx;
                    let step_payload = &step_payload;
                    async move {
                        let _permit = semaphore
                            .acquire()
                            .await
                            .expect("loop semaphore closed");
                        let mut iteration_payload = step_payload.clone();
                        bind_loop_item(&mut iteration_payload, &item, index);
                        // A config repaired during one iteration stays local
                        // to it; siblings keep the config they started with.
                        execute_with_healing(
                            ctx,
                            config,
                            integration,
                            &iteration_payload,
                            credentials,
                            options,
                        )
                        .await
                        .map(|healed| healed.response.data)
                    }
                });

                let results = join_all(iterations).await;
                let mut collected = Vec::with_capacity(results.len());
                for result in results {
                    collected.push(result?);
                }
                Value::Array(collected)
            }
        };

        let transformed = match &step.response_mapping {
            Some(mapping) if !mapping.trim().is_empty() => {
                let mut mapping_bindings = bindings.clone();
                mapping_bindings.insert("response".to_string(), raw.clone());
                self.apply_mapping_with(mapping, &mapping_bindings, options)
                    .await?
            }
            _ => raw.clone(),
        };

        Ok((raw, transformed))
    }

    /// Evaluates a JSONata mapping; when transform healing is on, a failing
    /// expression gets one shot at LLM repair before the error surfaces.
    async fn apply_mapping_with(
        &self,
        expr: &str,
        bindings: &HashMap<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, EngineError> {
        match evaluate(expr, bindings.clone(), self.defaults.expression_timeout).await {
            Ok(value) => Ok(value),
            Err(err) if options.self_healing.heals_transforms() => {
                warn!(%err, "mapping failed; asking the model for a repaired expression");
                let Some(repaired) = self.repair_mapping(expr, &err.to_string(), bindings).await
                else {
                    return Err(err);
                };
                evaluate(&repaired, bindings.clone(), self.defaults.expression_timeout).await
            }
            Err(err) => Err(err),
        }
    }

    async fn repair_mapping(
        &self,
        expr: &str,
        error: &str,
        bindings: &HashMap<String, Value>,
    ) -> Option<String> {
        let binding_names: Vec<String> = bindings.keys().map(|k| format!("${k}")).collect();
        let prompt = format!(
            "This JSONata expression failed.\n\nExpression: {expr}\nError: {error}\n\
             Available bindings: {}\n\n\
             Reply with a JSON object {{\"mapping\": \"<corrected expression>\"}}.",
            binding_names.join(", ")
        );
        let reply = self
            .llm
            .chat(&[ChatMessage::user(prompt)], &[], 0.2)
            .await
            .ok()?;
        match reply {
            LlmReply::FinalObject { value } => value
                .get("mapping")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string()),
            _ => None,
        }
    }

    /// Refreshes an integration's OAuth token if it is about to expire,
    /// serialized per (org, integration) and persisted on success.
    async fn ensure_fresh_token(
        &self,
        org_id: &str,
        integration_id: &str,
        integrations: &mut HashMap<String, Integration>,
    ) -> Result<(), EngineError> {
        let needs_refresh = integrations
            .get(integration_id)
            .map(|i| is_token_expired(i))
            .unwrap_or(false);
        if !needs_refresh {
            return Ok(());
        }

        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry((org_id.to_string(), integration_id.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // another task may have refreshed while we waited on the lock
        let mut current = self
            .store
            .get_integration(org_id, integration_id)
            .await?
            .or_else(|| integrations.get(integration_id).cloned())
            .ok_or_else(|| {
                EngineError::TokenRefreshFailed(format!("integration {integration_id} not found"))
            })?;
        if !is_token_expired(&current) {
            integrations.insert(integration_id.to_string(), current);
            return Ok(());
        }

        if refresh_oauth_token(&self.http, &mut current).await {
            self.store.upsert_integration(org_id, &current).await?;
            integrations.insert(integration_id.to_string(), current);
            Ok(())
        } else {
            Err(EngineError::TokenRefreshFailed(integration_id.to_string()))
        }
    }
}

/// Default input scope when a step has no input mapping: payload fields
/// merged with prior step outputs keyed by step id.
fn default_step_scope(payload: &Value, step_outputs: &Map<String, Value>) -> Value {
    let mut merged = match payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (step_id, output) in step_outputs {
        merged.insert(step_id.clone(), output.clone());
    }
    Value::Object(merged)
}

fn bind_loop_item(payload: &mut Value, item: &Value, index: usize) {
    if let Value::Object(map) = payload {
        map.insert("currentItem".to_string(), item.clone());
        map.insert("currentIndex".to_string(), json!(index));
    } else {
        *payload = json!({ "currentItem": item, "currentIndex": index });
    }
}

/// Caller credentials plus the integration's, namespaced as
/// `<integrationId>_<key>`; bare keys are kept when the workflow touches a
/// single integration only.
fn merge_credentials(
    base: &HashMap<String, String>,
    integration: Option<&Integration>,
    integration_count: usize,
) -> HashMap<String, String> {
    let mut merged = base.clone();
    if let Some(integration) = integration {
        for (key, value) in &integration.credentials {
            merged.insert(format!("{}_{}", integration.id, key), value.clone());
            if integration_count <= 1 {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    merged
}

fn credentials_value(credentials: &HashMap<String, String>) -> Value {
    Value::Object(
        credentials
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Per-step config: the step's ApiConfig with OAuth headers layered in when
/// the integration authenticates that way.
fn prepare_config(step: &ExecutionStep, integration: Option<&Integration>) -> ApiConfig {
    let mut config = step.api_config.clone();
    if config.authentication == AuthType::OAuth2 {
        if let Some(integration) = integration {
            for (name, value) in build_oauth_headers(integration) {
                config.headers.entry(name).or_insert(value);
            }
        }
    }
    config
}
