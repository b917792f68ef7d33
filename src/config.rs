use std::env;
use std::time::Duration;

use crate::utils::encryption::{decode_key, EncryptionError};

/// Hard safety bound on pagination loops that carry no stop condition.
/// This is a constant, not a tunable.
pub const MAX_PAGINATION_ITERATIONS_WITHOUT_STOP: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatastoreType {
    Memory,
    File,
    Postgres,
}

impl DatastoreType {
    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "file" => DatastoreType::File,
            "postgres" => DatastoreType::Postgres,
            _ => DatastoreType::Memory,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Gemini,
    Anthropic,
}

impl LlmProvider {
    fn parse(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "GEMINI" => LlmProvider::Gemini,
            "ANTHROPIC" => LlmProvider::Anthropic,
            _ => LlmProvider::OpenAi,
        }
    }
}

/// Runtime tunables shared by the executor, pagination driver, and healer.
#[derive(Clone, Debug)]
pub struct ServerDefaults {
    /// Bound on JSONata expression evaluation.
    pub expression_timeout: Duration,
    /// Per HTTP call timeout.
    pub http_timeout: Duration,
    /// Whole-workflow timeout.
    pub workflow_timeout: Duration,
    /// Retry budget shared by the HTTP caller and the self-healing loop.
    pub max_call_retries: u32,
    /// Ceiling on paginated requests when a stop condition is configured.
    pub max_pagination_requests: usize,
    /// Cap on loop-mode iterations when the step does not set its own.
    pub max_loop_iterations: usize,
    /// Bounded fan-out for loop-mode iterations within one step.
    pub max_loop_concurrency: usize,
    /// Upper bound on characters of payload sampled into LLM prompts.
    pub llm_context_length: usize,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            expression_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(60),
            workflow_timeout: Duration::from_secs(300),
            max_call_retries: 8,
            max_pagination_requests: 1000,
            max_loop_iterations: 100,
            max_loop_concurrency: 5,
            llm_context_length: 128_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl PostgresSettings {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Clone)]
pub struct Config {
    pub graphql_port: u16,
    pub web_port: u16,
    pub auth_token: String,
    pub datastore_type: DatastoreType,
    pub storage_dir: String,
    pub postgres: Option<PostgresSettings>,
    pub llm_provider: LlmProvider,
    pub llm_api_key: String,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    /// 32-byte AES-GCM master key; credentials cannot be recovered without it.
    pub master_encryption_key: Option<Vec<u8>>,
    pub defaults: ServerDefaults,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let graphql_port = env_port("GRAPHQL_PORT", 3000);
        let web_port = env_port("WEB_PORT", 3001);
        let auth_token = env::var("AUTH_TOKEN").unwrap_or_default();

        let datastore_type =
            DatastoreType::parse(&env::var("DATASTORE_TYPE").unwrap_or_default());
        let storage_dir = env::var("STORAGE_DIR").unwrap_or_else(|_| "./.superglue".to_string());

        let postgres = match (
            env::var("POSTGRES_HOST"),
            env::var("POSTGRES_USERNAME"),
            env::var("POSTGRES_PASSWORD"),
            env::var("POSTGRES_DB"),
        ) {
            (Ok(host), Ok(username), Ok(password), Ok(database)) => Some(PostgresSettings {
                host,
                port: env_port("POSTGRES_PORT", 5432),
                username,
                password,
                database,
            }),
            _ => None,
        };

        if datastore_type == DatastoreType::Postgres && postgres.is_none() {
            panic!("DATASTORE_TYPE=postgres requires POSTGRES_HOST/USERNAME/PASSWORD/DB");
        }

        let llm_provider = LlmProvider::parse(&env::var("LLM_PROVIDER").unwrap_or_default());
        let (key_var, model_var) = match llm_provider {
            LlmProvider::OpenAi => ("OPENAI_API_KEY", "OPENAI_MODEL"),
            LlmProvider::Gemini => ("GEMINI_API_KEY", "GEMINI_MODEL"),
            LlmProvider::Anthropic => ("ANTHROPIC_API_KEY", "ANTHROPIC_MODEL"),
        };
        let llm_api_key = env::var(key_var).unwrap_or_default();
        let llm_model = env::var(model_var).ok();
        let llm_base_url = env::var("OPENAI_BASE_URL").ok();

        let master_encryption_key = env::var("MASTER_ENCRYPTION_KEY").ok().map(|raw| {
            decode_key(&raw).unwrap_or_else(|err| match err {
                EncryptionError::InvalidKeyLength => {
                    panic!("MASTER_ENCRYPTION_KEY must decode to 32 bytes")
                }
                _ => panic!("MASTER_ENCRYPTION_KEY must be valid base64 or 32 raw bytes"),
            })
        });

        Config {
            graphql_port,
            web_port,
            auth_token,
            datastore_type,
            storage_dir,
            postgres,
            llm_provider,
            llm_api_key,
            llm_model,
            llm_base_url,
            master_encryption_key,
            defaults: ServerDefaults::default(),
        }
    }
}

fn env_port(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}
