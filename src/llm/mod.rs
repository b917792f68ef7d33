pub mod prompts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only contract the runtime has with a language model: a conversation
/// in, a tagged reply out. Concrete provider clients live outside this crate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        temperature: f32,
    ) -> Result<LlmReply, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// Tool affordance advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: Value,
}

/// Tagged model reply: a tool invocation, a final object, or a declared
/// failure the caller must treat as non-retryable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LlmReply {
    ToolCall { name: String, arguments: Value },
    FinalObject { value: Value },
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm returned malformed output: {0}")]
    Malformed(String),
}

/// Verdict of the response evaluator over a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseVerdict {
    pub success: bool,
    #[serde(default)]
    pub refactor_needed: bool,
    #[serde(default)]
    pub short_reason: String,
}
