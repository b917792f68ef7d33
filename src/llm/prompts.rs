use serde_json::json;

use crate::llm::ToolSpec;
use crate::models::api::ApiConfig;

pub const SEARCH_DOCUMENTATION_TOOL: &str = "searchDocumentation";
pub const SUBMIT_TOOL: &str = "submit";

pub fn repair_system_prompt() -> String {
    "You are an API configuration engineer. A configured API call is failing. \
     Diagnose the failure from the error message and the integration \
     documentation, then repair the configuration.\n\n\
     Rules:\n\
     - Keep the original intent of the instruction.\n\
     - Reference credentials as placeholders like {credential_name}; never \
       invent credential values.\n\
     - Use the searchDocumentation tool to look up endpoints, parameters, \
       and auth requirements as often as you need.\n\
     - When you are confident, call submit with the complete corrected \
       configuration.\n\
     - If the failure cannot be fixed by changing the configuration (for \
       example the credentials are refused), reply with an error instead."
        .to_string()
}

/// The context block sent once per repair attempt: current config, endpoint
/// guidance, sampled payload, and the names (never values) of available
/// credentials.
pub fn repair_context(
    config: &ApiConfig,
    specific_instructions: Option<&str>,
    documentation_excerpt: &str,
    payload_sample: &str,
    credential_names: &[String],
) -> String {
    let config_json =
        serde_json::to_string_pretty(config).unwrap_or_else(|_| "<unserializable>".to_string());
    let mut out = format!(
        "Current configuration:\n{config_json}\n\nInstruction: {}\n",
        config.instruction
    );
    if let Some(instructions) = specific_instructions {
        if !instructions.trim().is_empty() {
            out.push_str(&format!("\nIntegration notes:\n{instructions}\n"));
        }
    }
    if !documentation_excerpt.trim().is_empty() {
        out.push_str(&format!("\nRelevant documentation:\n{documentation_excerpt}\n"));
    }
    if !payload_sample.trim().is_empty() {
        out.push_str(&format!("\nSample payload:\n{payload_sample}\n"));
    }
    if !credential_names.is_empty() {
        out.push_str(&format!(
            "\nAvailable credential placeholders: {}\n",
            credential_names.join(", ")
        ));
    }
    out
}

pub fn evaluator_prompt(data_sample: &str, instruction: &str, documentation_excerpt: &str) -> String {
    let mut out = format!(
        "Judge whether this API response satisfies the instruction.\n\n\
         Instruction: {instruction}\n\nResponse sample:\n{data_sample}\n"
    );
    if !documentation_excerpt.trim().is_empty() {
        out.push_str(&format!("\nDocumentation:\n{documentation_excerpt}\n"));
    }
    out.push_str(
        "\nAnswer with a JSON object: {\"success\": bool, \"refactorNeeded\": bool, \
         \"shortReason\": string}. Mark success=false only when the response \
         cannot serve the instruction.",
    );
    out
}

pub fn repair_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: SEARCH_DOCUMENTATION_TOOL.to_string(),
            description: "Search the integration documentation for endpoints, parameters, \
                          pagination, and authentication details."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "search terms"}
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: SUBMIT_TOOL.to_string(),
            description: "Submit the corrected API configuration.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "config": {"type": "object", "description": "the full repaired ApiConfig"}
                },
                "required": ["config"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_context_lists_credentials_by_name_only() {
        let config = ApiConfig {
            id: "c1".into(),
            url_host: "https://api.example.com".into(),
            instruction: "list invoices".into(),
            ..Default::default()
        };
        let context = repair_context(
            &config,
            Some("use the v2 API"),
            "GET /v2/invoices",
            "{\"month\": 1}",
            &["api_key".to_string()],
        );
        assert!(context.contains("list invoices"));
        assert!(context.contains("use the v2 API"));
        assert!(context.contains("api_key"));
        assert!(context.contains("GET /v2/invoices"));
    }

    #[test]
    fn repair_tools_expose_search_and_submit() {
        let tools = repair_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec![SEARCH_DOCUMENTATION_TOOL, SUBMIT_TOOL]);
    }
}
