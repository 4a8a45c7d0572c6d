//! Azure OpenAI chat-completions planner.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{AgentPlanner, PlannerError, WorkflowImage};
use crate::config::PlannerConfig;

const DESCRIBE_PROMPT: &str = "You help people develop agent-based workflows based on their process descriptions.
Each node in the workflow should represent an agent.
Describe these agents and what their goals are.
Describe the workflow process for how the agents should be used.";

const GENERATE_PROMPT: &str = "You help people create agentic workflows using the agentflow durable orchestration crate for Rust.
You will be provided with a list of agents, and a sequence in which they should be executed.
You will also be provided with a workflow template.
Use this template to create an agent workflow.
The agent_orchestrator function should be used for agent orchestration.
Each call to an agent should be done using call_activity_typed.
Your code should include an activity for each agent and register every activity and orchestration.
If there is conditional logic in the agent workflow, include it in the agent activity function.

YOUR RESPONSE SHOULD CONSIST OF ONLY RUST CODE.";

const REVIEW_PROMPT: &str = "You will review and improve an agentic workflow built with the agentflow durable orchestration crate for Rust.
Review the code and move any loops in the main orchestration into a separate sub-orchestration or activity.
Ensure that the code is clean and idiomatic.

YOUR RESPONSE SHOULD CONSIST OF ONLY RUST CODE.";

const DESCRIBE_MAX_TOKENS: u32 = 2048;
const SOURCE_MAX_TOKENS: u32 = 4000;

#[derive(Debug, Serialize)]
struct ChatRequest {
    messages: Vec<Value>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct AzureOpenAiPlanner {
    http: reqwest::Client,
    config: PlannerConfig,
}

impl AzureOpenAiPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: PlannerConfig, http: reqwest::Client) -> Self {
        Self { http, config }
    }

    pub fn completions_url(&self) -> String {
        let endpoint = self.config.endpoint.trim_end_matches('/');
        format!(
            "{endpoint}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.deployment, self.config.api_version
        )
    }

    async fn chat(&self, messages: Vec<Value>, max_tokens: u32) -> Result<String, PlannerError> {
        let request = ChatRequest {
            messages,
            temperature: 0.0,
            max_tokens,
        };
        tracing::debug!(
            target: "agentflow::planner",
            deployment = %self.config.deployment,
            max_tokens,
            "chat completion request"
        );
        let response = self
            .http
            .post(self.completions_url())
            .header("api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlannerError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| PlannerError::MalformedResponse(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PlannerError::MalformedResponse("response has no message content".to_string()))
    }
}

/// `error.message` from an Azure error body, else the raw body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl AgentPlanner for AzureOpenAiPlanner {
    async fn describe_agents(&self, image: &WorkflowImage) -> Result<String, PlannerError> {
        let messages = vec![
            json!({ "role": "system", "content": DESCRIBE_PROMPT }),
            json!({
                "role": "user",
                "content": [{
                    "type": "image_url",
                    "image_url": { "url": image.to_data_url(), "detail": "high" }
                }]
            }),
        ];
        self.chat(messages, DESCRIBE_MAX_TOKENS).await
    }

    async fn generate_orchestration_source(
        &self,
        agent_description: &str,
        template_source: &str,
    ) -> Result<String, PlannerError> {
        let messages = vec![
            json!({ "role": "system", "content": format!("{GENERATE_PROMPT}\n\n### TEMPLATE: {template_source}") }),
            json!({ "role": "user", "content": format!("## AGENTS DESCRIPTION: {agent_description}") }),
        ];
        self.chat(messages, SOURCE_MAX_TOKENS).await
    }

    async fn review_orchestration_source(&self, source: &str) -> Result<String, PlannerError> {
        let messages = vec![
            json!({ "role": "system", "content": REVIEW_PROMPT }),
            json!({ "role": "user", "content": format!("## AGENTFLOW AGENTIC WORKFLOW: {source}") }),
        ];
        self.chat(messages, SOURCE_MAX_TOKENS).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> PlannerConfig {
        PlannerConfig {
            endpoint: endpoint.to_string(),
            api_version: "2024-02-01".to_string(),
            api_key: "k".to_string(),
            deployment: "gpt-4o".to_string(),
        }
    }

    #[test]
    fn url_tolerates_trailing_slash() {
        let expected = "https://r.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-02-01";
        assert_eq!(AzureOpenAiPlanner::new(config("https://r.openai.azure.com/")).completions_url(), expected);
        assert_eq!(AzureOpenAiPlanner::new(config("https://r.openai.azure.com")).completions_url(), expected);
    }

    #[test]
    fn error_message_is_extracted() {
        assert_eq!(api_error_message(r#"{"error":{"message":"quota"}}"#), "quota");
        assert_eq!(api_error_message("plain"), "plain");
    }
}
