//! Model provider contract
//!
//! Concrete provider integrations live outside this crate. The pipeline only
//! needs [`ModelProvider`]: `complete`, `list_models` and `health`. Provider
//! calls are made by [`ModelCallTool`] and always run behind the provider's
//! [`CircuitBreaker`] (the governor routes every tool that declares a
//! provider through [`BreakerRegistry`]).

use crate::tools::{HandlerOutput, InvocationContext, ToolError, ToolHandler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

pub mod circuit_breaker;

pub use circuit_breaker::{
    BreakerPermit, BreakerRegistry, BreakerSummary, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, TrialOutcome,
};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Request to a model provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Model to use (provider default when absent)
    #[serde(default)]
    pub model: Option<String>,

    /// Messages in the conversation
    pub messages: Vec<Message>,

    /// Temperature for generation (0.0-2.0)
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default)]
    pub max_tokens: Option<usize>,

    /// Stop sequences
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl ModelRequest {
    /// Create a simple request from a single prompt
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            messages: vec![Message {
                role: MessageRole::User,
                content: prompt.into(),
            }],
            temperature: None,
            max_tokens: None,
            stop_sequences: Vec::new(),
        }
    }

    /// Create a request with system prompt
    pub fn with_system_prompt(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        let mut request = Self::from_prompt(user_prompt);
        request.messages.insert(
            0,
            Message {
                role: MessageRole::System,
                content: system_prompt.into(),
            },
        );
        request
    }

    /// Builder: set model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builder: set max tokens
    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = Some(tokens);
        self
    }
}

/// Response from a model provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated content
    pub content: String,

    /// Model that produced the content
    pub model: String,

    /// Token usage information
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// Token usage information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Model information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub model_name: String,
}

/// Provider health as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ProviderHealth {
    /// Healthy status
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    /// Unhealthy status with a reason
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Trait for model provider implementations.
///
/// Implementors handle the actual calls (OpenAI, Claude, Ollama, ...). A
/// failed call should return a `TOOL_EXECUTION_FAILED` error; execution
/// failures and timeouts count against the provider's circuit breaker.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider ID, used as the circuit breaker key
    fn id(&self) -> &str;

    /// Generate a completion
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ToolError>;

    /// Models the provider serves
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ToolError>;

    /// Provider health
    async fn health(&self) -> ProviderHealth;
}

/// Stub provider that echoes the last user message.
///
/// Useful for wiring and tests; bring your own provider for real calls.
#[derive(Debug, Clone)]
pub struct StubModelProvider {
    id: String,
}

impl Default for StubModelProvider {
    fn default() -> Self {
        Self::new("stub")
    }
}

impl StubModelProvider {
    /// Create a stub with the given provider ID
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ModelProvider for StubModelProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ToolError> {
        let content = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let tokens = content.split_whitespace().count();
        Ok(ModelResponse {
            content,
            model: request.model.clone().unwrap_or_else(|| "echo".to_string()),
            usage: Some(TokenUsage {
                prompt_tokens: tokens,
                completion_tokens: tokens,
                total_tokens: tokens * 2,
            }),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ToolError> {
        Ok(vec![ModelInfo {
            provider: self.id.clone(),
            model_name: "echo".to_string(),
        }])
    }

    async fn health(&self) -> ProviderHealth {
        ProviderHealth::healthy()
    }
}

/// Input accepted by [`ModelCallTool`]
#[derive(Debug, Clone, Deserialize)]
struct CompletionInput {
    prompt: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    max_tokens: Option<usize>,
}

/// Tool handler that sends a completion request to a provider.
///
/// Input: `{"prompt": ..., "system"?: ..., "model"?: ..., "max_tokens"?: ...}`.
/// Output: `{"content", "model", "usage"}`. The reported cost is the total
/// token count when the provider reports usage.
pub struct ModelCallTool {
    provider: Arc<dyn ModelProvider>,
}

impl std::fmt::Debug for ModelCallTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCallTool")
            .field("provider", &self.provider.id())
            .finish()
    }
}

impl ModelCallTool {
    /// Create a handler for `provider`
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    /// Provider ID
    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }
}

#[async_trait]
impl ToolHandler for ModelCallTool {
    async fn handle(
        &self,
        ctx: &InvocationContext,
        input: Value,
    ) -> Result<HandlerOutput, ToolError> {
        let input: CompletionInput = serde_json::from_value(input)
            .map_err(|e| ToolError::execution(format!("Invalid completion input: {}", e)))?;

        let mut request = match input.system {
            Some(system) => ModelRequest::with_system_prompt(system, input.prompt),
            None => ModelRequest::from_prompt(input.prompt),
        };
        request.model = input.model;
        request.max_tokens = input.max_tokens;

        tracing::debug!(
            provider = %self.provider.id(),
            tenant = %ctx.tenant_id,
            trace_id = %ctx.trace_id,
            "Calling model provider"
        );
        let response = self.provider.complete(&request).await?;

        let output = HandlerOutput::new(json!({
            "content": response.content,
            "model": response.model,
            "usage": response.usage,
        }));
        Ok(match response.usage {
            Some(usage) => output.with_cost(usage.total_tokens as u64),
            None => output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Role;

    #[test]
    fn test_request_builders() {
        let request = ModelRequest::with_system_prompt("be brief", "hello")
            .with_model("small")
            .with_max_tokens(16);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, MessageRole::System);
        assert_eq!(request.messages[1].content, "hello");
        assert_eq!(request.model.as_deref(), Some("small"));
        assert_eq!(request.max_tokens, Some(16));
    }

    #[tokio::test]
    async fn test_stub_provider() {
        let provider = StubModelProvider::default();
        assert_eq!(provider.id(), "stub");
        assert!(provider.health().await.healthy);
        assert_eq!(provider.list_models().await.unwrap().len(), 1);

        let response = provider
            .complete(&ModelRequest::from_prompt("two words"))
            .await
            .unwrap();
        assert_eq!(response.content, "two words");
        assert_eq!(response.usage.unwrap().total_tokens, 4);
    }

    #[tokio::test]
    async fn test_model_call_tool() {
        let tool = ModelCallTool::new(Arc::new(StubModelProvider::default()));
        let ctx = InvocationContext::new("acme", Role::Operator);

        let output = tool
            .handle(&ctx, json!({"prompt": "hi there", "system": "sys"}))
            .await
            .unwrap();
        assert_eq!(output.value["content"], "hi there");
        assert_eq!(output.value["model"], "echo");
        assert_eq!(output.cost, Some(4));

        let err = tool.handle(&ctx, json!({"text": "no prompt"})).await.unwrap_err();
        assert_eq!(err.code, crate::tools::ErrorCode::ToolExecutionFailed);
    }
}
