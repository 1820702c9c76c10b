//! Language model contract.
//!
//! The runtime never speaks a provider wire format. Compression, observation
//! nodes, and delegates consume this trait; adapters for concrete backends
//! live outside the crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::{Interaction, TokenUsage};
use crate::error::ModelError;

/// Recognized generation options. Unset fields defer to provider defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }
}

/// Declared tool surface passed to `chat_with_tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's parameters.
    pub parameters: Value,
}

/// Structured tool-call request returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Model output: text plus optional structured tool-call requests.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Contract for the model backend.
///
/// The cancellation token must cause in-flight calls to return promptly
/// with [`ModelError::Cancelled`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One-shot text generation from a single prompt.
    async fn generate(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError>;

    /// Multi-turn chat with a declared tool surface.
    async fn chat_with_tools(
        &self,
        cancel: &CancellationToken,
        messages: &[Interaction],
        tools: &[ToolSpec],
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError>;

    /// Provider name, for logging only.
    fn name(&self) -> &str;
}
