//! Tool contract.
//!
//! Tools declare a name, parameter schema, and permission footprint up
//! front; the runtime never invokes a tool outside its declared footprint.
//! Implementations (file I/O, git, linters) live outside the crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::ToolError;
use crate::llm::ToolSpec;

/// Declared side-effect surface of a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionFootprint {
    pub filesystem: bool,
    pub network: bool,
    pub exec: bool,
}

impl PermissionFootprint {
    /// A tool with no declared side effects.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn filesystem() -> Self {
        Self {
            filesystem: true,
            ..Self::default()
        }
    }

    pub fn with_network(mut self) -> Self {
        self.network = true;
        self
    }

    pub fn with_exec(mut self) -> Self {
        self.exec = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.filesystem && !self.network && !self.exec
    }
}

/// Contract every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool's parameters.
    fn parameters(&self) -> Value;

    fn permissions(&self) -> PermissionFootprint;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        context: &mut Context,
        args: Value,
    ) -> Result<Value, ToolError>;
}

/// Convert registered tools into the [`ToolSpec`] list handed to the model.
pub fn tool_specs(tools: &[Arc<dyn Tool>]) -> Vec<ToolSpec> {
    tools
        .iter()
        .map(|tool| ToolSpec {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
        })
        .collect()
}
