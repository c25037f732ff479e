//! Tool contract
//!
//! A tool is a named, schema-validated async operation the model can
//! invoke. Tools receive an [`ExecutionContext`] carrying the turn's
//! cancellation token and, when a front end is attached, a clarification
//! handler.

mod clarify;
mod invoke;
pub mod schema;

pub use clarify::{ClarifyInput, ClarifyOutput, ClarifyTool, DEFAULT_CLARIFICATION_TIMEOUT_MS};
pub use invoke::invoke;
pub use schema::{Field, InputValidator, Schema, Violation};

use crate::clarification::ClarificationHandler;
use crate::error::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A capability invocable by the model
#[async_trait]
pub trait Tool: Send + Sync {
    /// Default registration name
    fn name(&self) -> &str;

    /// Model-facing documentation; must be non-empty and stable
    fn description(&self) -> &str;

    fn input_schema(&self) -> &Schema;

    /// Run the tool on input that already passed `input_schema()`
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Tool definition handed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn from_tool(name: &str, tool: &dyn Tool) -> Self {
        Self {
            name: name.to_string(),
            description: tool.description().to_string(),
            parameters: tool.input_schema().to_json_schema(),
        }
    }
}

/// Per-invocation context
#[derive(Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    clarifier: Option<Arc<dyn ClarificationHandler>>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("clarifier", &self.clarifier.is_some())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            clarifier: None,
        }
    }

    /// Context with its own token and no clarification handler
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn with_clarifier(mut self, clarifier: Arc<dyn ClarificationHandler>) -> Self {
        self.clarifier = Some(clarifier);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn clarifier(&self) -> Option<&Arc<dyn ClarificationHandler>> {
        self.clarifier.as_ref()
    }
}
