//! Built-in `clarify` tool

use super::{ExecutionContext, Field, Schema, Tool};
use crate::clarification::ClarificationRequest;
use crate::error::{ClarificationError, ToolError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Five minutes
pub const DEFAULT_CLARIFICATION_TIMEOUT_MS: i64 = 300_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarifyInput {
    pub question: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub default_answer: Option<String>,
    /// Milliseconds; falls back to the tool's default
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Whole milliseconds for a requested timeout; `<= 0` disables the timer
fn timeout_millis(requested: f64) -> i64 {
    if requested.is_nan() || requested <= 0.0 {
        return 0;
    }
    // Float-to-int `as` saturates at i64::MAX. A positive fraction below
    // one millisecond still gets a timer.
    (requested.trunc() as i64).max(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarifyOutput {
    pub answer: String,
    pub timed_out: bool,
}

/// Ask the user a question through the context's clarification handler
pub struct ClarifyTool {
    default_timeout_ms: i64,
    schema: Schema,
}

impl Default for ClarifyTool {
    fn default() -> Self {
        Self::new(DEFAULT_CLARIFICATION_TIMEOUT_MS)
    }
}

impl ClarifyTool {
    pub fn new(default_timeout_ms: i64) -> Self {
        let schema = Schema::object([
            Field::new("question", Schema::String).describe("The question to ask the user"),
            Field::new("context", Schema::String.optional())
                .describe("Why the question is being asked"),
            Field::new("defaultAnswer", Schema::String.optional())
                .describe("Answer to use if the user does not respond in time"),
            Field::new("timeout", Schema::Number.optional())
                .describe("Milliseconds to wait for an answer"),
        ]);
        Self {
            default_timeout_ms,
            schema,
        }
    }
}

#[async_trait]
impl Tool for ClarifyTool {
    fn name(&self) -> &str {
        "clarify"
    }

    fn description(&self) -> &str {
        "Ask the user a clarifying question and wait for the answer. Use when \
         the request is ambiguous or a decision needs user confirmation."
    }

    fn input_schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ToolError> {
        let input: ClarifyInput =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
        let clarifier = ctx.clarifier().ok_or(ToolError::ClarificationUnavailable)?;
        // A cancelled turn has already flushed the coordinator; asking now
        // would wait out the full timeout.
        if ctx.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        // An empty default answer is no default at all.
        let default_answer = input.default_answer.filter(|answer| !answer.is_empty());
        let timeout = input
            .timeout
            .map(timeout_millis)
            .unwrap_or(self.default_timeout_ms);

        let request = ClarificationRequest::new(&input.question, timeout)
            .with_context(input.context)
            .with_default_answer(default_answer.clone());

        let output = match clarifier.request_clarification(request).await {
            Ok(answer) => ClarifyOutput {
                answer,
                timed_out: false,
            },
            Err(ClarificationError::Timeout(ms)) => match default_answer {
                Some(answer) => {
                    info!("Clarification timed out after {}ms, using default answer", ms);
                    ClarifyOutput {
                        answer,
                        timed_out: true,
                    }
                }
                None => return Err(ClarificationError::Timeout(ms).into()),
            },
            Err(e) => return Err(e.into()),
        };

        serde_json::to_value(output).map_err(|e| ToolError::Other(Box::new(e)))
    }
}
