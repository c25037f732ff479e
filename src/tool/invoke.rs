//! Tool invocation contract
//!
//! Lookup, schema validation, cancellation check, then execution behind a
//! failure boundary. A tool error or panic comes back as
//! [`InvocationError::ExecutionFailed`]; nothing escapes as a fault.

use super::ExecutionContext;
use crate::error::{panic_message, InvocationError, ToolError};
use crate::registry::CapabilityRegistry;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

/// Invoke a registered tool by name
pub async fn invoke(
    registry: &CapabilityRegistry,
    name: &str,
    input: serde_json::Value,
    ctx: &ExecutionContext,
) -> Result<serde_json::Value, InvocationError> {
    let entry = registry
        .registered_tool(name)
        .ok_or_else(|| InvocationError::UnknownTool(name.to_string()))?;
    let tool = entry.tool;

    if let Err(violations) = entry.validator.validate(&input) {
        debug!("Rejected input for tool '{}': {:?}", name, violations);
        return Err(InvocationError::InvalidInput {
            tool: name.to_string(),
            violations,
        });
    }

    if ctx.is_cancelled() {
        debug!("Skipping tool '{}': turn already cancelled", name);
        return Err(InvocationError::Cancelled(name.to_string()));
    }

    debug!("Executing tool '{}'", name);
    let outcome = AssertUnwindSafe(tool.execute(input, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(ToolError::Panicked(panic_message(payload))));

    outcome.map_err(|cause| {
        warn!("Tool '{}' failed: {}", name, cause);
        InvocationError::ExecutionFailed {
            tool: name.to_string(),
            kind: cause.kind(),
            message: cause.to_string(),
            cause,
        }
    })
}
