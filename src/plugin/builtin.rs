//! Built-in plugin
//!
//! Registers the tools every engine ships with.

use super::{Plugin, PluginContext};
use crate::error::PluginError;
use crate::tool::{ClarifyTool, Tool, DEFAULT_CLARIFICATION_TIMEOUT_MS};
use async_trait::async_trait;
use std::sync::Arc;

pub const BUILTIN_PLUGIN_NAME: &str = "coder/built-in";

pub struct BuiltinPlugin {
    clarification_timeout_ms: i64,
}

impl Default for BuiltinPlugin {
    fn default() -> Self {
        Self::new(DEFAULT_CLARIFICATION_TIMEOUT_MS)
    }
}

impl BuiltinPlugin {
    /// `clarification_timeout_ms` is the `clarify` tool's default wait
    pub fn new(clarification_timeout_ms: i64) -> Self {
        Self {
            clarification_timeout_ms,
        }
    }
}

#[async_trait]
impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        BUILTIN_PLUGIN_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let clarify = Arc::new(ClarifyTool::new(self.clarification_timeout_ms));
        ctx.register_tool(clarify.name(), clarify.clone())?;
        Ok(())
    }
}
