//! Plugin system for coder-engine
//!
//! Plugins extend the engine by registering tools, services, protocol
//! handlers, and config values through their [`PluginContext`] during the
//! lifecycle hooks. The [`PluginManager`] runs the hooks in dependency
//! order and tears plugins down in reverse.

mod builtin;
mod context;
mod manager;

pub use builtin::{BuiltinPlugin, BUILTIN_PLUGIN_NAME};
pub use context::PluginContext;
pub use manager::{PluginManager, PluginState, PluginStatus};

use crate::error::PluginError;
use async_trait::async_trait;

/// An extension unit with a name/version identity and a lifecycle
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Names of plugins that must be active before this one initializes
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn before_initialize(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn initialize(&self, ctx: &PluginContext) -> Result<(), PluginError>;

    async fn after_initialize(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn destroy(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }
}
