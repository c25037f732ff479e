//! Per-plugin view of the engine

use crate::error::RegistryError;
use crate::events::{EngineEvent, EventBus};
use crate::registry::{CapabilityRegistry, ProtocolHandler};
use crate::tool::Tool;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use tracing::{info_span, Span};

/// Handle given to every lifecycle hook of one plugin
///
/// All contexts share the same registry and event bus; the context only
/// adds the plugin's identity for logging and event attribution.
#[derive(Clone)]
pub struct PluginContext {
    plugin_name: String,
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.plugin_name)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    pub fn new(plugin_name: &str, registry: Arc<CapabilityRegistry>, events: EventBus) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            registry,
            events,
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Span carrying the plugin name; lifecycle hooks run inside it
    pub fn span(&self) -> Span {
        info_span!("plugin", name = %self.plugin_name)
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn register_tool(&self, name: &str, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        self.registry.register_tool(name, tool)
    }

    /// Register several tools, stopping at the first rejected name
    pub fn register_tools<I>(&self, tools: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = (String, Arc<dyn Tool>)>,
    {
        for (name, tool) in tools {
            self.registry.register_tool(&name, tool)?;
        }
        Ok(())
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.tool(name)
    }

    pub fn require_tool(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        self.registry.require_tool(name)
    }

    pub fn register_service<T>(&self, name: &str, service: Arc<T>) -> Result<(), RegistryError>
    where
        T: Any + Send + Sync,
    {
        self.registry.register_service(name, service)
    }

    pub fn service<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.registry.service(name)
    }

    pub fn require_service<T>(&self, name: &str) -> Result<Arc<T>, RegistryError>
    where
        T: Any + Send + Sync,
    {
        self.registry.require_service(name)
    }

    pub fn register_protocol(
        &self,
        name: &str,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), RegistryError> {
        self.registry.register_protocol(name, handler)
    }

    pub fn protocol(&self, name: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.registry.protocol(name)
    }

    pub fn require_protocol(&self, name: &str) -> Result<Arc<dyn ProtocolHandler>, RegistryError> {
        self.registry.require_protocol(name)
    }

    pub fn config<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.registry.config(key)
    }

    pub fn set_config<T: Serialize>(&self, key: &str, value: T) -> Result<(), RegistryError> {
        self.registry.set_config(key, value)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publish a custom event attributed to this plugin
    pub fn emit(&self, topic: &str, payload: serde_json::Value) -> usize {
        self.events.emit(EngineEvent::Custom {
            source: self.plugin_name.clone(),
            topic: topic.to_string(),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_contexts_share_registry() {
        let registry = Arc::new(CapabilityRegistry::default());
        let events = EventBus::default();
        let a = PluginContext::new("a", registry.clone(), events.clone());
        let b = PluginContext::new("b", registry, events);

        a.register_service("counter", Arc::new(7u64)).unwrap();
        a.set_config("mode", "fast").unwrap();

        assert_eq!(*b.require_service::<u64>("counter").unwrap(), 7);
        assert_eq!(b.config::<String>("mode").as_deref(), Some("fast"));
        assert!(matches!(
            b.require_tool("missing"),
            Err(RegistryError::UnknownTool(_))
        ));
    }

    #[tokio::test]
    async fn test_emit_attributes_source() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let ctx = PluginContext::new("indexer", Arc::default(), events);

        assert_eq!(ctx.emit("indexed", json!({"files": 3})), 1);

        match rx.recv().await.unwrap() {
            EngineEvent::Custom {
                source,
                topic,
                payload,
            } => {
                assert_eq!(source, "indexer");
                assert_eq!(topic, "indexed");
                assert_eq!(payload["files"], 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
