//! Capability registry
//!
//! Four independent namespaces (tools, services, protocol handlers, and
//! flat key/value config) owned by one engine instance and shared with
//! every plugin context. Registration under an existing name replaces the
//! previous binding unless the registry runs with
//! [`RegistrationPolicy::Strict`].

use crate::error::{PluginError, RegistryError};
use crate::tool::schema::InputValidator;
use crate::tool::{Tool, ToolDefinition};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Handler for a named message protocol contributed by a plugin
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: serde_json::Value) -> Result<serde_json::Value, PluginError>;
}

/// Registry namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Service,
    Protocol,
    Config,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Service => "service",
            CapabilityKind::Protocol => "protocol",
            CapabilityKind::Config => "config",
        };
        f.write_str(s)
    }
}

/// What happens when a name is registered twice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationPolicy {
    /// Last registration wins
    #[default]
    Overwrite,
    /// Duplicate tool, service, or protocol names are rejected
    Strict,
}

type Service = Arc<dyn Any + Send + Sync>;

/// A tool together with the validator compiled from its input schema
#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub validator: Arc<InputValidator>,
}

/// Process-wide capability maps
pub struct CapabilityRegistry {
    policy: RegistrationPolicy,
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    services: RwLock<HashMap<String, Service>>,
    protocols: RwLock<HashMap<String, Arc<dyn ProtocolHandler>>>,
    config: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(RegistrationPolicy::default())
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("policy", &self.policy)
            .field("tools", &self.tool_names())
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    pub fn new(policy: RegistrationPolicy) -> Self {
        Self {
            policy,
            tools: RwLock::new(BTreeMap::new()),
            services: RwLock::new(HashMap::new()),
            protocols: RwLock::new(HashMap::new()),
            config: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    // Tools

    /// Register a tool under an explicit name
    ///
    /// The tool must carry a non-blank description and an input schema
    /// that compiles; the compiled validator is kept for every invocation.
    pub fn register_tool(&self, name: &str, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidTool {
            name: name.to_string(),
            reason,
        };
        if tool.description().trim().is_empty() {
            return Err(invalid("description must not be empty".to_string()));
        }
        let validator = InputValidator::compile(tool.input_schema()).map_err(invalid)?;

        let mut tools = write(&self.tools);
        self.check_duplicate(CapabilityKind::Tool, name, tools.contains_key(name))?;
        let entry = RegisteredTool {
            tool,
            validator: Arc::new(validator),
        };
        if tools.insert(name.to_string(), entry).is_some() {
            debug!("Replaced tool '{}'", name);
        } else {
            debug!("Registered tool '{}'", name);
        }
        Ok(())
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        read(&self.tools).get(name).map(|entry| entry.tool.clone())
    }

    /// Tool plus its compiled input validator
    pub fn registered_tool(&self, name: &str) -> Option<RegisteredTool> {
        read(&self.tools).get(name).cloned()
    }

    pub fn require_tool(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        self.tool(name)
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub fn has_tool(&self, name: &str) -> bool {
        read(&self.tools).contains_key(name)
    }

    /// Registered tool names in sorted order
    pub fn tool_names(&self) -> Vec<String> {
        read(&self.tools).keys().cloned().collect()
    }

    /// Model-facing definitions of every registered tool
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        read(&self.tools)
            .iter()
            .map(|(name, entry)| ToolDefinition::from_tool(name, entry.tool.as_ref()))
            .collect()
    }

    // Services

    pub fn register_service<T>(&self, name: &str, service: Arc<T>) -> Result<(), RegistryError>
    where
        T: Any + Send + Sync,
    {
        let mut services = write(&self.services);
        self.check_duplicate(CapabilityKind::Service, name, services.contains_key(name))?;
        services.insert(name.to_string(), service);
        debug!("Registered service '{}'", name);
        Ok(())
    }

    /// Look up a service; `None` when absent or registered with another type
    pub fn service<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let service = read(&self.services).get(name).cloned()?;
        service.downcast::<T>().ok()
    }

    pub fn require_service<T>(&self, name: &str) -> Result<Arc<T>, RegistryError>
    where
        T: Any + Send + Sync,
    {
        self.service(name)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))
    }

    // Protocols

    pub fn register_protocol(
        &self,
        name: &str,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), RegistryError> {
        let mut protocols = write(&self.protocols);
        self.check_duplicate(CapabilityKind::Protocol, name, protocols.contains_key(name))?;
        protocols.insert(name.to_string(), handler);
        debug!("Registered protocol '{}'", name);
        Ok(())
    }

    pub fn protocol(&self, name: &str) -> Option<Arc<dyn ProtocolHandler>> {
        read(&self.protocols).get(name).cloned()
    }

    pub fn require_protocol(&self, name: &str) -> Result<Arc<dyn ProtocolHandler>, RegistryError> {
        self.protocol(name)
            .ok_or_else(|| RegistryError::UnknownProtocol(name.to_string()))
    }

    // Config

    /// Read a config value, `None` when absent or not deserializable as `T`
    pub fn config<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = read(&self.config).get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Config values always overwrite, regardless of policy
    pub fn set_config<T: Serialize>(&self, key: &str, value: T) -> Result<(), RegistryError> {
        let value = serde_json::to_value(value).map_err(|e| RegistryError::Config {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        write(&self.config).insert(key.to_string(), value);
        Ok(())
    }

    pub fn config_keys(&self) -> Vec<String> {
        read(&self.config).keys().cloned().collect()
    }

    fn check_duplicate(
        &self,
        kind: CapabilityKind,
        name: &str,
        exists: bool,
    ) -> Result<(), RegistryError> {
        if exists && self.policy == RegistrationPolicy::Strict {
            return Err(RegistryError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

// A panic while holding a registry lock leaves the maps consistent (every
// mutation is a single insert), so poisoning is ignored.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
