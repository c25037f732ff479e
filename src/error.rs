//! Error types for coder-engine
//!
//! Tool-level and plugin-level failures are reported as data; only
//! [`PluginManagerError::CyclicDependency`] and
//! [`EngineError::NotInitialized`] are fatal to the initiating call.

use crate::registry::CapabilityKind;
use crate::tool::schema::Violation;
use thiserror::Error;

/// Boxed error produced by third-party tool and plugin bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the engine facade
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Plugin error: {0}")]
    Plugins(#[from] PluginManagerError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Capability registry errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Invalid tool '{name}': {reason}")]
    InvalidTool { name: String, reason: String },

    #[error("Duplicate {kind} registration: {name}")]
    Duplicate { kind: CapabilityKind, name: String },

    #[error("Invalid config value for '{key}': {message}")]
    Config { key: String, message: String },
}

/// Clarification coordinator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClarificationError {
    #[error("Another clarification request is already pending")]
    AlreadyPending,

    #[error("Clarification request timed out after {0}ms")]
    Timeout(i64),

    #[error("Clarification request cancelled: {0}")]
    Cancelled(String),
}

/// Errors raised by a tool body
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Clarification is not supported in this context")]
    ClarificationUnavailable,

    #[error(transparent)]
    Clarification(#[from] ClarificationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Tool panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(#[from] BoxError),
}

impl ToolError {
    /// Stable, machine-readable kind reported back to the model
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Failed(_) => "failed",
            ToolError::InvalidArgs(_) => "invalid_args",
            ToolError::Cancelled => "cancelled",
            ToolError::ClarificationUnavailable => "clarification_unavailable",
            ToolError::Clarification(ClarificationError::AlreadyPending) => {
                "clarification_already_pending"
            }
            ToolError::Clarification(ClarificationError::Timeout(_)) => "clarification_timeout",
            ToolError::Clarification(ClarificationError::Cancelled(_)) => {
                "clarification_cancelled"
            }
            ToolError::Registry(_) => "registry",
            ToolError::Panicked(_) => "panic",
            ToolError::Other(_) => "error",
        }
    }
}

/// Errors from the tool invocation contract
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid input for tool '{tool}': {} violation(s)", .violations.len())]
    InvalidInput {
        tool: String,
        violations: Vec<Violation>,
    },

    #[error("Tool '{tool}' failed ({kind}): {message}")]
    ExecutionFailed {
        tool: String,
        kind: &'static str,
        message: String,
        #[source]
        cause: ToolError,
    },

    #[error("Tool '{0}' was cancelled before execution")]
    Cancelled(String),
}

impl InvocationError {
    /// Stable, machine-readable kind reported back to the model
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationError::UnknownTool(_) => "unknown_tool",
            InvocationError::InvalidInput { .. } => "invalid_input",
            InvocationError::ExecutionFailed { .. } => "tool_execution_failed",
            InvocationError::Cancelled(_) => "cancelled",
        }
    }
}

/// Errors raised by a plugin lifecycle hook or protocol handler
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Plugin panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(#[from] BoxError),
}

impl PluginError {
    pub fn msg(message: impl Into<String>) -> Self {
        PluginError::Message(message.into())
    }
}

/// Plugin manager errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginManagerError {
    #[error("Plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("Cyclic plugin dependency among: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

/// Language model collaborator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Request(String),

    #[error("Model stream failed: {0}")]
    Stream(String),
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Render a caught panic payload as text
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_kinds() {
        assert_eq!(ToolError::Failed("x".into()).kind(), "failed");
        assert_eq!(
            ToolError::from(ClarificationError::Timeout(50)).kind(),
            "clarification_timeout"
        );
        assert_eq!(
            ToolError::from(ClarificationError::Cancelled("stop".into())).kind(),
            "clarification_cancelled"
        );
    }

    #[test]
    fn test_cyclic_dependency_message() {
        let err = PluginManagerError::CyclicDependency(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Cyclic plugin dependency among: a, b");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload), "bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload), "unknown panic");
    }
}
