//! coder-engine: an extensible agent runtime
//!
//! Plugins register tools, services, protocol handlers, and config into a
//! shared [`CapabilityRegistry`]; the conversation loop streams model
//! steps and invokes tools through a validated, failure-isolated contract;
//! tools can ask the user questions through the [`ClarificationCoordinator`].

pub mod clarification;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod plugin;
pub mod registry;
pub mod tool;

pub use clarification::{
    ClarificationCoordinator, ClarificationHandler, ClarificationRequest, PendingAnswer,
};
pub use config::Config;
pub use conversation::{
    run_turn, ConversationContext, FinishReason, LanguageModel, Message, ModelEvent,
    ModelRequest, ModelStream, Role, ToolCall, TurnOptions, TurnOutcome,
};
pub use engine::Engine;
pub use error::{
    ClarificationError, EngineError, InvocationError, ModelError, PluginError,
    PluginManagerError, RegistryError, ToolError,
};
pub use events::{EngineEvent, EventBus};
pub use plugin::{Plugin, PluginContext, PluginManager, PluginState, PluginStatus};
pub use registry::{
    CapabilityKind, CapabilityRegistry, ProtocolHandler, RegisteredTool, RegistrationPolicy,
};
pub use tool::{invoke, ExecutionContext, Field, Schema, Tool, ToolDefinition};

/// Re-exported so plugin authors need not depend on tokio-util directly
pub use tokio_util::sync::CancellationToken;
