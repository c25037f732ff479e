//! Engine facade
//!
//! One engine owns one capability registry, one plugin manager, one
//! clarification coordinator, and one event bus. Nothing is global, so
//! several engines can coexist in a process.

use crate::clarification::ClarificationCoordinator;
use crate::config::Config;
use crate::conversation::{
    run_turn, ConversationContext, LanguageModel, ToolCall, TurnOptions, TurnOutcome,
};
use crate::error::{EngineError, InvocationError, Result};
use crate::events::EventBus;
use crate::logging::AuditLog;
use crate::plugin::{BuiltinPlugin, Plugin, PluginManager, PluginStatus};
use crate::registry::{CapabilityRegistry, RegistrationPolicy};
use crate::tool::ToolDefinition;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Engine {
    config: Config,
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    coordinator: ClarificationCoordinator,
    plugins: PluginManager,
    audit: Arc<Mutex<AuditLog>>,
    initialized: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("plugins", &self.plugins)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine from `config`, registering the built-in plugin
    /// unless `plugins.builtin` is off
    pub fn new(config: Config) -> Result<Self> {
        let policy = if config.plugins.strict_registration {
            RegistrationPolicy::Strict
        } else {
            RegistrationPolicy::Overwrite
        };
        let registry = Arc::new(CapabilityRegistry::new(policy));
        for (key, value) in config.resolved_settings() {
            registry.set_config(&key, value)?;
        }

        let events = EventBus::default();
        let coordinator = ClarificationCoordinator::with_events(events.clone());
        let mut plugins = PluginManager::new().with_disabled(config.plugins.disabled.clone());
        if config.plugins.builtin {
            plugins.register(Arc::new(BuiltinPlugin::new(
                config.clarification.default_timeout_ms,
            )))?;
        }
        let audit = Arc::new(Mutex::new(AuditLog::new(&config.logging)));

        debug!("Engine created with {:?} registration policy", policy);
        Ok(Self {
            config,
            registry,
            events,
            coordinator,
            plugins,
            audit,
            initialized: false,
        })
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.plugins.register(plugin)?;
        Ok(())
    }

    /// Initialize every registered plugin not yet initialized
    ///
    /// Safe to call repeatedly; plugins registered since the last call are
    /// picked up. Fails only on a dependency cycle.
    pub async fn initialize(&mut self) -> Result<()> {
        self.plugins
            .initialize_all(self.registry.clone(), self.events.clone())
            .await?;
        self.initialized = true;
        info!(
            "Engine initialized with {} tool(s)",
            self.registry.tool_names().len()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Turn options preset from the engine configuration
    pub fn turn_options(&self, abort: CancellationToken) -> TurnOptions {
        TurnOptions::new(abort).max_steps(self.config.conversation.max_steps)
    }

    /// Run one conversation turn
    pub async fn run(
        &self,
        model: &dyn LanguageModel,
        context: &mut ConversationContext,
        options: TurnOptions,
    ) -> Result<TurnOutcome> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }

        let options = self.with_audit(options);
        let outcome = run_turn(model, &self.registry, &self.coordinator, context, options).await?;
        lock(&self.audit).log_turn(&outcome);
        Ok(outcome)
    }

    fn with_audit(&self, mut options: TurnOptions) -> TurnOptions {
        if !lock(&self.audit).is_enabled() {
            return options;
        }

        let started: Arc<Mutex<HashMap<String, Instant>>> = Arc::default();

        let mut on_call = options.on_tool_call.take();
        let starts = started.clone();
        options.on_tool_call = Some(Box::new(move |call: &ToolCall| {
            lock(&starts).insert(call.id.clone(), Instant::now());
            if let Some(cb) = on_call.as_mut() {
                cb(call);
            }
        }));

        let mut on_result = options.on_tool_result.take();
        let audit = self.audit.clone();
        options.on_tool_result = Some(Box::new(
            move |call: &ToolCall, result: &std::result::Result<serde_json::Value, InvocationError>| {
                let elapsed = lock(&started)
                    .remove(&call.id)
                    .map(|t| t.elapsed().as_millis() as u64);
                lock(&audit).log_tool(call, result, elapsed);
                if let Some(cb) = on_result.as_mut() {
                    cb(call, result);
                }
            },
        ));

        options
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.registry.tool_definitions()
    }

    pub fn plugin_status(&self) -> Vec<PluginStatus> {
        self.plugins.status()
    }

    pub fn clarifications(&self) -> &ClarificationCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancel any pending clarification and destroy active plugins
    pub async fn shutdown(&mut self) {
        self.coordinator.cancel("engine shutting down");
        self.plugins.teardown_all().await;
        self.initialized = false;
        info!("Engine shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
