//! Plugin lifecycle manager
//!
//! Orders plugins with Kahn's algorithm (ties broken by registration
//! order), runs `before_initialize`, `initialize`, `after_initialize` for
//! each, and destroys active plugins in reverse initialization order.
//! Hook failures and panics mark the plugin as failed and never abort the
//! remaining plugins; only a dependency cycle is fatal.

use super::{Plugin, PluginContext};
use crate::error::{panic_message, PluginError, PluginManagerError};
use crate::events::{EngineEvent, EventBus};
use crate::registry::CapabilityRegistry;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Lifecycle state of a registered plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Registered,
    Active,
    Failed,
    /// Not initialized because a dependency is missing or inactive
    Skipped,
    Disabled,
    Destroyed,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Registered => "registered",
            PluginState::Active => "active",
            PluginState::Failed => "failed",
            PluginState::Skipped => "skipped",
            PluginState::Disabled => "disabled",
            PluginState::Destroyed => "destroyed",
        };
        f.pad(s)
    }
}

/// Reported status of one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub state: PluginState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    dependencies: Vec<String>,
    status: PluginStatus,
    ctx: Option<PluginContext>,
}

impl Entry {
    fn transition(&mut self, state: PluginState, error: Option<String>) {
        self.status.state = state;
        self.status.error = error;
        self.status.updated_at = Utc::now();
    }
}

/// Owns registered plugins and drives their lifecycle
#[derive(Default)]
pub struct PluginManager {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    disabled: HashSet<String>,
    init_order: Vec<usize>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.names())
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugins with these names are never initialized
    pub fn with_disabled<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginManagerError> {
        let name = plugin.name().to_string();
        if self.index.contains_key(&name) {
            return Err(PluginManagerError::DuplicatePlugin(name));
        }

        let mut dependencies = Vec::new();
        for dep in plugin.dependencies() {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        debug!("Registered plugin '{}' v{}", name, plugin.version());
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push(Entry {
            status: PluginStatus {
                name,
                version: plugin.version().to_string(),
                state: PluginState::Registered,
                error: None,
                updated_at: Utc::now(),
            },
            plugin,
            dependencies,
            ctx: None,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plugin names in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.status.name.clone()).collect()
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.index.get(name).map(|&i| self.entries[i].plugin.clone())
    }

    /// Status of every plugin in registration order
    pub fn status(&self) -> Vec<PluginStatus> {
        self.entries.iter().map(|e| e.status.clone()).collect()
    }

    /// Plugin names in the order they were initialized
    pub fn initialization_order(&self) -> Vec<String> {
        self.init_order
            .iter()
            .map(|&i| self.entries[i].status.name.clone())
            .collect()
    }

    /// Compute a dependency-respecting order over all plugins
    ///
    /// Dependencies on unregistered plugins are ignored here; they are
    /// reported when the dependent is about to initialize.
    pub fn resolve_order(&self) -> Result<Vec<usize>, PluginManagerError> {
        let n = self.entries.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, entry) in self.entries.iter().enumerate() {
            for dep in &entry.dependencies {
                if let Some(&d) = self.index.get(dep) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        if order.len() < n {
            let stuck: Vec<String> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.entries[i].status.name.clone())
                .collect();
            return Err(PluginManagerError::CyclicDependency(stuck));
        }

        Ok(order)
    }

    /// Initialize every registered plugin in dependency order
    ///
    /// Plugins already processed by an earlier call are left alone.
    pub async fn initialize_all(
        &mut self,
        registry: Arc<CapabilityRegistry>,
        events: EventBus,
    ) -> Result<(), PluginManagerError> {
        let order = self.resolve_order()?;
        info!("Initializing {} plugin(s)", order.len());

        for i in order {
            if self.entries[i].status.state != PluginState::Registered {
                continue;
            }

            let name = self.entries[i].status.name.clone();

            if self.disabled.contains(&name) {
                info!("Plugin '{}' is disabled", name);
                self.entries[i].transition(PluginState::Disabled, None);
                events.emit(EngineEvent::PluginSkipped {
                    name,
                    reason: "disabled".to_string(),
                });
                continue;
            }

            if let Some(reason) = self.blocked_by(i) {
                warn!("Skipping plugin '{}': {}", name, reason);
                self.entries[i].transition(PluginState::Skipped, Some(reason.clone()));
                events.emit(EngineEvent::PluginSkipped { name, reason });
                continue;
            }

            let plugin = self.entries[i].plugin.clone();
            let ctx = PluginContext::new(&name, registry.clone(), events.clone());
            let result = initialize_plugin(plugin.as_ref(), &ctx)
                .instrument(ctx.span())
                .await;
            self.entries[i].ctx = Some(ctx);

            match result {
                Ok(()) => {
                    info!("Plugin '{}' v{} active", name, plugin.version());
                    self.entries[i].transition(PluginState::Active, None);
                    self.init_order.push(i);
                    events.emit(EngineEvent::PluginActivated {
                        name,
                        version: plugin.version().to_string(),
                    });
                }
                Err(reason) => {
                    warn!("Plugin '{}' failed to initialize: {}", name, reason);
                    self.entries[i].transition(PluginState::Failed, Some(reason.clone()));
                    events.emit(EngineEvent::PluginFailed { name, reason });
                }
            }
        }

        Ok(())
    }

    /// Destroy active plugins in reverse initialization order
    pub async fn teardown_all(&mut self) {
        let order: Vec<usize> = self.init_order.drain(..).rev().collect();
        for i in order {
            if self.entries[i].status.state != PluginState::Active {
                continue;
            }
            let Some(ctx) = self.entries[i].ctx.clone() else {
                continue;
            };

            let plugin = self.entries[i].plugin.clone();
            let name = self.entries[i].status.name.clone();
            let result = guarded(plugin.destroy(&ctx)).instrument(ctx.span()).await;

            let error = match result {
                Ok(()) => {
                    debug!("Plugin '{}' destroyed", name);
                    None
                }
                Err(e) => {
                    warn!("Plugin '{}' failed to shut down cleanly: {}", name, e);
                    Some(format!("destroy: {}", e))
                }
            };
            self.entries[i].transition(PluginState::Destroyed, error);
            ctx.events().emit(EngineEvent::PluginDestroyed { name });
        }
    }

    fn blocked_by(&self, i: usize) -> Option<String> {
        self.entries[i].dependencies.iter().find_map(|dep| {
            match self.index.get(dep) {
                None => Some(format!("missing dependency '{}'", dep)),
                Some(&d) => {
                    let state = self.entries[d].status.state;
                    (state != PluginState::Active)
                        .then(|| format!("dependency '{}' is {}", dep, state))
                }
            }
        })
    }
}

async fn initialize_plugin(plugin: &dyn Plugin, ctx: &PluginContext) -> Result<(), String> {
    guarded(plugin.before_initialize(ctx))
        .await
        .map_err(|e| format!("before_initialize: {}", e))?;
    guarded(plugin.initialize(ctx))
        .await
        .map_err(|e| format!("initialize: {}", e))?;
    guarded(plugin.after_initialize(ctx))
        .await
        .map_err(|e| format!("after_initialize: {}", e))
}

/// Run a hook, turning a panic into `PluginError::Panicked`
async fn guarded<F>(hook: F) -> Result<(), PluginError>
where
    F: Future<Output = Result<(), PluginError>>,
{
    AssertUnwindSafe(hook)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(PluginError::Panicked(panic_message(payload))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy, PartialEq)]
    enum Fault {
        None,
        FailInit,
        FailAfter,
        PanicInit,
        FailDestroy,
    }

    struct Recorder {
        name: String,
        deps: Vec<String>,
        fault: Fault,
        log: Log,
    }

    impl Recorder {
        fn new(name: &str, deps: &[&str], fault: Fault, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                fault,
                log: log.clone(),
            })
        }

        fn record(&self, hook: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", hook, self.name));
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        async fn before_initialize(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
            self.record("before");
            Ok(())
        }

        async fn initialize(&self, ctx: &PluginContext) -> Result<(), PluginError> {
            self.record("init");
            match self.fault {
                Fault::FailInit => Err(PluginError::msg("boom")),
                Fault::PanicInit => panic!("init exploded"),
                _ => {
                    ctx.set_config(&format!("{}.ready", self.name), true)?;
                    Ok(())
                }
            }
        }

        async fn after_initialize(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
            self.record("after");
            if self.fault == Fault::FailAfter {
                return Err(PluginError::msg("late failure"));
            }
            Ok(())
        }

        async fn destroy(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
            self.record("destroy");
            if self.fault == Fault::FailDestroy {
                return Err(PluginError::msg("stuck"));
            }
            Ok(())
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn position(log: &[String], item: &str) -> usize {
        log.iter()
            .position(|l| l == item)
            .unwrap_or_else(|| panic!("'{item}' not in {log:?}"))
    }

    fn state_of(manager: &PluginManager, name: &str) -> PluginState {
        manager
            .status()
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.state)
            .unwrap()
    }

    async fn init(manager: &mut PluginManager) -> Result<Arc<CapabilityRegistry>, PluginManagerError> {
        let registry = Arc::new(CapabilityRegistry::default());
        manager
            .initialize_all(registry.clone(), EventBus::default())
            .await?;
        Ok(registry)
    }

    #[tokio::test]
    async fn test_dependency_initializes_first() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("a", &["b"], Fault::None, &log)).unwrap();
        manager.register(Recorder::new("b", &[], Fault::None, &log)).unwrap();

        init(&mut manager).await.unwrap();

        let log = entries(&log);
        assert!(position(&log, "after:b") < position(&log, "before:a"));
        assert_eq!(manager.initialization_order(), vec!["b", "a"]);
        assert_eq!(state_of(&manager, "a"), PluginState::Active);
    }

    #[tokio::test]
    async fn test_ties_follow_registration_order() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        for name in ["c", "a", "b"] {
            manager.register(Recorder::new(name, &[], Fault::None, &log)).unwrap();
        }

        init(&mut manager).await.unwrap();
        assert_eq!(manager.initialization_order(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_layered_graph_orders_every_edge() {
        // Diamond (root -> left/right -> join) feeding a chain, with a cross
        // edge and an unrelated pair, registered dependents-first.
        let graph: &[(&str, &[&str])] = &[
            ("tail", &["chain2", "left"]),
            ("chain2", &["chain1"]),
            ("island_b", &["island_a"]),
            ("chain1", &["join"]),
            ("join", &["left", "right"]),
            ("right", &["root"]),
            ("left", &["root"]),
            ("island_a", &[]),
            ("root", &[]),
        ];
        let log = Log::default();
        let mut manager = PluginManager::new();
        for (name, deps) in graph {
            manager.register(Recorder::new(name, deps, Fault::None, &log)).unwrap();
        }

        init(&mut manager).await.unwrap();

        let order = manager.initialization_order();
        assert_eq!(order.len(), graph.len());
        let log = entries(&log);
        for (name, deps) in graph {
            assert_eq!(state_of(&manager, name), PluginState::Active);
            let at = order.iter().position(|n| n == name).unwrap();
            for dep in *deps {
                let dep_at = order.iter().position(|n| n == dep).unwrap();
                assert!(dep_at < at, "'{dep}' must precede '{name}' in {order:?}");
                assert!(
                    position(&log, &format!("after:{dep}")) < position(&log, &format!("before:{name}"))
                );
            }
        }
    }

    #[tokio::test]
    async fn test_cycle_runs_no_hooks() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("free", &[], Fault::None, &log)).unwrap();
        manager.register(Recorder::new("a", &["b"], Fault::None, &log)).unwrap();
        manager.register(Recorder::new("b", &["a"], Fault::None, &log)).unwrap();

        let err = init(&mut manager).await.unwrap_err();

        assert_eq!(
            err,
            PluginManagerError::CyclicDependency(vec!["a".to_string(), "b".to_string()])
        );
        assert!(entries(&log).is_empty());
        assert_eq!(state_of(&manager, "free"), PluginState::Registered);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("base", &[], Fault::FailInit, &log)).unwrap();
        manager.register(Recorder::new("mid", &["base"], Fault::None, &log)).unwrap();
        manager.register(Recorder::new("top", &["mid"], Fault::None, &log)).unwrap();
        manager.register(Recorder::new("solo", &[], Fault::None, &log)).unwrap();

        let registry = init(&mut manager).await.unwrap();

        let log = entries(&log);
        assert!(!log.iter().any(|l| l.ends_with(":mid") || l.ends_with(":top")));
        assert_eq!(state_of(&manager, "base"), PluginState::Failed);
        assert_eq!(state_of(&manager, "mid"), PluginState::Skipped);
        assert_eq!(state_of(&manager, "top"), PluginState::Skipped);
        assert_eq!(state_of(&manager, "solo"), PluginState::Active);
        assert_eq!(registry.config::<bool>("solo.ready"), Some(true));

        let base = manager.status().into_iter().find(|s| s.name == "base").unwrap();
        assert_eq!(base.error.as_deref(), Some("initialize: boom"));
    }

    #[tokio::test]
    async fn test_missing_dependency_skips_plugin() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("a", &["ghost"], Fault::None, &log)).unwrap();

        init(&mut manager).await.unwrap();

        let status = &manager.status()[0];
        assert_eq!(status.state, PluginState::Skipped);
        assert_eq!(status.error.as_deref(), Some("missing dependency 'ghost'"));
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn test_after_initialize_failure_marks_failed() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("a", &[], Fault::FailAfter, &log)).unwrap();

        init(&mut manager).await.unwrap();
        assert_eq!(state_of(&manager, "a"), PluginState::Failed);

        manager.teardown_all().await;
        assert!(!entries(&log).contains(&"destroy:a".to_string()));
    }

    #[tokio::test]
    async fn test_panicking_hook_is_isolated() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("bad", &[], Fault::PanicInit, &log)).unwrap();
        manager.register(Recorder::new("good", &[], Fault::None, &log)).unwrap();

        init(&mut manager).await.unwrap();

        let bad = manager.status().into_iter().find(|s| s.name == "bad").unwrap();
        assert_eq!(bad.state, PluginState::Failed);
        assert!(bad.error.unwrap().contains("init exploded"));
        assert_eq!(state_of(&manager, "good"), PluginState::Active);
    }

    #[tokio::test]
    async fn test_disabled_plugin_and_dependents() {
        let log = Log::default();
        let mut manager = PluginManager::new().with_disabled(["a"]);
        manager.register(Recorder::new("a", &[], Fault::None, &log)).unwrap();
        manager.register(Recorder::new("b", &["a"], Fault::None, &log)).unwrap();

        init(&mut manager).await.unwrap();

        assert_eq!(state_of(&manager, "a"), PluginState::Disabled);
        assert_eq!(state_of(&manager, "b"), PluginState::Skipped);
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_reverse_order_survives_failures() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("a", &[], Fault::None, &log)).unwrap();
        manager.register(Recorder::new("b", &["a"], Fault::FailDestroy, &log)).unwrap();
        manager.register(Recorder::new("c", &["b"], Fault::None, &log)).unwrap();

        init(&mut manager).await.unwrap();
        log.lock().unwrap().clear();

        manager.teardown_all().await;

        assert_eq!(entries(&log), vec!["destroy:c", "destroy:b", "destroy:a"]);
        assert!(manager
            .status()
            .iter()
            .all(|s| s.state == PluginState::Destroyed));

        // Nothing left to destroy the second time.
        manager.teardown_all().await;
        assert_eq!(entries(&log).len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let log = Log::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("a", &[], Fault::None, &log)).unwrap();

        let err = manager
            .register(Recorder::new("a", &[], Fault::None, &log))
            .unwrap_err();
        assert_eq!(err, PluginManagerError::DuplicatePlugin("a".to_string()));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let log = Log::default();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("ok", &[], Fault::None, &log)).unwrap();
        manager.register(Recorder::new("bad", &[], Fault::FailInit, &log)).unwrap();

        manager
            .initialize_all(Arc::default(), events.clone())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::PluginActivated { ref name, .. } if name == "ok"
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::PluginFailed { ref name, .. } if name == "bad"
        ));
    }

    #[tokio::test]
    async fn test_late_registration_initializes_on_next_call() {
        let log = Log::default();
        let registry = Arc::new(CapabilityRegistry::default());
        let events = EventBus::default();
        let mut manager = PluginManager::new();
        manager.register(Recorder::new("a", &[], Fault::None, &log)).unwrap();
        manager
            .initialize_all(registry.clone(), events.clone())
            .await
            .unwrap();

        manager.register(Recorder::new("b", &["a"], Fault::None, &log)).unwrap();
        manager.initialize_all(registry, events).await.unwrap();

        assert_eq!(entries(&log).iter().filter(|l| *l == "init:a").count(), 1);
        assert_eq!(manager.initialization_order(), vec!["a", "b"]);
    }
}
