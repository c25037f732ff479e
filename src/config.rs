//! Configuration management for coder-engine
//!
//! Handles loading and merging configuration from multiple sources:
//! 1. Compiled defaults
//! 2. System config (/etc/coder/config.toml)
//! 3. User config (~/.coder/config.toml)
//! 4. Project config (./.coder/config.toml)
//! 5. CLI-specified config file
//! 6. Environment variables

use crate::conversation::DEFAULT_MAX_STEPS;
use crate::error::ConfigError;
use crate::tool::DEFAULT_CLARIFICATION_TIMEOUT_MS;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub plugins: PluginConfig,
    pub clarification: ClarificationConfig,
    pub conversation: ConversationConfig,
    /// Free-form values seeded into the registry config store
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    pub level: String,
    /// Emit log lines as JSON
    pub json: bool,
    /// Record every tool invocation to the audit log
    pub audit: bool,
    /// Audit log file path
    pub audit_path: PathBuf,
    /// Redact secrets from audit entries
    pub redact_secrets: bool,
}

/// Plugin configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Register the built-in plugin
    pub builtin: bool,
    /// Plugins that are registered but never initialized
    pub disabled: Vec<String>,
    /// Reject duplicate tool, service, and protocol names
    pub strict_registration: bool,
}

/// Clarification configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClarificationConfig {
    /// Default wait for an answer; zero or negative waits indefinitely
    pub default_timeout_ms: i64,
}

/// Conversation loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Model steps allowed per turn
    pub max_steps: usize,
}

// Default implementations

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            plugins: PluginConfig::default(),
            clarification: ClarificationConfig::default(),
            conversation: ConversationConfig::default(),
            settings: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            level: "warn".to_string(),
            json: false,
            audit: false,
            audit_path: home.join(".coder/logs/audit.jsonl"),
            redact_secrets: true,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            builtin: true,
            disabled: vec![],
            strict_registration: false,
        }
    }
}

impl Default for ClarificationConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_CLARIFICATION_TIMEOUT_MS,
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(cli_config: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // Load system config
        let system_config = Path::new("/etc/coder/config.toml");
        if system_config.exists() {
            debug!("Loading system config from {:?}", system_config);
            config.merge_from_file(system_config)?;
        }

        // Load user config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".coder/config.toml");
            if user_config.exists() {
                debug!("Loading user config from {:?}", user_config);
                config.merge_from_file(&user_config)?;
            }
        }

        // Load project config
        if let Ok(cwd) = std::env::current_dir() {
            config.load_project_config(&cwd)?;
        }

        // Load CLI-specified config
        if let Some(path) = cli_config {
            debug!("Loading CLI config from {:?}", path);
            config.merge_from_file(path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load and merge project config (.coder/config.toml)
    pub fn load_project_config(&mut self, dir: &Path) -> Result<(), ConfigError> {
        let project_config = dir.join(".coder/config.toml");
        if project_config.exists() {
            debug!("Loading project config from {:?}", project_config);
            self.merge_from_file(&project_config)?;
        }
        Ok(())
    }

    /// Merge configuration from a file
    pub fn merge_from_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let file_config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

        self.merge(file_config);
        Ok(())
    }

    /// Merge another config into this one (other takes precedence)
    fn merge(&mut self, other: Config) {
        let logging = LoggingConfig::default();
        if other.logging.level != logging.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.audit_path != logging.audit_path {
            self.logging.audit_path = other.logging.audit_path;
        }
        self.logging.json |= other.logging.json;
        self.logging.audit |= other.logging.audit;
        if !other.logging.redact_secrets {
            self.logging.redact_secrets = false;
        }

        // Plugins
        if !other.plugins.builtin {
            self.plugins.builtin = false;
        }
        for name in other.plugins.disabled {
            if !self.plugins.disabled.contains(&name) {
                self.plugins.disabled.push(name);
            }
        }
        self.plugins.strict_registration |= other.plugins.strict_registration;

        if other.clarification.default_timeout_ms != DEFAULT_CLARIFICATION_TIMEOUT_MS {
            self.clarification.default_timeout_ms = other.clarification.default_timeout_ms;
        }
        if other.conversation.max_steps != DEFAULT_MAX_STEPS {
            self.conversation.max_steps = other.conversation.max_steps;
        }

        // Settings merge key by key
        self.settings.extend(other.settings);
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("CODER_LOG") {
            self.logging.level = level;
        }
        if let Some(strict) = lookup("CODER_STRICT_PLUGINS") {
            self.plugins.strict_registration = matches!(strict.as_str(), "1" | "true" | "yes");
        }
        if let Some(timeout) = lookup("CODER_CLARIFICATION_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(ms) => self.clarification.default_timeout_ms = ms,
                Err(_) => warn!("Ignoring invalid CODER_CLARIFICATION_TIMEOUT_MS: {}", timeout),
            }
        }
        if let Some(steps) = lookup("CODER_MAX_STEPS") {
            match steps.parse() {
                Ok(n) => self.conversation.max_steps = n,
                Err(_) => warn!("Ignoring invalid CODER_MAX_STEPS: {}", steps),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::MissingField("logging.level".to_string()));
        }
        if self.conversation.max_steps == 0 {
            return Err(ConfigError::Invalid(
                "conversation.max_steps must be at least 1".to_string(),
            ));
        }
        if let Some(name) = self.plugins.disabled.iter().find(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "plugins.disabled contains an empty name: {:?}",
                name
            )));
        }
        Ok(())
    }

    /// Settings with `${VAR}` / `${VAR:-default}` references resolved
    /// against the process environment
    pub fn resolved_settings(&self) -> BTreeMap<String, serde_json::Value> {
        let lookup = |name: &str| std::env::var(name).ok();
        self.settings
            .iter()
            .map(|(key, value)| (key.clone(), resolve_value(value, &lookup)))
            .collect()
    }
}

static VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("variable pattern is valid")
});

/// Substitute `${VAR}` and `${VAR:-default}` in a string
///
/// An empty or unset variable falls back to the default; with no usable
/// default the reference is left as written.
pub fn resolve_variables(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    VARIABLE
        .replace_all(input, |caps: &Captures| {
            let name = caps[1].trim();
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                return value;
            }
            match caps.get(2).map(|m| m.as_str()).filter(|d| !d.is_empty()) {
                Some(default) => default.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve variables in every string nested inside `value`
pub fn resolve_value(
    value: &serde_json::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(resolve_variables(s, lookup)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.clarification.default_timeout_ms, 300_000);
        assert_eq!(config.conversation.max_steps, DEFAULT_MAX_STEPS);
        assert!(config.plugins.builtin);
        assert!(!config.plugins.strict_registration);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_max_steps() {
        let mut config = Config::default();
        config.conversation.max_steps = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [plugins]
            disabled = ["mcp"]
            strict_registration = true

            [clarification]
            default_timeout_ms = 1000

            [settings]
            workspace = "${HOME:-/tmp}"
            limits = { files = 10 }
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.plugins.disabled, vec!["mcp"]);
        assert!(config.plugins.strict_registration);
        assert_eq!(config.clarification.default_timeout_ms, 1000);
        assert_eq!(config.settings["limits"], json!({"files": 10}));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_merge_from_file_layers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[conversation]\nmax_steps = 5\n\n[settings]\nregion = \"eu\""
        )
        .unwrap();

        let mut config = Config::default();
        config.settings.insert("region".to_string(), json!("us"));
        config.settings.insert("team".to_string(), json!("core"));
        config.merge_from_file(file.path()).unwrap();

        assert_eq!(config.conversation.max_steps, 5);
        assert_eq!(config.settings["region"], "eu");
        assert_eq!(config.settings["team"], "core");
    }

    #[test]
    fn test_project_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".coder")).unwrap();
        std::fs::write(
            dir.path().join(".coder/config.toml"),
            "[plugins]\nbuiltin = false\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.load_project_config(dir.path()).unwrap();
        assert!(!config.plugins.builtin);
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[plugins\nbuiltin = ").unwrap();

        let err = Config::default().merge_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("CODER_STRICT_PLUGINS", "true"),
            ("CODER_CLARIFICATION_TIMEOUT_MS", "50"),
            ("CODER_MAX_STEPS", "not-a-number"),
        ]));

        assert!(config.plugins.strict_registration);
        assert_eq!(config.clarification.default_timeout_ms, 50);
        assert_eq!(config.conversation.max_steps, DEFAULT_MAX_STEPS);
    }

    #[test]
    fn test_resolve_variables() {
        let lookup = env(&[("API_HOST", "example.com"), ("EMPTY", "")]);

        assert_eq!(
            resolve_variables("https://${API_HOST}/v1", &lookup),
            "https://example.com/v1"
        );
        assert_eq!(resolve_variables("${PORT:-8080}", &lookup), "8080");
        assert_eq!(resolve_variables("${EMPTY:-fallback}", &lookup), "fallback");
        assert_eq!(resolve_variables("${MISSING}", &lookup), "${MISSING}");
        assert_eq!(resolve_variables("no refs", &lookup), "no refs");
    }

    #[test]
    fn test_resolve_value_recurses() {
        let lookup = env(&[("REGION", "eu")]);
        let value = json!({
            "endpoints": ["${REGION}.api", 3],
            "nested": {"zone": "${ZONE:-a}"},
            "enabled": true
        });

        assert_eq!(
            resolve_value(&value, &lookup),
            json!({
                "endpoints": ["eu.api", 3],
                "nested": {"zone": "a"},
                "enabled": true
            })
        );
    }
}
