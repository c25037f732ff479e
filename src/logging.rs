//! Logging module for audit trails
//!
//! Records every tool invocation and turn outcome as a JSON line for
//! auditing and debugging purposes.

use crate::config::LoggingConfig;
use crate::conversation::{ToolCall, TurnOutcome};
use crate::error::InvocationError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{error, warn};
use uuid::Uuid;

/// Session ID for the current process
static SESSION_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

/// Secret patterns for redaction
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // API keys and tokens
        r#"(?i)(api[_-]?key|token|secret|password|passwd|pwd)\s*[=:]\s*['"]?([^'"\s]+)['"]?"#,
        // Bearer tokens
        r"(?i)bearer\s+[a-zA-Z0-9._-]+",
        // AWS keys
        r"AKIA[A-Z0-9]{16}",
        // Private keys
        r"-----BEGIN\s+(?:RSA\s+)?PRIVATE\s+KEY-----",
        // Generic long alphanumeric strings that might be keys
        r"[a-zA-Z0-9_-]{32,}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Log entry structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: LogEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<TurnRecord>,
}

/// Types of log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    ToolSucceeded,
    ToolFailed,
    TurnCompleted,
    TurnCancelled,
}

/// Record of one tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub name: String,
    pub call_id: String,
    pub input_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Record of a finished turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub text_preview: String,
}

/// JSON-lines audit log of tool activity
pub struct AuditLog {
    redact: bool,
    log_file: Option<BufWriter<File>>,
}

impl AuditLog {
    /// Open the audit log described by `config`
    ///
    /// Returns a log that drops every entry when auditing is disabled or
    /// the file cannot be opened.
    pub fn new(config: &LoggingConfig) -> Self {
        let log_file = if config.audit {
            Self::open_log_file(&config.audit_path)
        } else {
            None
        };

        Self {
            redact: config.redact_secrets,
            log_file,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.log_file.is_some()
    }

    /// Open or create the log file
    fn open_log_file(path: &Path) -> Option<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create audit log directory: {}", e);
                return None;
            }
        }

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                error!("Failed to open audit log {:?}: {}", path, e);
                None
            }
        }
    }

    /// Log the outcome of a tool invocation
    pub fn log_tool(
        &mut self,
        call: &ToolCall,
        result: &Result<serde_json::Value, InvocationError>,
        duration_ms: Option<u64>,
    ) {
        if !self.is_enabled() {
            return;
        }

        let input_preview = truncate_preview(&self.redact_if_needed(&call.input.to_string()));
        let (event, output_preview, error_kind, error) = match result {
            Ok(value) => (
                LogEvent::ToolSucceeded,
                Some(truncate_preview(&self.redact_if_needed(&value.to_string()))),
                None,
                None,
            ),
            Err(e) => (
                LogEvent::ToolFailed,
                None,
                Some(e.kind().to_string()),
                Some(self.redact_if_needed(&e.to_string())),
            ),
        };

        let entry = LogEntry {
            session_id: SESSION_ID.clone(),
            timestamp: Utc::now(),
            event,
            tool: Some(ToolRecord {
                name: call.name.clone(),
                call_id: call.id.clone(),
                input_preview,
                output_preview,
                error_kind,
                error,
                duration_ms,
            }),
            turn: None,
        };

        self.write_entry(&entry);
    }

    /// Log how a conversation turn ended
    pub fn log_turn(&mut self, outcome: &TurnOutcome) {
        if !self.is_enabled() {
            return;
        }

        let (event, record) = match outcome {
            TurnOutcome::Completed {
                text,
                finish_reason,
                steps,
            } => (
                LogEvent::TurnCompleted,
                TurnRecord {
                    steps: Some(*steps),
                    finish_reason: Some(format!("{:?}", finish_reason)),
                    text_preview: truncate_preview(&self.redact_if_needed(text)),
                },
            ),
            TurnOutcome::Cancelled { partial_text } => (
                LogEvent::TurnCancelled,
                TurnRecord {
                    steps: None,
                    finish_reason: None,
                    text_preview: truncate_preview(&self.redact_if_needed(partial_text)),
                },
            ),
        };

        let entry = LogEntry {
            session_id: SESSION_ID.clone(),
            timestamp: Utc::now(),
            event,
            tool: None,
            turn: Some(record),
        };

        self.write_entry(&entry);
    }

    /// Write a log entry
    fn write_entry(&mut self, entry: &LogEntry) {
        if let Some(ref mut file) = self.log_file {
            match serde_json::to_string(entry) {
                Ok(json) => {
                    if let Err(e) = writeln!(file, "{}", json) {
                        error!("Failed to write audit entry: {}", e);
                    }
                    if let Err(e) = file.flush() {
                        warn!("Failed to flush audit log: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize audit entry: {}", e);
                }
            }
        }
    }

    fn redact_if_needed(&self, text: &str) -> String {
        if self.redact {
            redact_secrets(text)
        } else {
            text.to_string()
        }
    }

    /// Get session ID
    pub fn session_id() -> &'static str {
        &SESSION_ID
    }
}

/// Redact secrets from text
pub fn redact_secrets(text: &str) -> String {
    let mut result = text.to_string();

    for pattern in SECRET_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    result
}

/// Truncate text for preview
fn truncate_preview(text: &str) -> String {
    const MAX_PREVIEW: usize = 500;
    if text.len() > MAX_PREVIEW {
        let mut end = MAX_PREVIEW;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", &text[..end])
    } else {
        text.to_string()
    }
}
