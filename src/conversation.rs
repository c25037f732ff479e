//! Conversation loop
//!
//! Drives one turn: stream a model step, forward text, run the requested
//! tools, append their results, and repeat until the model stops asking
//! for tools, the turn is aborted, or the step limit is reached.
//!
//! Cancellation never pre-empts a running tool. The loop stops asking the
//! model for new steps, flushes any pending clarification so a tool
//! waiting on the user returns promptly, and waits for the tool to finish.

use crate::clarification::ClarificationCoordinator;
use crate::error::{EngineError, InvocationError, ModelError};
use crate::registry::CapabilityRegistry;
use crate::tool::{invoke, ExecutionContext, ToolDefinition};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default upper bound on model steps per turn
pub const DEFAULT_MAX_STEPS: usize = 25;

const CANCEL_REASON: &str = "conversation turn cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: &str) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(call_id: &str, content: &str) -> Self {
        Self {
            tool_call_id: Some(call_id.to_string()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Ordered message history of a conversation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    messages: Vec<Message>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(prompt: &str) -> Self {
        Self {
            messages: vec![Message::system(prompt)],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Why a model step (or the whole turn) ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    /// The turn hit its step limit with tool calls still outstanding
    MaxSteps,
    Other(String),
}

/// One item of a streamed model step
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCall(ToolCall),
    Finish(FinishReason),
}

/// Input to one model step
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

pub type ModelStream = BoxStream<'static, Result<ModelEvent, ModelError>>;

/// Streaming language model
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ModelError>;
}

type TextCallback = Box<dyn FnMut(&str) + Send>;
type ToolCallCallback = Box<dyn FnMut(&ToolCall) + Send>;
type ToolResultCallback = Box<dyn FnMut(&ToolCall, &Result<Value, InvocationError>) + Send>;
type StepCallback = Box<dyn FnMut(&FinishReason) + Send>;

/// Per-turn abort signal, step limit, and streaming callbacks
pub struct TurnOptions {
    pub abort: CancellationToken,
    pub max_steps: usize,
    pub(crate) on_text: Option<TextCallback>,
    pub(crate) on_tool_call: Option<ToolCallCallback>,
    pub(crate) on_tool_result: Option<ToolResultCallback>,
    pub(crate) on_step_finish: Option<StepCallback>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl std::fmt::Debug for TurnOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOptions")
            .field("aborted", &self.abort.is_cancelled())
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

impl TurnOptions {
    pub fn new(abort: CancellationToken) -> Self {
        Self {
            abort,
            max_steps: DEFAULT_MAX_STEPS,
            on_text: None,
            on_tool_call: None,
            on_tool_result: None,
            on_step_finish: None,
        }
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn on_text(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_text = Some(Box::new(f));
        self
    }

    pub fn on_tool_call(mut self, f: impl FnMut(&ToolCall) + Send + 'static) -> Self {
        self.on_tool_call = Some(Box::new(f));
        self
    }

    pub fn on_tool_result(
        mut self,
        f: impl FnMut(&ToolCall, &Result<Value, InvocationError>) + Send + 'static,
    ) -> Self {
        self.on_tool_result = Some(Box::new(f));
        self
    }

    pub fn on_step_finish(mut self, f: impl FnMut(&FinishReason) + Send + 'static) -> Self {
        self.on_step_finish = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed {
        text: String,
        finish_reason: FinishReason,
        steps: usize,
    },
    Cancelled {
        partial_text: String,
    },
}

/// Tool-result message content for a failed invocation
pub fn error_payload(error: &InvocationError) -> Value {
    let mut body = json!({
        "type": error.kind(),
        "message": error.to_string(),
    });
    match error {
        InvocationError::InvalidInput { violations, .. } => {
            body["violations"] = json!(violations);
        }
        InvocationError::ExecutionFailed { kind, .. } => {
            body["reason"] = json!(kind);
        }
        _ => {}
    }
    json!({ "error": body })
}

fn result_content(result: &Result<Value, InvocationError>) -> String {
    match result {
        Ok(Value::String(s)) => s.clone(),
        Ok(value) => value.to_string(),
        Err(e) => error_payload(e).to_string(),
    }
}

/// Run one conversation turn against `model`
pub async fn run_turn(
    model: &dyn LanguageModel,
    registry: &CapabilityRegistry,
    coordinator: &ClarificationCoordinator,
    context: &mut ConversationContext,
    mut options: TurnOptions,
) -> Result<TurnOutcome, EngineError> {
    let abort = options.abort.clone();
    let clarifier = Arc::new(coordinator.clone());
    let mut text = String::new();
    let mut steps = 0;

    loop {
        if abort.is_cancelled() {
            return Ok(cancelled(coordinator, text));
        }
        if steps >= options.max_steps {
            info!("Turn stopped after {} step(s)", steps);
            return Ok(TurnOutcome::Completed {
                text,
                finish_reason: FinishReason::MaxSteps,
                steps,
            });
        }
        steps += 1;

        let request = ModelRequest {
            messages: context.messages().to_vec(),
            tools: registry.tool_definitions(),
        };
        debug!(
            "Model step {} with {} message(s), {} tool(s)",
            steps,
            request.messages.len(),
            request.tools.len()
        );

        let mut stream = tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(cancelled(coordinator, text)),
            stream = model.stream(request) => stream?,
        };

        let mut step_text = String::new();
        let mut calls = Vec::new();
        let mut finish = None;

        loop {
            let item = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    if !step_text.is_empty() {
                        context.push(Message::assistant(&step_text, Vec::new()));
                    }
                    text.push_str(&step_text);
                    return Ok(cancelled(coordinator, text));
                }
                item = stream.next() => item,
            };

            match item {
                None => break,
                Some(Ok(ModelEvent::TextDelta(delta))) => {
                    if let Some(cb) = options.on_text.as_mut() {
                        cb(&delta);
                    }
                    step_text.push_str(&delta);
                }
                Some(Ok(ModelEvent::ToolCall(call))) => calls.push(call),
                Some(Ok(ModelEvent::Finish(reason))) => finish = Some(reason),
                Some(Err(e)) => {
                    warn!("Model stream failed: {}", e);
                    return Err(e.into());
                }
            }
        }

        let reason = finish.unwrap_or(if calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

        context.push(Message::assistant(&step_text, calls.clone()));
        text.push_str(&step_text);
        if let Some(cb) = options.on_step_finish.as_mut() {
            cb(&reason);
        }

        if calls.is_empty() {
            return Ok(TurnOutcome::Completed {
                text,
                finish_reason: reason,
                steps,
            });
        }

        // Every call gets a result message, even after an abort, so the
        // history stays well-formed for the next turn.
        for call in calls {
            if let Some(cb) = options.on_tool_call.as_mut() {
                cb(&call);
            }

            let ctx = ExecutionContext::new(abort.clone()).with_clarifier(clarifier.clone());
            let invocation = invoke(registry, &call.name, call.input.clone(), &ctx);
            tokio::pin!(invocation);

            let result = tokio::select! {
                biased;
                result = &mut invocation => result,
                _ = abort.cancelled() => {
                    coordinator.cancel(CANCEL_REASON);
                    invocation.await
                }
            };

            if let Some(cb) = options.on_tool_result.as_mut() {
                cb(&call, &result);
            }
            context.push(Message::tool_result(&call.id, &result_content(&result)));
        }
    }
}

fn cancelled(coordinator: &ClarificationCoordinator, partial_text: String) -> TurnOutcome {
    coordinator.cancel(CANCEL_REASON);
    info!("Turn cancelled");
    TurnOutcome::Cancelled { partial_text }
}
