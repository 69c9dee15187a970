//! Language-model and tool capabilities consumed by the engine.
//!
//! The crate does not ship provider adapters; it consumes anything that can
//! stream text through [`LanguageModel::generate_text`]. Callbacks receive
//! `(chunk, full_text)` in stream order. Cancellation is cooperative via the
//! request's token: providers are expected to stop reading and return
//! [`LlmError::Cancelled`] once it fires.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Streaming callback: `(chunk, full_text)` in stream order.
pub type StreamCallback = Box<dyn FnMut(&str, &str) + Send>;

/// Errors from the language-model capability.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    /// The provider reported a failure.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(taskloom::llm::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// The request was cancelled before completion.
    #[error("generation cancelled")]
    #[diagnostic(code(taskloom::llm::cancelled))]
    Cancelled,
}

/// Errors from tool invocation.
#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    /// No tool registered under the requested name.
    #[error("unknown tool: {name}")]
    #[diagnostic(
        code(taskloom::llm::unknown_tool),
        help("Register the tool before wiring it into a node.")
    )]
    Unknown { name: String },

    /// The tool rejected its arguments.
    #[error("invalid tool arguments: {0}")]
    #[diagnostic(code(taskloom::llm::tool_args))]
    InvalidArguments(String),

    /// The tool failed while executing.
    #[error("tool '{name}' failed: {message}")]
    #[diagnostic(code(taskloom::llm::tool_failed))]
    Failed { name: String, message: String },
}

/// A single text-generation request.
pub struct GenerateTextRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub prompt: Option<String>,
    pub temperature: Option<f32>,
    pub cancel: CancellationToken,
    pub on_chunk: Option<StreamCallback>,
    pub on_reasoning: Option<StreamCallback>,
}

impl GenerateTextRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            prompt: None,
            temperature: None,
            cancel: CancellationToken::new(),
            on_chunk: None,
            on_reasoning: None,
        }
    }

    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_on_chunk(mut self, cb: impl FnMut(&str, &str) + Send + 'static) -> Self {
        self.on_chunk = Some(Box::new(cb));
        self
    }

    #[must_use]
    pub fn with_on_reasoning(mut self, cb: impl FnMut(&str, &str) + Send + 'static) -> Self {
        self.on_reasoning = Some(Box::new(cb));
        self
    }
}

impl std::fmt::Debug for GenerateTextRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateTextRequest")
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("prompt", &self.prompt.as_deref().map(str::len))
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Capability: stream a completion and return the final assembled text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_text(&self, request: GenerateTextRequest) -> Result<String, LlmError>;
}

/// Capability: a named function the agent-graph layer can invoke when a
/// node's output indicates a tool call. Results feed back into the node's
/// context as a follow-up message.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}

/// Test double that replays canned responses chunk-by-chunk.
///
/// Each call pops the next queued response and streams it in whitespace-ish
/// slices through `on_chunk` (and `on_reasoning` when a reasoning trace was
/// queued for the call). When the queue runs dry the last response repeats.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    responses: Arc<Mutex<VecDeque<ScriptedTurn>>>,
    last: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone, Debug)]
struct ScriptedTurn {
    text: String,
    reasoning: Option<String>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next call.
    pub fn push_response(&self, text: impl Into<String>) -> &Self {
        self.responses.lock().push_back(ScriptedTurn {
            text: text.into(),
            reasoning: None,
        });
        self
    }

    /// Queue a response preceded by a reasoning trace.
    pub fn push_response_with_reasoning(
        &self,
        text: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> &Self {
        self.responses.lock().push_back(ScriptedTurn {
            text: text.into(),
            reasoning: Some(reasoning.into()),
        });
        self
    }

    /// Prompts observed so far, in call order.
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn stream(text: &str, cb: &mut Option<StreamCallback>) {
        if let Some(cb) = cb.as_mut() {
            let mut full = String::new();
            for piece in split_stream(text) {
                full.push_str(piece);
                cb(piece, &full);
            }
        }
    }
}

/// Split text into small streaming slices, keeping whitespace attached to
/// the preceding word the way providers deliver token runs.
fn split_stream(text: &str) -> Vec<&str> {
    let mut slices = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_space = true;
        } else if in_space {
            slices.push(&text[start..idx]);
            start = idx;
            in_space = false;
        }
    }
    if start < text.len() {
        slices.push(&text[start..]);
    }
    slices
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate_text(&self, mut request: GenerateTextRequest) -> Result<String, LlmError> {
        if request.cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let recorded = request
            .prompt
            .clone()
            .unwrap_or_else(|| {
                request
                    .messages
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default()
            });
        self.calls.lock().push(recorded);

        let turn = self.responses.lock().pop_front();
        let turn = match turn {
            Some(turn) => {
                *self.last.lock() = Some(turn.text.clone());
                turn
            }
            None => ScriptedTurn {
                text: self.last.lock().clone().unwrap_or_default(),
                reasoning: None,
            },
        };

        if let Some(reasoning) = &turn.reasoning {
            Self::stream(reasoning, &mut request.on_reasoning);
        }
        // Yield so cancellation racing the stream is observable.
        tokio::task::yield_now().await;
        if request.cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        Self::stream(&turn.text, &mut request.on_chunk);
        Ok(turn.text)
    }
}
