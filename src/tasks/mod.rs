//! Concrete workflow tasks built on the engine primitives.
//!
//! The library covers a research-style pipeline: refine the query, search
//! the web, analyze the sources, write the answer, reflect on it and loop
//! back for revision, then suggest follow-ups. Tasks communicate through
//! the typed context keys in [`keys`] and emit on the wire channels.

mod analyzer;
mod completion;
mod graph_runner;
mod planning;
mod refine_query;
mod reflector;
mod search;
mod suggestions;
mod writer;

pub use analyzer::AnalyzerTask;
pub use completion::CompletionTask;
pub use graph_runner::GraphRunnerTask;
pub use planning::PlanningTask;
pub use refine_query::RefineQueryTask;
pub use reflector::ReflectorTask;
pub use search::WebSearchTask;
pub use suggestions::SuggestionsTask;
pub use writer::WriterTask;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::chunk::ChunkBuffer;
use crate::engine::TaskError;
use crate::event_bus::{channels, AnswerPayload, EventBus, SourceItem};
use crate::llm::{GenerateTextRequest, LanguageModel};
use crate::message::Message;

/// Context keys shared by the task library.
pub mod keys {
    use crate::context::ContextKey;
    use crate::event_bus::SourceItem;

    pub const QUERY: ContextKey<String> = ContextKey::new("query");
    pub const REFINED_QUERY: ContextKey<String> = ContextKey::new("refinedQuery");
    pub const PLAN: ContextKey<String> = ContextKey::new("plan");
    pub const SOURCES: ContextKey<Vec<SourceItem>> = ContextKey::new("sources");
    pub const ANALYSIS: ContextKey<String> = ContextKey::new("analysis");
    pub const ANSWER: ContextKey<String> = ContextKey::new("answer");
    pub const FEEDBACK: ContextKey<String> = ContextKey::new("feedback");
}

/// Streaming flush threshold shared by the streaming tasks.
const STREAM_THRESHOLD: usize = 96;

/// Generate text while streaming partial answers onto the `answer` channel.
pub(crate) async fn stream_answer(
    model: &Arc<dyn LanguageModel>,
    model_name: &str,
    events: &EventBus,
    cancel: CancellationToken,
    system: &str,
    prompt: String,
) -> Result<String, TaskError> {
    let bus = events.clone();
    let buffer = Arc::new(Mutex::new(ChunkBuffer::new(
        STREAM_THRESHOLD,
        vec![". ".to_string(), "\n".to_string()],
        move |_chunk, full| {
            let _ = bus.emit(&channels::ANSWER, &AnswerPayload::partial(full));
        },
    )));
    let stream_buffer = buffer.clone();

    let request = GenerateTextRequest::new(model_name)
        .with_messages(vec![Message::system(system)])
        .with_prompt(prompt)
        .with_cancel(cancel)
        .with_on_chunk(move |chunk, _full| stream_buffer.lock().push(chunk));

    let text = model.generate_text(request).await?;
    buffer.lock().end();
    Ok(text)
}

/// Generate text without streaming events (planner-style internal calls).
pub(crate) async fn generate(
    model: &Arc<dyn LanguageModel>,
    model_name: &str,
    cancel: CancellationToken,
    system: &str,
    prompt: String,
) -> Result<String, TaskError> {
    let request = GenerateTextRequest::new(model_name)
        .with_messages(vec![Message::system(system)])
        .with_prompt(prompt)
        .with_cancel(cancel);
    Ok(model.generate_text(request).await?)
}

/// Render sources into a prompt-friendly digest.
pub(crate) fn render_sources(sources: &[SourceItem]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {} ({})\n{}", i + 1, s.title, s.link, s.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::context::TypedContext;
    use crate::engine::{TaskParams, WorkflowConfig};
    use crate::event_bus::MemorySink;
    use crate::execution::ExecutionContext;
    use serde_json::Value;

    /// Build task params wired to a memory-sinked bus.
    pub fn params(data: Value) -> (TaskParams, MemorySink) {
        let events = EventBus::new();
        let sink = MemorySink::new();
        events.add_sink(sink.clone());
        let config = WorkflowConfig::default();
        let params = TaskParams {
            data,
            execution: ExecutionContext::new(events.clone()),
            events,
            context: TypedContext::new(),
            config: config.clone(),
            cancel: config.cancel.clone(),
            task_name: "test-task".to_string(),
            workflow_id: "wf-test".to_string(),
            redirect: Arc::new(Mutex::new(None)),
            persistence: None,
        };
        (params, sink)
    }
}
