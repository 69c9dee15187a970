use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::{Task, TaskError, TaskOutput, TaskParams};
use crate::event_bus::{channels, SourceItem};
use crate::llm::Tool;
use crate::tasks::keys;

/// Run the search tool for the current query and surface the results on
/// the `sources` channel.
pub struct WebSearchTask {
    tool: Arc<dyn Tool>,
    max_results: usize,
}

impl WebSearchTask {
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self {
            tool,
            max_results: 8,
        }
    }

    #[must_use]
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

/// Accept either a bare list of sources or a `{"results": […]}` wrapper.
fn parse_sources(value: &Value) -> Result<Vec<SourceItem>, TaskError> {
    let list = value.get("results").unwrap_or(value);
    Ok(serde_json::from_value(list.clone())?)
}

#[async_trait]
impl Task for WebSearchTask {
    async fn execute(&self, params: TaskParams) -> Result<TaskOutput, TaskError> {
        let query = params
            .context
            .get(&keys::REFINED_QUERY)
            .or_else(|| params.context.get(&keys::QUERY))
            .or_else(|| params.data.as_str().map(str::to_string))
            .ok_or_else(|| TaskError::failed("web-search requires a query"))?;

        tracing::debug!(query = %query, "running web search");
        let raw = self.tool.invoke(json!({"query": query})).await?;
        let mut sources = parse_sources(&raw)?;
        sources.truncate(self.max_results);

        let _ = params.events.emit(&channels::SOURCES, &sources);
        params.context.set(&keys::SOURCES, sources.clone())?;
        Ok(TaskOutput::value(serde_json::to_value(&sources)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolError;
    use crate::tasks::test_support::params;

    struct FakeSearch;

    #[async_trait]
    impl Tool for FakeSearch {
        fn name(&self) -> &str {
            "web_search"
        }

        async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
            assert_eq!(args["query"], json!("tides"));
            Ok(json!({"results": [
                {"title": "Tides", "link": "https://example.com/tides", "snippet": "Lunar gravity."},
                {"title": "Oceans", "link": "https://example.com/oceans", "snippet": "Bulges."}
            ]}))
        }
    }

    #[tokio::test]
    async fn emits_sources_and_stores_context() {
        let task = WebSearchTask::new(Arc::new(FakeSearch));
        let (params, sink) = params(json!("tides"));
        let context = params.context.clone();

        task.execute(params).await.unwrap();

        let sources = context.get(&keys::SOURCES).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].title, "Tides");
        let emitted = sink.channel_events("sources");
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].payload[1]["title"], json!("Oceans"));
    }

    #[tokio::test]
    async fn truncates_to_max_results() {
        struct ManyResults;

        #[async_trait]
        impl Tool for ManyResults {
            fn name(&self) -> &str {
                "web_search"
            }

            async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
                let results: Vec<Value> = (0..20)
                    .map(|i| json!({"title": format!("r{i}"), "link": "l", "snippet": "s"}))
                    .collect();
                Ok(json!(results))
            }
        }

        let task = WebSearchTask::new(Arc::new(ManyResults)).with_max_results(3);
        let (params, _) = params(json!("q"));
        let context = params.context.clone();
        task.execute(params).await.unwrap();
        assert_eq!(context.get(&keys::SOURCES).unwrap().len(), 3);
    }
}
