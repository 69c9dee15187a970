use std::sync::Arc;

use serde_json::json;
use taskloom::event_bus::{EventBus, MemorySink};
use taskloom::graph::{
    AgentGraph, AgentNode, Edge, EdgeConfig, EdgePattern, ResponseLog, StopCondition,
};
use taskloom::llm::ScriptedModel;

fn graph_with_model(model: &ScriptedModel) -> (AgentGraph, MemorySink) {
    let events = EventBus::new();
    let sink = MemorySink::new();
    events.add_sink(sink.clone());
    let graph = AgentGraph::new("scripted", Arc::new(model.clone()), events);
    (graph, sink)
}

fn node(name: &str) -> AgentNode {
    AgentNode::new(name, "worker", format!("You are the {name} node."))
}

#[tokio::test]
async fn sequential_edges_run_in_priority_order() {
    let model = ScriptedModel::new();
    model.push_response("root out");
    model.push_response("low priority first");
    model.push_response("high priority second");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("root"));
    graph.add_node(node("second"));
    graph.add_node(node("first"));
    graph.add_edge(
        Edge::new("root", "second", EdgePattern::Sequential)
            .with_config(EdgeConfig::new().with_priority(2)),
    );
    graph.add_edge(
        Edge::new("root", "first", EdgePattern::Sequential)
            .with_config(EdgeConfig::new().with_priority(1)),
    );

    let responses = ResponseLog::new();
    let final_response = graph
        .execute_node("root", "go".to_string(), &responses)
        .await
        .unwrap();

    // Sequential returns the source response unchanged.
    assert_eq!(final_response, "root out");
    let state = graph.execution_state();
    let order: Vec<&str> = state
        .node_states
        .iter()
        .map(|record| record.name.as_str())
        .collect();
    assert_eq!(order, vec!["root", "first", "second"]);
    assert_eq!(state.results["first"], "low priority first");
    assert_eq!(state.results["second"], "high priority second");
}

#[tokio::test]
async fn parallel_edges_all_run() {
    let model = ScriptedModel::new();
    model.push_response("same output");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("root"));
    graph.add_node(node("left"));
    graph.add_node(node("right"));
    graph.add_edge(Edge::new("root", "left", EdgePattern::Parallel));
    graph.add_edge(Edge::new("root", "right", EdgePattern::Parallel));

    let responses = ResponseLog::new();
    let final_response = graph
        .execute_node("root", "go".to_string(), &responses)
        .await
        .unwrap();

    assert_eq!(final_response, "same output");
    let state = graph.execution_state();
    assert!(state.completed.contains("left"));
    assert!(state.completed.contains("right"));
    assert_eq!(responses.len(), 3);
}

#[tokio::test]
async fn condition_edges_gate_execution() {
    let model = ScriptedModel::new();
    model.push_response("root says yes");
    model.push_response("taken branch");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("root"));
    graph.add_node(node("taken"));
    graph.add_node(node("skipped"));
    graph.add_edge(
        Edge::new("root", "taken", EdgePattern::Condition).with_config(
            EdgeConfig::new().with_condition(|input| input.response.contains("yes")),
        ),
    );
    graph.add_edge(
        Edge::new("root", "skipped", EdgePattern::Condition).with_config(
            EdgeConfig::new().with_condition(|input| input.response.contains("no such")),
        ),
    );

    let responses = ResponseLog::new();
    graph
        .execute_node("root", "go".to_string(), &responses)
        .await
        .unwrap();

    let state = graph.execution_state();
    assert!(state.completed.contains("taken"));
    assert!(!state.completed.contains("skipped"));
}

#[tokio::test]
async fn map_edge_fans_out_and_combines() {
    let model = ScriptedModel::new();
    model.push_response("alpha,beta,gamma");
    model.push_response("processed item");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("splitter"));
    graph.add_node(node("worker"));
    graph.add_edge(
        Edge::new("splitter", "worker", EdgePattern::Map).with_config(
            EdgeConfig::new()
                .with_input_transform(|response| {
                    response.split(',').map(str::to_string).collect()
                })
                .with_output_transform(|outputs| format!("{} items", outputs.len())),
        ),
    );

    let responses = ResponseLog::new();
    let final_response = graph
        .execute_node("splitter", "go".to_string(), &responses)
        .await
        .unwrap();

    assert_eq!(final_response, "3 items");
    let state = graph.execution_state();
    // The combined output is recorded as the destination's result.
    assert_eq!(state.results["worker"], "3 items");
    // splitter + one worker run per element.
    assert_eq!(responses.len(), 4);
}

#[tokio::test]
async fn reduce_edge_combines_predecessor_results() {
    let model = ScriptedModel::new();
    model.push_response("fact one");
    model.push_response("fact two");
    model.push_response("combined digest");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("a"));
    graph.add_node(node("b"));
    graph.add_node(node("collector"));
    graph.add_edge(Edge::new("a", "b", EdgePattern::Sequential));
    graph.add_edge(Edge::new("a", "collector", EdgePattern::Reduce));
    graph.add_edge(Edge::new("b", "collector", EdgePattern::Reduce));

    let responses = ResponseLog::new();
    graph.execute_node("a", "go".to_string(), &responses).await.unwrap();

    let model_prompts = model.recorded_prompts();
    // The collector saw both predecessor results joined together.
    let collector_prompt = model_prompts.last().unwrap();
    assert!(collector_prompt.contains("fact one"));
    assert!(collector_prompt.contains("fact two"));
    let state = graph.execution_state();
    assert_eq!(state.results["collector"], "combined digest");
}

#[tokio::test]
async fn loop_edge_alternates_endpoints_until_stop() {
    let model = ScriptedModel::new();
    model.push_response("A0"); // entry execution of A
    model.push_response("B1");
    model.push_response("A1");
    model.push_response("B2");
    model.push_response("A2");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("A"));
    graph.add_node(node("B"));
    graph.add_edge(
        Edge::new("A", "B", EdgePattern::Loop).with_config(
            EdgeConfig::new()
                .with_max_iterations(2)
                .with_stop_condition(StopCondition::predicate(|response| response == "B2")),
        ),
    );

    let responses = ResponseLog::new();
    let final_response = graph
        .execute_node("A", "seed".to_string(), &responses)
        .await
        .unwrap();

    // Exactly two B outputs and two A outputs appended by the loop.
    assert_eq!(
        responses.entries(),
        vec!["A0", "B1", "A1", "B2", "A2"]
    );
    assert_eq!(final_response, "B1\n\nA1\n\nB2\n\nA2");
    let state = graph.execution_state();
    assert!(state.completed.contains("A"));
    assert!(state.completed.contains("B"));
}

#[tokio::test]
async fn loop_edge_with_zero_iterations_is_identity() {
    let model = ScriptedModel::new();
    model.push_response("source response");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("A"));
    graph.add_node(node("B"));
    graph.add_edge(
        Edge::new("A", "B", EdgePattern::Loop)
            .with_config(EdgeConfig::new().with_max_iterations(0)),
    );

    let responses = ResponseLog::new();
    let final_response = graph
        .execute_node("A", "seed".to_string(), &responses)
        .await
        .unwrap();

    assert_eq!(final_response, "source response");
    assert!(!graph.execution_state().completed.contains("B"));
}

#[tokio::test]
async fn revision_edge_iterates_with_revision_prompt() {
    let model = ScriptedModel::new();
    model.push_response("draft");
    model.push_response("better draft");
    model.push_response("final draft");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("author"));
    graph.add_node(node("editor"));
    graph.add_edge(
        Edge::new("author", "editor", EdgePattern::Revision).with_config(
            EdgeConfig::new()
                .with_max_iterations(5)
                .with_revision_prompt(|input| format!("Improve this draft: {}", input.response))
                .with_stop_condition(StopCondition::predicate(|response| {
                    response.contains("final")
                })),
        ),
    );

    let responses = ResponseLog::new();
    let final_response = graph
        .execute_node("author", "write".to_string(), &responses)
        .await
        .unwrap();

    assert_eq!(final_response, "final draft");
    let prompts = model.recorded_prompts();
    assert!(prompts[1].contains("Improve this draft: draft"));
    assert!(prompts[2].contains("Improve this draft: better draft"));
}

#[tokio::test]
async fn failed_edge_routes_to_fallback_node() {
    let model = ScriptedModel::new();
    model.push_response("root out");
    model.push_response("rescued");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("root"));
    graph.add_node(node("rescue"));
    // Destination is not registered, so the invocation fails and the
    // fallback node runs instead.
    graph.add_edge(
        Edge::new("root", "missing", EdgePattern::Sequential)
            .with_config(EdgeConfig::new().with_fallback("rescue")),
    );

    let responses = ResponseLog::new();
    graph
        .execute_node("root", "go".to_string(), &responses)
        .await
        .unwrap();

    let state = graph.execution_state();
    assert!(state.completed.contains("rescue"));
    assert_eq!(state.results["rescue"], "rescued");
}

#[tokio::test]
async fn failed_edge_without_fallback_propagates() {
    let model = ScriptedModel::new();
    model.push_response("root out");
    let (mut graph, _sink) = graph_with_model(&model);

    graph.add_node(node("root"));
    graph.add_edge(Edge::new("root", "missing", EdgePattern::Sequential));

    let responses = ResponseLog::new();
    let err = graph
        .execute_node("root", "go".to_string(), &responses)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("node not found"));
}

#[tokio::test]
async fn reasoning_node_runs_pre_step_and_streams() {
    let model = ScriptedModel::new();
    model.push_response_with_reasoning("reasoned answer", "first think about tides");
    let (mut graph, sink) = graph_with_model(&model);

    graph.add_node(node("thinker").with_reasoning());

    let responses = ResponseLog::new();
    let output = graph
        .execute_node("thinker", "question".to_string(), &responses)
        .await
        .unwrap();

    // The reasoning pre-pass consumed the first scripted turn; the main
    // call repeats the drained response.
    assert_eq!(output, "reasoned answer");
    let steps = sink.channel_events("step");
    assert!(steps
        .iter()
        .any(|event| event.payload["subSteps"]["reasoning"]["status"] == json!("COMPLETED")));
    let state = graph.execution_state();
    let completed_record = state
        .node_states
        .iter()
        .find(|record| record.output == "reasoned answer")
        .unwrap();
    assert_eq!(
        completed_record.reasoning.as_deref(),
        Some("reasoned answer")
    );
}

#[tokio::test]
async fn streaming_emits_partial_answers() {
    let model = ScriptedModel::new();
    model.push_response("one. two. three. done");
    let (mut graph, sink) = graph_with_model(&model);
    graph.add_node(node("streamer"));

    let responses = ResponseLog::new();
    graph
        .execute_node("streamer", "go".to_string(), &responses)
        .await
        .unwrap();

    let answers = sink.channel_events("answer");
    assert!(!answers.is_empty());
    // Accumulated text grows monotonically to the full response.
    let last_text = answers.last().unwrap().payload["text"].as_str().unwrap();
    assert_eq!(last_text, "one. two. three. done");
}
