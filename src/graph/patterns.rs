//! Edge pattern handlers.
//!
//! One handler per control-flow pattern. Each receives the group of
//! same-pattern edges leaving the current node, the source node's response
//! and the shared response log, and returns the final response string that
//! propagates outward. Every edge invocation runs under
//! `AgentGraph::with_fallback`, so a failure routes to the edge's fallback
//! node instead of aborting the graph.

use futures_util::future::join_all;

use crate::graph::edge::{ConditionInput, Edge, EdgePattern};
use crate::graph::executor::{AgentGraph, GraphError, ResponseLog};

pub(crate) async fn dispatch(
    graph: &AgentGraph,
    pattern: EdgePattern,
    edges: &[Edge],
    response: &str,
    responses: &ResponseLog,
) -> Result<String, GraphError> {
    match pattern {
        EdgePattern::Sequential => sequential(graph, edges, response, responses).await,
        EdgePattern::Parallel => parallel(graph, edges, response, responses).await,
        EdgePattern::Condition => condition(graph, edges, response, responses).await,
        EdgePattern::Map => map(graph, edges, response, responses).await,
        EdgePattern::Reduce => reduce(graph, edges, response, responses).await,
        EdgePattern::Loop => loop_pattern(graph, edges, response, responses).await,
        EdgePattern::Revision => revision(graph, edges, response, responses).await,
    }
}

/// Execute destinations in ascending priority order, each seeing the source
/// response; returns the source response.
async fn sequential(
    graph: &AgentGraph,
    edges: &[Edge],
    response: &str,
    responses: &ResponseLog,
) -> Result<String, GraphError> {
    let mut ordered: Vec<&Edge> = edges.iter().collect();
    ordered.sort_by_key(|edge| edge.config.priority);
    for edge in ordered {
        graph
            .with_fallback(
                edge,
                response,
                responses,
                graph.execute_node(&edge.to, response.to_string(), responses),
            )
            .await?;
    }
    Ok(response.to_string())
}

/// Execute all destinations concurrently with the same source response;
/// errors surface after every sibling settles. Returns the source response.
async fn parallel(
    graph: &AgentGraph,
    edges: &[Edge],
    response: &str,
    responses: &ResponseLog,
) -> Result<String, GraphError> {
    let invocations = edges.iter().map(|edge| {
        graph.with_fallback(
            edge,
            response,
            responses,
            graph.execute_node(&edge.to, response.to_string(), responses),
        )
    });
    for settled in join_all(invocations).await {
        settled?;
    }
    Ok(response.to_string())
}

/// Execute each destination only when its condition holds. An edge without
/// a condition always fires.
async fn condition(
    graph: &AgentGraph,
    edges: &[Edge],
    response: &str,
    responses: &ResponseLog,
) -> Result<String, GraphError> {
    for edge in edges {
        let fire = match &edge.config.condition {
            Some(predicate) => {
                let results = graph.results();
                predicate(&ConditionInput { response, results: &results })
            }
            None => true,
        };
        if fire {
            graph
                .with_fallback(
                    edge,
                    response,
                    responses,
                    graph.execute_node(&edge.to, response.to_string(), responses),
                )
                .await?;
        } else {
            tracing::debug!(to = %edge.to, "condition edge skipped");
        }
    }
    Ok(response.to_string())
}

/// Fan the (optionally transformed) response elements over the destination
/// concurrently, combine the outputs, record the combination as the
/// destination's result and continue traversal with it.
async fn map(
    graph: &AgentGraph,
    edges: &[Edge],
    response: &str,
    responses: &ResponseLog,
) -> Result<String, GraphError> {
    let mut final_response = response.to_string();
    for edge in edges {
        let items = match &edge.config.input_transform {
            Some(transform) => transform(response),
            None => vec![response.to_string()],
        };
        let invocations = items.iter().map(|item| {
            graph.with_fallback(edge, item, responses, async move {
                graph.process_node(&edge.to, item, responses).await
            })
        });
        let mut outputs = Vec::with_capacity(items.len());
        for settled in join_all(invocations).await {
            outputs.push(settled?);
        }
        let combined = match &edge.config.output_transform {
            Some(transform) => transform(&outputs),
            None => outputs.join("\n"),
        };
        graph.record_result(&edge.to, &combined);
        final_response = graph.traverse_from(&edge.to, &combined, responses).await?;
    }
    Ok(final_response)
}

/// Gather the recorded results of the destination's predecessors, combine
/// them, and execute the destination once with the combined input.
///
/// Only results recorded by dispatch time participate; in-flight
/// predecessors are not awaited.
async fn reduce(
    graph: &AgentGraph,
    edges: &[Edge],
    response: &str,
    responses: &ResponseLog,
) -> Result<String, GraphError> {
    let mut final_response = response.to_string();
    for edge in edges {
        let results = graph.results();
        let inputs: Vec<String> = graph
            .input_nodes(&edge.to)
            .iter()
            .filter_map(|name| results.get(name).cloned())
            .collect();
        let combined = if inputs.is_empty() {
            response.to_string()
        } else {
            match &edge.config.output_transform {
                Some(transform) => transform(&inputs),
                None => inputs.join("\n"),
            }
        };
        final_response = graph
            .with_fallback(
                edge,
                &combined,
                responses,
                graph.execute_node(&edge.to, combined.clone(), responses),
            )
            .await?;
    }
    Ok(final_response)
}

/// Iterate between the two endpoints: run the destination on the current
/// input, then the source on the destination's output, up to the iteration
/// cap or until the stop condition holds for the destination's latest
/// output. All iteration outputs combine into the final response; both
/// endpoints end up completed. A zero cap leaves the source response
/// unchanged.
async fn loop_pattern(
    graph: &AgentGraph,
    edges: &[Edge],
    response: &str,
    responses: &ResponseLog,
) -> Result<String, GraphError> {
    let mut final_response = response.to_string();
    for edge in edges {
        let iterations = edge.config.max_iterations.unwrap_or(graph.default_iterations());
        if iterations == 0 {
            continue;
        }
        let mut current = response.to_string();
        let mut outputs = Vec::new();
        for iteration in 0..iterations {
            let to_output = graph
                .with_fallback(edge, &current, responses, async {
                    graph.process_node(&edge.to, &current, responses).await
                })
                .await?;
            outputs.push(to_output.clone());

            let from_output = graph
                .with_fallback(edge, &to_output, responses, async {
                    graph.process_node(&edge.from, &to_output, responses).await
                })
                .await?;
            outputs.push(from_output.clone());
            current = from_output;

            if graph
                .should_stop(edge.config.stop_condition.as_ref(), &to_output, responses)
                .await
            {
                tracing::debug!(from = %edge.from, to = %edge.to, iteration, "loop stop condition met");
                break;
            }
        }
        final_response = match &edge.config.output_transform {
            Some(transform) => transform(&outputs),
            None => outputs.join("\n\n"),
        };
    }
    Ok(final_response)
}

/// Self-improvement over the destination: repeatedly call it with a
/// revision prompt built from the previous output; the last output is the
/// final response.
async fn revision(
    graph: &AgentGraph,
    edges: &[Edge],
    response: &str,
    responses: &ResponseLog,
) -> Result<String, GraphError> {
    let mut final_response = response.to_string();
    for edge in edges {
        let iterations = edge.config.max_iterations.unwrap_or(graph.default_iterations());
        let mut current = response.to_string();
        for iteration in 0..iterations {
            let prompt = {
                let results = graph.results();
                match &edge.config.revision_prompt {
                    Some(build) => build(&ConditionInput {
                        response: &current,
                        results: &results,
                    }),
                    None => format!("Revise and improve the following response:\n\n{current}"),
                }
            };
            current = graph
                .with_fallback(edge, &prompt, responses, async {
                    graph.process_node(&edge.to, &prompt, responses).await
                })
                .await?;
            if graph
                .should_stop(edge.config.stop_condition.as_ref(), &current, responses)
                .await
            {
                tracing::debug!(to = %edge.to, iteration, "revision stop condition met");
                break;
            }
        }
        final_response = current;
    }
    Ok(final_response)
}
