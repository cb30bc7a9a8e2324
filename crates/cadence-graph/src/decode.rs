use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use cadence_core::error::{CadenceError, Result};
use cadence_core::step::{DelayUnit, StepProgram, StepRecord, StepType};

use crate::edge::Port;
use crate::encode::TRUE_FALLTHROUGH;
use crate::node::Node;
use crate::NodeGraph;

/// Delay fields carried by a Wait node.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitData {
    #[serde(default)]
    delay_type: DelayUnit,
    #[serde(default)]
    delay_value: u32,
    #[serde(default)]
    send_time: Option<String>,
}

/// Rebuild a step program from a node graph.
///
/// Step order follows each node's `sortOrder`, then its position (top to
/// bottom, left to right). Wait nodes fold their delay into the step they
/// lead to. Branch targets come from the `true`/`false` edges of condition
/// nodes; sequential edges carry no information beyond order.
pub fn decode(graph: &NodeGraph) -> Result<StepProgram> {
    let mut by_id: HashMap<&str, &Node> = HashMap::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        if by_id.insert(node.id.as_str(), node).is_some() {
            return Err(CadenceError::invalid_graph(&node.id, "duplicate node id"));
        }
    }

    for edge in &graph.edges {
        for end in [&edge.from, &edge.to] {
            if !by_id.contains_key(end.as_str()) {
                return Err(CadenceError::DanglingEdge {
                    edge: edge.id.clone(),
                    node: end.clone(),
                });
            }
        }
    }

    // Each Wait node must lead to exactly one step node.
    let mut wait_for_step: HashMap<&str, &Node> = HashMap::new();
    let mut wait_target: HashMap<&str, &str> = HashMap::new();
    for wait in graph.nodes.iter().filter(|n| n.kind.is_wait()) {
        let outgoing: Vec<_> = graph.outgoing(&wait.id).collect();
        let target = match outgoing.as_slice() {
            [edge] => by_id[edge.to.as_str()],
            _ => {
                return Err(CadenceError::OrphanWait {
                    node: wait.id.clone(),
                })
            }
        };
        if target.kind.is_wait() {
            return Err(CadenceError::OrphanWait {
                node: wait.id.clone(),
            });
        }
        if wait_for_step.insert(target.id.as_str(), wait).is_some() {
            return Err(CadenceError::invalid_graph(
                &target.id,
                "more than one Wait node leads to this step",
            ));
        }
        wait_target.insert(wait.id.as_str(), target.id.as_str());
    }

    let mut step_nodes: Vec<&Node> = graph.nodes.iter().filter(|n| !n.kind.is_wait()).collect();
    step_nodes.sort_by(|a, b| {
        let ka = a.sort_order().unwrap_or(usize::MAX);
        let kb = b.sort_order().unwrap_or(usize::MAX);
        ka.cmp(&kb)
            .then(a.y.total_cmp(&b.y))
            .then(a.x.total_cmp(&b.x))
            .then(a.id.cmp(&b.id))
    });

    let index_of: HashMap<&str, usize> = step_nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let resolve = |node_id: &str| -> usize {
        let step_id = wait_target.get(node_id).copied().unwrap_or(node_id);
        index_of[step_id]
    };

    let mut records = Vec::with_capacity(step_nodes.len());
    for (i, node) in step_nodes.iter().enumerate() {
        let mut record = parse_record(node)?;
        record.sort_order = i;
        record.step_type = node.kind.step_type();

        if let Some(wait) = wait_for_step.get(node.id.as_str()) {
            let delay: WaitData = serde_json::from_value(wait.data.clone())
                .map_err(|e| CadenceError::invalid_graph(&wait.id, e.to_string()))?;
            record.delay_type = delay.delay_type;
            record.delay_value = delay.delay_value;
            record.send_time = delay.send_time;
        }

        let mut true_edge = None;
        let mut false_edge = None;
        for edge in graph.outgoing(&node.id) {
            let slot = match edge.from_port {
                Port::True => &mut true_edge,
                Port::False => &mut false_edge,
                _ => continue,
            };
            if node.kind.step_type() != Some(StepType::Condition) {
                return Err(CadenceError::invalid_graph(
                    &edge.id,
                    "branch ports are only valid on condition nodes",
                ));
            }
            if slot.replace(resolve(&edge.to)).is_some() {
                return Err(CadenceError::invalid_graph(
                    &node.id,
                    format!("more than one {:?} edge", edge.from_port).to_lowercase(),
                ));
            }
        }

        let fallthrough = node
            .data
            .get(TRUE_FALLTHROUGH)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        record.branch_true_step = match true_edge {
            Some(t) if fallthrough && t == i + 1 => None,
            other => other,
        };
        record.branch_false_step = false_edge;
        records.push(record);
    }

    let steps = records
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            r.into_step(i)
                .map_err(|e| CadenceError::invalid_graph(&step_nodes[i].id, e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    let program = StepProgram::new(steps).map_err(|e| match e {
        CadenceError::InvalidStep { index, message } => {
            CadenceError::invalid_graph(&step_nodes[index].id, message)
        }
        other => other,
    })?;

    debug!(
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        steps = program.len(),
        "Decoded node graph"
    );
    Ok(program)
}

fn parse_record(node: &Node) -> Result<StepRecord> {
    if node.data.is_null() {
        return Ok(StepRecord::default());
    }
    serde_json::from_value(node.data.clone())
        .map_err(|e| CadenceError::invalid_graph(&node.id, format!("malformed node data: {}", e)))
}
