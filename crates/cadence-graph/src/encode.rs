use std::collections::HashMap;

use serde_json::Value;

use cadence_core::step::{format_send_time, DelayUnit, Step, StepKind, StepProgram, StepRecord};

use crate::edge::Edge;
use crate::node::{Node, NodeKind};
use crate::NodeGraph;

pub(crate) const NODE_WIDTH: f64 = 240.0;
pub(crate) const STEP_HEIGHT: f64 = 80.0;
pub(crate) const WAIT_HEIGHT: f64 = 44.0;
const VERTICAL_GAP: f64 = 40.0;
const BRANCH_COLUMN_OFFSET: f64 = 300.0;
const LABEL_CHARS: usize = 28;

/// Key in condition node data marking an implicit "next step" true branch.
pub(crate) const TRUE_FALLTHROUGH: &str = "trueFallthrough";

/// Render a step program as a node graph with a deterministic layout.
///
/// Steps become nodes `step-{i}`. A step with a positive delay is preceded
/// by a Wait node `wait-{i}`. Branch edges land on a step's entry node, which
/// is its Wait node when it has one.
pub fn encode(program: &StepProgram) -> NodeGraph {
    let steps = program.steps();
    let side_column = side_branch_steps(steps);

    let mut nodes = Vec::with_capacity(steps.len() * 2);
    let mut edges = Vec::new();
    let mut y = 0.0;

    for (i, step) in steps.iter().enumerate() {
        let x = if side_column[i] {
            BRANCH_COLUMN_OFFSET
        } else {
            0.0
        };
        let has_wait = has_wait_node(step);

        if has_wait {
            nodes.push(Node {
                id: Node::wait_id(i),
                kind: NodeKind::Wait,
                label: wait_label(step),
                x,
                y,
                w: NODE_WIDTH,
                h: WAIT_HEIGHT,
                data: wait_data(step),
            });
            edges.push(Edge::flow(Node::wait_id(i), Node::step_id(i)));
            y += WAIT_HEIGHT + VERTICAL_GAP;
        }

        nodes.push(Node {
            id: Node::step_id(i),
            kind: NodeKind::from_step_type(step.kind.step_type()),
            label: step_label(step),
            x,
            y,
            w: NODE_WIDTH,
            h: STEP_HEIGHT,
            data: step_data(i, step, has_wait),
        });
        y += STEP_HEIGHT + VERTICAL_GAP;

        match &step.kind {
            StepKind::Condition {
                true_target,
                false_target,
                ..
            } => {
                let on_true = true_target.or_else(|| (i + 1 < steps.len()).then_some(i + 1));
                if let Some(t) = on_true {
                    edges.push(Edge::on_true(Node::step_id(i), entry_id(steps, t)));
                }
                if let Some(t) = false_target {
                    edges.push(Edge::on_false(Node::step_id(i), entry_id(steps, *t)));
                }
            }
            _ => {
                if i + 1 < steps.len() {
                    edges.push(Edge::flow(Node::step_id(i), entry_id(steps, i + 1)));
                }
            }
        }
    }

    NodeGraph { nodes, edges }
}

/// Encode, keeping the positions of nodes that still exist in `previous`.
///
/// A node keeps its position when a node with the same id and kind was
/// present before.
pub fn encode_preserving(program: &StepProgram, previous: &NodeGraph) -> NodeGraph {
    let mut graph = encode(program);
    let positions: HashMap<&str, (NodeKind, f64, f64)> = previous
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), (n.kind, n.x, n.y)))
        .collect();

    for node in &mut graph.nodes {
        if let Some((kind, x, y)) = positions.get(node.id.as_str()) {
            if *kind == node.kind {
                node.x = *x;
                node.y = *y;
            }
        }
    }
    graph
}

fn has_wait_node(step: &Step) -> bool {
    !step.is_condition() && !step.delay.is_zero()
}

fn entry_id(steps: &[Step], index: usize) -> String {
    match steps.get(index) {
        Some(step) if has_wait_node(step) => Node::wait_id(index),
        _ => Node::step_id(index),
    }
}

/// Steps reached only through a false branch go in the side column.
fn side_branch_steps(steps: &[Step]) -> Vec<bool> {
    let len = steps.len();
    let mut on_false = vec![false; len];
    let mut on_main = vec![false; len];
    if len > 0 {
        on_main[0] = true;
    }

    for (i, step) in steps.iter().enumerate() {
        match &step.kind {
            StepKind::Condition {
                true_target,
                false_target,
                ..
            } => {
                match true_target {
                    Some(t) => on_main[*t] = true,
                    None if i + 1 < len => on_main[i + 1] = true,
                    None => {}
                }
                if let Some(t) = false_target {
                    on_false[*t] = true;
                }
            }
            _ if i + 1 < len => on_main[i + 1] = true,
            _ => {}
        }
    }

    on_false
        .iter()
        .zip(&on_main)
        .map(|(f, m)| *f && !*m)
        .collect()
}

fn step_data(index: usize, step: &Step, delay_on_wait: bool) -> Value {
    let mut record = StepRecord::from_step(index, step);
    record.branch_true_step = None;
    record.branch_false_step = None;
    if delay_on_wait {
        record.delay_type = DelayUnit::default();
        record.delay_value = 0;
        record.send_time = None;
    }

    let mut data = serde_json::to_value(&record).unwrap_or(Value::Null);
    if let (Value::Object(map), StepKind::Condition { true_target: None, .. }) =
        (&mut data, &step.kind)
    {
        map.insert(TRUE_FALLTHROUGH.to_string(), Value::Bool(true));
    }
    data
}

fn wait_data(step: &Step) -> Value {
    let mut data = serde_json::json!({
        "delayType": step.delay.unit,
        "delayValue": step.delay.amount,
    });
    if let Some(t) = step.delay.send_time {
        data["sendTime"] = Value::String(format_send_time(t));
    }
    data
}

fn wait_label(step: &Step) -> String {
    let unit = match (step.delay.unit, step.delay.amount) {
        (DelayUnit::Minutes, 1) => "minute",
        (DelayUnit::Minutes, _) => "minutes",
        (DelayUnit::Hours, 1) => "hour",
        (DelayUnit::Hours, _) => "hours",
        (DelayUnit::Days, 1) => "day",
        (DelayUnit::Days, _) => "days",
    };
    match step.delay.send_time {
        Some(t) if step.delay.unit == DelayUnit::Days => {
            format!("Wait {} {} at {}", step.delay.amount, unit, format_send_time(t))
        }
        _ => format!("Wait {} {}", step.delay.amount, unit),
    }
}

fn step_label(step: &Step) -> String {
    match &step.kind {
        StepKind::SendText { content } => truncate(content),
        StepKind::SendTemplate { template_id } => format!("Template {}", template_id),
        StepKind::Condition { rules, .. } => match rules.rules.len() {
            1 => "Condition (1 rule)".to_string(),
            n => format!("Condition ({} rules)", n),
        },
        StepKind::TagAdd { tag_id } => format!("Add tag {}", tag_id),
        StepKind::TagRemove { tag_id } => format!("Remove tag {}", tag_id),
        StepKind::MarkChange { mark } => format!("Mark {}", mark),
        StepKind::MenuChange { menu_id } => format!("Menu {}", menu_id),
    }
}

fn truncate(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= LABEL_CHARS && !text.contains('\n') {
        return first_line.to_string();
    }
    let mut out: String = first_line.chars().take(LABEL_CHARS).collect();
    out.push_str("...");
    out
}
