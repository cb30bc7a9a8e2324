use serde::{Deserialize, Serialize};

use cadence_core::step::StepType;

/// Visual node type. Every kind except `Wait` maps to one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    SendText,
    SendTemplate,
    Condition,
    TagAdd,
    TagRemove,
    MarkChange,
    MenuChange,
    /// Synthetic delay node; carries no step identity.
    Wait,
}

impl NodeKind {
    pub fn from_step_type(step_type: StepType) -> Self {
        match step_type {
            StepType::SendText => NodeKind::SendText,
            StepType::SendTemplate => NodeKind::SendTemplate,
            StepType::Condition => NodeKind::Condition,
            StepType::TagAdd => NodeKind::TagAdd,
            StepType::TagRemove => NodeKind::TagRemove,
            StepType::MarkChange => NodeKind::MarkChange,
            StepType::MenuChange => NodeKind::MenuChange,
        }
    }

    /// The step type this node stands for (`None` for Wait nodes).
    pub fn step_type(self) -> Option<StepType> {
        match self {
            NodeKind::SendText => Some(StepType::SendText),
            NodeKind::SendTemplate => Some(StepType::SendTemplate),
            NodeKind::Condition => Some(StepType::Condition),
            NodeKind::TagAdd => Some(StepType::TagAdd),
            NodeKind::TagRemove => Some(StepType::TagRemove),
            NodeKind::MarkChange => Some(StepType::MarkChange),
            NodeKind::MenuChange => Some(StepType::MenuChange),
            NodeKind::Wait => None,
        }
    }

    pub fn is_wait(self) -> bool {
        self == NodeKind::Wait
    }
}

/// A node on the editing canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub w: f64,
    #[serde(default)]
    pub h: f64,
    /// Step fields for step nodes, delay fields for Wait nodes.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Node {
    /// Synthetic id of the node for step `index`.
    pub fn step_id(index: usize) -> String {
        format!("step-{}", index)
    }

    /// Synthetic id of the Wait node in front of step `index`.
    pub fn wait_id(index: usize) -> String {
        format!("wait-{}", index)
    }

    /// Explicit `sortOrder` stored in the node data, if any.
    pub fn sort_order(&self) -> Option<usize> {
        self.data
            .get("sortOrder")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_wire_shape() {
        let node = Node {
            id: Node::step_id(2),
            kind: NodeKind::TagAdd,
            label: "Add tag vip".into(),
            x: 0.0,
            y: 120.0,
            w: 240.0,
            h: 80.0,
            data: serde_json::json!({"sortOrder": 2, "tagId": "vip"}),
        };
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["id"], "step-2");
        assert_eq!(value["type"], "tag_add");
        assert_eq!(node.sort_order(), Some(2));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(NodeKind::Wait.step_type(), None);
        for st in [StepType::SendText, StepType::Condition, StepType::MenuChange] {
            assert_eq!(NodeKind::from_step_type(st).step_type(), Some(st));
        }
    }

    #[test]
    fn test_missing_geometry_defaults() {
        let node: Node = serde_json::from_str(r#"{"id": "n", "type": "wait"}"#).unwrap();
        assert!(node.kind.is_wait());
        assert_eq!(node.x, 0.0);
        assert!(node.sort_order().is_none());
    }
}
