use serde::{Deserialize, Serialize};

/// Connection point on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Port {
    /// Sequential fallthrough out of a node.
    #[default]
    Bottom,
    /// Condition matched.
    True,
    /// Condition did not match.
    False,
    /// Entry point of a node.
    Top,
}

fn default_to_port() -> Port {
    Port::Top
}

/// An edge connecting two nodes on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    #[serde(default)]
    pub from_port: Port,
    #[serde(default = "default_to_port")]
    pub to_port: Port,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

const TRUE_COLOR: &str = "#22c55e";
const FALSE_COLOR: &str = "#ef4444";

impl Edge {
    /// Create a sequential edge.
    pub fn flow(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        Self {
            id: format!("e-{}-{}", from, to),
            from,
            to,
            from_port: Port::Bottom,
            to_port: Port::Top,
            label: None,
            color: None,
        }
    }

    /// Create the edge taken when a condition matches.
    pub fn on_true(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::branch(from.into(), to.into(), Port::True, "Yes", TRUE_COLOR)
    }

    /// Create the edge taken when a condition does not match.
    pub fn on_false(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::branch(from.into(), to.into(), Port::False, "No", FALSE_COLOR)
    }

    fn branch(from: String, to: String, port: Port, label: &str, color: &str) -> Self {
        let suffix = if port == Port::True { "true" } else { "false" };
        Self {
            id: format!("e-{}-{}-{}", from, to, suffix),
            from,
            to,
            from_port: port,
            to_port: Port::Top,
            label: Some(label.to_string()),
            color: Some(color.to_string()),
        }
    }
}
