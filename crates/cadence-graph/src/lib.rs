//! Node-graph codec for step programs.
//!
//! A scenario is stored as a flat `StepProgram`; the visual editor works on
//! a `NodeGraph` of positioned nodes joined by edges. `encode` renders a
//! program with a deterministic layout, `decode` rebuilds the program and
//! rejects graphs that do not describe one.
//!
//! Delays are drawn as separate Wait nodes in front of the step they delay.
//! Condition nodes expose `true` and `false` ports; every other node flows
//! straight into the next step.

use serde::{Deserialize, Serialize};

pub mod decode;
pub mod edge;
pub mod encode;
pub mod node;

pub use decode::decode;
pub use edge::{Edge, Port};
pub use encode::{encode, encode_preserving};
pub use node::{Node, NodeKind};

/// The editable graph form of a step program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl NodeGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges leaving the given node.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Edges entering the given node.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == id)
    }
}
