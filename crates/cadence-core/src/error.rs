use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    // Authoring errors
    #[error("Invalid step {index}: {message}")]
    InvalidStep { index: usize, message: String },

    #[error("Invalid scenario {scenario}: {message}")]
    InvalidScenario { scenario: String, message: String },

    // Graph errors
    #[error("Edge {edge} references missing node {node}")]
    DanglingEdge { edge: String, node: String },

    #[error("Wait node {node} does not lead to exactly one step node")]
    OrphanWait { node: String },

    #[error("Invalid graph at {element}: {message}")]
    InvalidGraph { element: String, message: String },

    // Lookup errors
    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("Enrollment not found: {0}")]
    EnrollmentNotFound(i64),

    // Collaborator errors
    #[error("Delivery failed: {channel}: {message}")]
    Delivery { channel: String, message: String },

    #[error("Subject update failed: {0}")]
    SubjectUpdate(String),

    #[error("Facts lookup failed: {0}")]
    Facts(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CadenceError {
    /// Shorthand for a step-level validation failure.
    pub fn invalid_step(index: usize, message: impl Into<String>) -> Self {
        Self::InvalidStep {
            index,
            message: message.into(),
        }
    }

    /// Shorthand for a graph-level validation failure.
    pub fn invalid_graph(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidGraph {
            element: element.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
