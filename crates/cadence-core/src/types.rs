use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CadenceError, Result};
use crate::step::StepProgram;

/// Scenario identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ScenarioId(pub String);

impl ScenarioId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScenarioId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ScenarioId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subject (patient) identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row id of an enrollment.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EnrollmentId(pub i64);

impl std::fmt::Display for EnrollmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a keyword trigger compares incoming text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMatch {
    #[default]
    Exact,
    Contains,
    Regex,
}

/// Event that enrolls a subject into a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Subject became eligible (e.g. registered or linked an account).
    Eligible,
    /// Subject sent a message matching a keyword.
    Keyword {
        pattern: String,
        #[serde(default)]
        mode: KeywordMatch,
    },
    /// A specific tag was assigned to the subject.
    TagAssigned {
        #[serde(rename = "tagId")]
        tag_id: String,
    },
    /// Only explicit enroll calls.
    Manual,
}

/// Fast-forward rule: when `tag_id` is assigned to an already-enrolled
/// subject, jump its enrollment to `target_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagJump {
    pub tag_id: String,
    pub target_step: usize,
}

/// A named automation program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub id: ScenarioId,
    pub name: String,
    pub trigger: Trigger,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub steps: StepProgram,
    #[serde(default)]
    pub tag_jumps: Vec<TagJump>,
}

fn default_enabled() -> bool {
    true
}

impl Scenario {
    pub fn new(id: impl Into<String>, name: impl Into<String>, trigger: Trigger, steps: StepProgram) -> Self {
        Self {
            id: ScenarioId(id.into()),
            name: name.into(),
            trigger,
            enabled: true,
            steps,
            tag_jumps: Vec::new(),
        }
    }

    /// Validate everything the step program itself cannot check.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| CadenceError::InvalidScenario {
            scenario: self.id.to_string(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        self.steps.validate()?;

        match &self.trigger {
            Trigger::Keyword { pattern, mode } => {
                if pattern.is_empty() {
                    return Err(invalid("keyword pattern must not be empty".into()));
                }
                if *mode == KeywordMatch::Regex {
                    regex::Regex::new(pattern)
                        .map_err(|e| invalid(format!("invalid keyword regex: {}", e)))?;
                }
            }
            Trigger::TagAssigned { tag_id } if tag_id.is_empty() => {
                return Err(invalid("trigger tagId must not be empty".into()));
            }
            _ => {}
        }

        for jump in &self.tag_jumps {
            if jump.target_step >= self.steps.len() {
                return Err(invalid(format!(
                    "tag jump for '{}' targets step {} outside the program",
                    jump.tag_id, jump.target_step
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle state of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Exited,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Exited => "exited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EnrollmentStatus::Active),
            "completed" => Some(EnrollmentStatus::Completed),
            "exited" => Some(EnrollmentStatus::Exited),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnrollmentStatus::Active)
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime instance of a scenario for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub scenario_id: ScenarioId,
    pub subject_id: SubjectId,
    pub current_step: usize,
    pub status: EnrollmentStatus,
    /// `None` once the enrollment is terminal.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    /// Bumped on every write; claims compare-and-swap on it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert request for a fresh enrollment.
#[derive(Debug, Clone)]
pub struct NewEnrollment {
    pub scenario_id: ScenarioId,
    pub subject_id: SubjectId,
    pub first_step: usize,
    pub next_fire_at: DateTime<Utc>,
}

/// The state an enrollment moves to after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Stay active at `step`, due at `next_fire_at`.
    Continue {
        step: usize,
        next_fire_at: DateTime<Utc>,
    },
    /// Program finished or branched to terminate.
    Complete,
    /// Left the scenario early.
    Exit { reason: String },
}

impl Advance {
    pub fn status(&self) -> EnrollmentStatus {
        match self {
            Advance::Continue { .. } => EnrollmentStatus::Active,
            Advance::Complete => EnrollmentStatus::Completed,
            Advance::Exit { .. } => EnrollmentStatus::Exited,
        }
    }
}

/// Payload handed to a message sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text { content: String },
    Template { template_id: String },
}
