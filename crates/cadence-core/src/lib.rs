pub mod config;
pub mod error;
pub mod event;
pub mod facts;
pub mod rules;
pub mod step;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CadenceError, Result};
pub use event::{EngineEvent, EventBus};
pub use facts::{BehaviorFacts, FactsSnapshot, SubjectFacts, SubjectProfile};
pub use rules::{BehaviorMetric, Combinator, CompareOp, ConditionRule, RuleSet, TagMatch};
pub use step::{DelaySpec, DelayUnit, ExitAction, ExitGuard, Step, StepKind, StepProgram, StepRecord, StepType};
pub use types::*;
