//! Scenario runtime: rule evaluation, step dispatch and the enrollment
//! scheduler.

mod context;
pub mod dispatcher;
pub mod engine;
pub mod evaluator;
pub mod event_log;
pub mod outbound;
pub mod schedule;
pub mod tick_loop;
pub mod triggers;

pub use dispatcher::ActionDispatcher;
pub use engine::{EnrollOutcome, Engine, TickReport};
pub use evaluator::{evaluate, evaluate_any_of};
pub use event_log::EventLog;
pub use outbound::{LogSender, WebhookSender};
pub use schedule::DelayClock;
pub use tick_loop::TickLoop;
pub use triggers::{keyword_matches, TagOutcome, TriggerOutcomes};
