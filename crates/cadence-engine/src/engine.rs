use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use cadence_core::config::SchedulerConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::event::{EngineEvent, EventBus};
use cadence_core::facts::{FactsSnapshot, SubjectFacts};
use cadence_core::step::{ExitAction, StepKind, StepProgram};
use cadence_core::traits::{EnrollmentStore, FactsProvider, ScenarioStore};
use cadence_core::types::{
    Advance, Enrollment, EnrollmentId, NewEnrollment, Scenario, ScenarioId, SubjectId,
};

use crate::context::TickContext;
use crate::dispatcher::ActionDispatcher;
use crate::evaluator::evaluate;
use crate::schedule::DelayClock;

/// Result of an enroll request.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    Enrolled(Enrollment),
    /// The subject already has an enrollment in this scenario.
    AlreadyEnrolled,
    /// The scenario cannot take enrollments; carries the reason.
    Skipped(String),
}

/// Counters for one `tick()` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Due enrollments seen.
    pub due: usize,
    /// Transitions this tick won and persisted.
    pub advanced: usize,
    /// Claims lost to a concurrent writer.
    pub conflicts: usize,
    /// Step actions that failed after their transition was persisted.
    pub action_failures: usize,
    /// Claims that failed to persist; the row stays due.
    pub errors: usize,
}

/// The transition computed for one due enrollment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Plan {
    pub advance: Advance,
    /// Whether the current step's action runs after the claim.
    pub run_action: bool,
}

enum Fired {
    Advanced { action_failed: bool },
    Conflict,
    Error,
}

/// Owns the enrollment lifecycle: enrolls subjects and advances them through
/// their scenario's step program.
pub struct Engine {
    scenarios: Arc<dyn ScenarioStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    facts: Arc<dyn FactsProvider>,
    dispatcher: ActionDispatcher,
    clock: DelayClock,
    page_size: usize,
    max_concurrency: usize,
    event_bus: Arc<EventBus>,
}

impl Engine {
    pub fn new(
        scenarios: Arc<dyn ScenarioStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        facts: Arc<dyn FactsProvider>,
        dispatcher: ActionDispatcher,
        config: &SchedulerConfig,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        Ok(Self {
            scenarios,
            enrollments,
            facts,
            dispatcher,
            clock: DelayClock::from_config(config)?,
            page_size: config.page_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            event_bus,
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Validate and persist a scenario.
    pub async fn save_scenario(&self, scenario: &Scenario) -> Result<()> {
        scenario.validate()?;
        self.scenarios.save_scenario(scenario).await?;
        info!(scenario = %scenario.id, steps = scenario.steps.len(), "Scenario saved");
        Ok(())
    }

    pub async fn load_scenario(&self, id: &ScenarioId) -> Result<Scenario> {
        self.scenarios
            .load_scenario(id)
            .await?
            .ok_or_else(|| CadenceError::ScenarioNotFound(id.to_string()))
    }

    pub async fn list_scenarios(&self) -> Result<Vec<Scenario>> {
        self.scenarios.list_scenarios().await
    }

    pub async fn subject_enrollments(&self, subject: &SubjectId) -> Result<Vec<Enrollment>> {
        self.enrollments.subject_enrollments(subject).await
    }

    /// Enroll a subject into a scenario. Enrolling twice is not an error.
    pub async fn enroll(&self, scenario: &ScenarioId, subject: &SubjectId) -> Result<EnrollOutcome> {
        self.enroll_at(scenario, subject, Utc::now()).await
    }

    pub async fn enroll_at(
        &self,
        scenario: &ScenarioId,
        subject: &SubjectId,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome> {
        let scenario = self.load_scenario(scenario).await?;
        self.enroll_into(&scenario, subject, now).await
    }

    pub(crate) async fn enroll_into(
        &self,
        scenario: &Scenario,
        subject: &SubjectId,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome> {
        if !scenario.enabled {
            info!(scenario = %scenario.id, subject = %subject, "Scenario disabled, not enrolling");
            return Ok(EnrollOutcome::Skipped("scenario is disabled".into()));
        }
        let Some(first) = scenario.steps.get(0) else {
            info!(scenario = %scenario.id, subject = %subject, "Scenario has no steps, not enrolling");
            return Ok(EnrollOutcome::Skipped("scenario has no steps".into()));
        };

        let new = NewEnrollment {
            scenario_id: scenario.id.clone(),
            subject_id: subject.clone(),
            first_step: 0,
            next_fire_at: self.clock.due_at(first, now),
        };
        match self.enrollments.insert_enrollment(&new).await? {
            Some(enrollment) => {
                info!(
                    enrollment = %enrollment.id,
                    scenario = %scenario.id,
                    subject = %subject,
                    "Subject enrolled"
                );
                self.event_bus.publish(EngineEvent::Enrolled {
                    enrollment: enrollment.id,
                    scenario: scenario.id.clone(),
                    subject: subject.clone(),
                });
                Ok(EnrollOutcome::Enrolled(enrollment))
            }
            None => {
                debug!(scenario = %scenario.id, subject = %subject, "Already enrolled");
                Ok(EnrollOutcome::AlreadyEnrolled)
            }
        }
    }

    /// Advance every due enrollment by at most one step.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        let due = self.collect_due(now).await?;
        report.due = due.len();

        let mut ctx = TickContext::default();
        ctx.load_scenarios(self.scenarios.as_ref(), &due).await?;
        // One batch per fact kind for the whole due-set
        let facts = ctx.prefetch_facts(self.facts.as_ref(), &due, now).await;

        let fired: Vec<Fired> = stream::iter(due)
            .map(|enrollment| self.fire(enrollment, &ctx, &facts, now))
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for outcome in fired {
            match outcome {
                Fired::Advanced { action_failed } => {
                    report.advanced += 1;
                    if action_failed {
                        report.action_failures += 1;
                    }
                }
                Fired::Conflict => report.conflicts += 1,
                Fired::Error => report.errors += 1,
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                advanced = report.advanced,
                conflicts = report.conflicts,
                action_failures = report.action_failures,
                errors = report.errors,
                "Tick complete"
            );
        }
        self.event_bus.publish(EngineEvent::TickComplete {
            started_at: now,
            due: report.due,
            advanced: report.advanced,
        });
        Ok(report)
    }

    /// Every enrollment due at `now`, read in keyset pages of `page_size`.
    async fn collect_due(&self, now: DateTime<Utc>) -> Result<Vec<Enrollment>> {
        let mut due = Vec::new();
        let mut after: Option<EnrollmentId> = None;
        loop {
            let page = self
                .enrollments
                .due_enrollments(now, after, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);
            due.extend(page);
        }
        debug!(due = due.len(), "Collected due enrollments");
        Ok(due)
    }

    /// Claim one due enrollment and, if the claim wins, run its step.
    async fn fire(
        &self,
        enrollment: Enrollment,
        ctx: &TickContext,
        facts: &FactsSnapshot,
        now: DateTime<Utc>,
    ) -> Fired {
        let scenario = ctx.scenario(&enrollment.scenario_id);
        let plan = match &scenario {
            Some(scenario) => plan_transition(
                &scenario.steps,
                enrollment.current_step,
                &facts.subject(&enrollment.subject_id),
                &self.clock,
                now,
            ),
            None => Plan {
                advance: Advance::Exit {
                    reason: "scenario no longer exists".into(),
                },
                run_action: false,
            },
        };

        match self
            .enrollments
            .claim_transition(enrollment.id, enrollment.version, &plan.advance, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(enrollment = %enrollment.id, "Enrollment claimed by another tick");
                return Fired::Conflict;
            }
            Err(e) => {
                warn!(enrollment = %enrollment.id, error = %e, "Failed to persist transition; will retry");
                return Fired::Error;
            }
        }

        let mut action_failed = false;
        let step = scenario
            .as_ref()
            .and_then(|s| s.steps.get(enrollment.current_step));
        if let (true, Some(step)) = (plan.run_action, step) {
            match self.dispatcher.dispatch(&enrollment.subject_id, step).await {
                Ok(()) => {
                    self.event_bus.publish(EngineEvent::StepExecuted {
                        enrollment: enrollment.id,
                        step: enrollment.current_step,
                    });
                }
                Err(e) => {
                    action_failed = true;
                    warn!(
                        enrollment = %enrollment.id,
                        subject = %enrollment.subject_id,
                        step = enrollment.current_step,
                        error = %e,
                        "Step action failed"
                    );
                    self.event_bus.publish(EngineEvent::ActionFailed {
                        enrollment: enrollment.id,
                        step: enrollment.current_step,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.publish_transition(enrollment.id, &plan.advance);
        Fired::Advanced { action_failed }
    }

    fn publish_transition(&self, enrollment: EnrollmentId, advance: &Advance) {
        match advance {
            Advance::Continue { step, next_fire_at } => {
                debug!(enrollment = %enrollment, step, next_fire_at = %next_fire_at, "Enrollment advanced");
            }
            Advance::Complete => {
                info!(enrollment = %enrollment, "Enrollment completed");
                self.event_bus.publish(EngineEvent::Completed { enrollment });
            }
            Advance::Exit { reason } => {
                info!(enrollment = %enrollment, reason = %reason, "Enrollment exited");
                self.event_bus.publish(EngineEvent::Exited {
                    enrollment,
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Exit every active enrollment of a subject.
    pub async fn exit_all(&self, subject: &SubjectId, reason: &str) -> Result<usize> {
        self.exit_all_at(subject, reason, Utc::now()).await
    }

    pub async fn exit_all_at(
        &self,
        subject: &SubjectId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let changed = self.enrollments.exit_all(subject, reason, now).await?;
        info!(subject = %subject, reason, changed, "Subject exited from all scenarios");
        Ok(changed)
    }

    /// Move an active enrollment to `target`, rescheduling it like a normal
    /// transition. A target outside the program completes the enrollment.
    /// Returns false when the enrollment is no longer active.
    pub async fn jump_to(&self, id: EnrollmentId, target: usize) -> Result<bool> {
        self.jump_to_at(id, target, Utc::now()).await
    }

    pub async fn jump_to_at(&self, id: EnrollmentId, target: usize, now: DateTime<Utc>) -> Result<bool> {
        let enrollment = self
            .enrollments
            .load_enrollment(id)
            .await?
            .ok_or(CadenceError::EnrollmentNotFound(id.0))?;
        let scenario = self.load_scenario(&enrollment.scenario_id).await?;
        let advance = continue_at(&scenario.steps, Some(target), &self.clock, now);

        let changed = self.enrollments.force_transition(id, &advance, now).await?;
        if changed {
            info!(enrollment = %id, target, "Enrollment jumped");
            self.publish_transition(id, &advance);
        } else {
            debug!(enrollment = %id, target, "Jump ignored, enrollment not active");
        }
        Ok(changed)
    }
}

/// Decide where an enrollment at `index` goes next.
///
/// A matching exit guard wins over the step itself: the action is skipped
/// and the guard's exit action decides the transition.
pub(crate) fn plan_transition(
    program: &StepProgram,
    index: usize,
    facts: &SubjectFacts<'_>,
    clock: &DelayClock,
    now: DateTime<Utc>,
) -> Plan {
    let Some(step) = program.get(index) else {
        return Plan {
            advance: Advance::Complete,
            run_action: false,
        };
    };

    if let Some(guard) = &step.exit {
        if evaluate(&guard.rules, facts, now) {
            let advance = match guard.action {
                ExitAction::Terminate => Advance::Exit {
                    reason: format!("exit rule matched at step {}", index),
                },
                ExitAction::Skip => continue_at(program, Some(index + 1), clock, now),
                ExitAction::JumpTo(target) => continue_at(program, Some(target), clock, now),
            };
            return Plan {
                advance,
                run_action: false,
            };
        }
    }

    let next = match &step.kind {
        StepKind::Condition {
            rules,
            true_target,
            false_target,
        } => {
            if evaluate(rules, facts, now) {
                true_target.or(Some(index + 1))
            } else {
                *false_target
            }
        }
        _ => Some(index + 1),
    };

    Plan {
        advance: continue_at(program, next, clock, now),
        run_action: !step.is_condition(),
    }
}

/// Continue at `next`, or complete when it is unset or outside the program.
fn continue_at(
    program: &StepProgram,
    next: Option<usize>,
    clock: &DelayClock,
    now: DateTime<Utc>,
) -> Advance {
    match next.and_then(|i| program.get(i).map(|step| (i, step))) {
        Some((step, target)) => Advance::Continue {
            step,
            next_fire_at: clock.due_at(target, now),
        },
        None => Advance::Complete,
    }
}
