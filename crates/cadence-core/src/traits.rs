use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::facts::{BehaviorFacts, SubjectProfile};
use crate::types::*;

/// Message sender — outbound delivery transport.
pub trait MessageSender: Send + Sync + 'static {
    /// Transport name (e.g., "webhook", "log").
    fn name(&self) -> &str;

    /// Deliver one message to a subject.
    fn send(&self, subject: &SubjectId, message: &OutboundMessage) -> BoxFuture<'_, Result<()>>;
}

/// Subject mutator — tag, mark and menu assignment. Every call is an upsert.
pub trait SubjectMutator: Send + Sync + 'static {
    fn add_tag(&self, subject: &SubjectId, tag_id: &str) -> BoxFuture<'_, Result<()>>;

    fn remove_tag(&self, subject: &SubjectId, tag_id: &str) -> BoxFuture<'_, Result<()>>;

    fn set_mark(&self, subject: &SubjectId, mark: &str) -> BoxFuture<'_, Result<()>>;

    fn set_menu(&self, subject: &SubjectId, menu_id: &str) -> BoxFuture<'_, Result<()>>;
}

/// Facts provider — batched lookups used by condition rules.
pub trait FactsProvider: Send + Sync + 'static {
    /// Current tags and mark for each subject.
    fn profiles(
        &self,
        subjects: &[SubjectId],
    ) -> BoxFuture<'_, Result<HashMap<SubjectId, SubjectProfile>>>;

    /// Behavioral aggregates for each subject, restricted to the last
    /// `window_days` days before `now` when set.
    fn behavior(
        &self,
        subjects: &[SubjectId],
        window_days: Option<u32>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<HashMap<SubjectId, BehaviorFacts>>>;
}

/// Scenario store — persisted step programs.
pub trait ScenarioStore: Send + Sync + 'static {
    /// Insert or replace a scenario.
    fn save_scenario(&self, scenario: &Scenario) -> BoxFuture<'_, Result<()>>;

    fn load_scenario(&self, id: &ScenarioId) -> BoxFuture<'_, Result<Option<Scenario>>>;

    fn list_scenarios(&self) -> BoxFuture<'_, Result<Vec<Scenario>>>;
}

/// Enrollment store — durable scheduler state.
///
/// Every mutating call is a single atomic statement scoped to the affected
/// rows, so concurrent callers observe either the pre- or the post-state.
pub trait EnrollmentStore: Send + Sync + 'static {
    /// Insert unless `(scenario, subject)` already exists. Returns `None` on conflict.
    fn insert_enrollment(&self, new: &NewEnrollment) -> BoxFuture<'_, Result<Option<Enrollment>>>;

    /// Active enrollments due at `now`, ordered by id, strictly after `after`.
    fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        after: Option<EnrollmentId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Enrollment>>>;

    /// Apply `advance` only if the row is still active at `expected_version`.
    /// Returns whether this caller won the claim.
    fn claim_transition(
        &self,
        id: EnrollmentId,
        expected_version: i64,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Apply `advance` to an active row regardless of version (last write wins).
    fn force_transition(
        &self,
        id: EnrollmentId,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Exit every active enrollment of a subject. Returns the number of rows changed.
    fn exit_all(
        &self,
        subject: &SubjectId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<usize>>;

    fn load_enrollment(&self, id: EnrollmentId) -> BoxFuture<'_, Result<Option<Enrollment>>>;

    fn subject_enrollments(&self, subject: &SubjectId) -> BoxFuture<'_, Result<Vec<Enrollment>>>;
}
