use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SubjectId;

/// Attribute facts about a subject: current tags and mark.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectProfile {
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub mark: Option<String>,
}

impl SubjectProfile {
    pub fn with_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            mark: None,
        }
    }

    pub fn with_mark(mut self, mark: impl Into<String>) -> Self {
        self.mark = Some(mark.into());
        self
    }
}

/// Aggregated behavioral facts for a subject, optionally over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorFacts {
    pub visit_count: u64,
    pub purchase_total: f64,
    pub last_visit: Option<DateTime<Utc>>,
    pub reorder_count: u64,
}

static EMPTY_PROFILE: OnceLock<SubjectProfile> = OnceLock::new();

static NO_ACTIVITY: BehaviorFacts = BehaviorFacts {
    visit_count: 0,
    purchase_total: 0.0,
    last_visit: None,
    reorder_count: 0,
};

/// Facts fetched once for a batch of subjects.
///
/// Lives for a single tick page. A `None` entry in `profiles` or in a window
/// of `behavior` means the provider failed for that batch; predicates that
/// need the missing facts evaluate to false.
#[derive(Debug, Clone, Default)]
pub struct FactsSnapshot {
    profiles: Option<HashMap<SubjectId, SubjectProfile>>,
    behavior: BTreeMap<Option<u32>, Option<HashMap<SubjectId, BehaviorFacts>>>,
}

impl FactsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of a profile lookup (`None` = lookup failed).
    pub fn set_profiles(&mut self, profiles: Option<HashMap<SubjectId, SubjectProfile>>) {
        self.profiles = profiles;
    }

    /// Record the result of a behavioral lookup for one window.
    pub fn set_behavior(
        &mut self,
        window_days: Option<u32>,
        facts: Option<HashMap<SubjectId, BehaviorFacts>>,
    ) {
        self.behavior.insert(window_days, facts);
    }

    /// Builder-style profile insertion, mostly for tests.
    pub fn with_profile(mut self, subject: impl Into<SubjectId>, profile: SubjectProfile) -> Self {
        self.profiles
            .get_or_insert_with(HashMap::new)
            .insert(subject.into(), profile);
        self
    }

    /// Builder-style behavioral insertion, mostly for tests.
    pub fn with_behavior(
        mut self,
        subject: impl Into<SubjectId>,
        window_days: Option<u32>,
        facts: BehaviorFacts,
    ) -> Self {
        self.behavior
            .entry(window_days)
            .or_insert_with(|| Some(HashMap::new()))
            .get_or_insert_with(HashMap::new)
            .insert(subject.into(), facts);
        self
    }

    /// Whether a window has already been fetched (successfully or not).
    pub fn has_window(&self, window_days: Option<u32>) -> bool {
        self.behavior.contains_key(&window_days)
    }

    /// Borrow the facts of one subject.
    pub fn subject<'a>(&'a self, subject: &'a SubjectId) -> SubjectFacts<'a> {
        SubjectFacts {
            snapshot: self,
            subject,
        }
    }
}

/// Read-only view of one subject's facts inside a [`FactsSnapshot`].
#[derive(Debug, Clone, Copy)]
pub struct SubjectFacts<'a> {
    snapshot: &'a FactsSnapshot,
    subject: &'a SubjectId,
}

impl<'a> SubjectFacts<'a> {
    pub fn subject_id(&self) -> &SubjectId {
        self.subject
    }

    /// Profile of the subject. `None` only when the lookup failed; a subject
    /// absent from a successful lookup has no tags and no mark.
    pub fn profile(&self) -> Option<&'a SubjectProfile> {
        let profiles = self.snapshot.profiles.as_ref()?;
        Some(
            profiles
                .get(self.subject)
                .unwrap_or_else(|| EMPTY_PROFILE.get_or_init(SubjectProfile::default)),
        )
    }

    /// Behavioral facts for a window. `None` when the window was not fetched
    /// or its lookup failed; a subject absent from a successful lookup has
    /// zero activity.
    pub fn behavior(&self, window_days: Option<u32>) -> Option<&'a BehaviorFacts> {
        let facts = self.snapshot.behavior.get(&window_days)?.as_ref()?;
        Some(facts.get(self.subject).unwrap_or(&NO_ACTIVITY))
    }
}
