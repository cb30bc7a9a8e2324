use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use cadence_core::error::{CadenceError, Result};
use cadence_core::facts::{BehaviorFacts, SubjectProfile};
use cadence_core::traits::FactsProvider;
use cadence_core::types::SubjectId;

/// Facts provider backed by in-memory maps, with switchable failures and
/// call counters.
#[derive(Default)]
pub struct StaticFacts {
    profiles: Mutex<HashMap<SubjectId, SubjectProfile>>,
    behavior: Mutex<HashMap<(Option<u32>, SubjectId), BehaviorFacts>>,
    fail_profiles: AtomicBool,
    fail_behavior: AtomicBool,
    profile_calls: AtomicUsize,
    behavior_calls: AtomicUsize,
}

impl StaticFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_profile(&self, subject: &str, profile: SubjectProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(SubjectId::from(subject), profile);
    }

    pub fn set_behavior(&self, subject: &str, window_days: Option<u32>, facts: BehaviorFacts) {
        self.behavior
            .lock()
            .unwrap()
            .insert((window_days, SubjectId::from(subject)), facts);
    }

    pub fn fail_profiles(&self, fail: bool) {
        self.fail_profiles.store(fail, Ordering::SeqCst);
    }

    pub fn fail_behavior(&self, fail: bool) {
        self.fail_behavior.store(fail, Ordering::SeqCst);
    }

    /// Number of batched profile lookups served so far.
    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    /// Number of batched behavioral lookups served so far.
    pub fn behavior_calls(&self) -> usize {
        self.behavior_calls.load(Ordering::SeqCst)
    }
}

impl FactsProvider for StaticFacts {
    fn profiles(
        &self,
        subjects: &[SubjectId],
    ) -> BoxFuture<'_, Result<HashMap<SubjectId, SubjectProfile>>> {
        let subjects = subjects.to_vec();
        Box::pin(async move {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_profiles.load(Ordering::SeqCst) {
                return Err(CadenceError::Facts("profiles unavailable".into()));
            }
            let profiles = self.profiles.lock().unwrap();
            Ok(subjects
                .into_iter()
                .filter_map(|s| profiles.get(&s).cloned().map(|p| (s, p)))
                .collect())
        })
    }

    fn behavior(
        &self,
        subjects: &[SubjectId],
        window_days: Option<u32>,
        _now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<HashMap<SubjectId, BehaviorFacts>>> {
        let subjects = subjects.to_vec();
        Box::pin(async move {
            self.behavior_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_behavior.load(Ordering::SeqCst) {
                return Err(CadenceError::Facts("behavior unavailable".into()));
            }
            let behavior = self.behavior.lock().unwrap();
            Ok(subjects
                .into_iter()
                .filter_map(|s| {
                    behavior
                        .get(&(window_days, s.clone()))
                        .cloned()
                        .map(|f| (s, f))
                })
                .collect())
        })
    }
}
