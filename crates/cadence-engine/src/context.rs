use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cadence_core::error::Result;
use cadence_core::facts::FactsSnapshot;
use cadence_core::rules::{ConditionRule, RuleSet};
use cadence_core::step::StepKind;
use cadence_core::traits::{FactsProvider, ScenarioStore};
use cadence_core::types::{Enrollment, Scenario, ScenarioId, SubjectId};

/// State scoped to one `tick()` invocation.
///
/// Scenarios are loaded at most once per tick; facts are fetched once for the
/// whole due-set.
#[derive(Default)]
pub(crate) struct TickContext {
    scenarios: HashMap<ScenarioId, Option<Arc<Scenario>>>,
}

impl TickContext {
    /// Load every scenario referenced by `due` that is not cached yet.
    pub async fn load_scenarios(&mut self, store: &dyn ScenarioStore, due: &[Enrollment]) -> Result<()> {
        for enrollment in due {
            if self.scenarios.contains_key(&enrollment.scenario_id) {
                continue;
            }
            let scenario = store.load_scenario(&enrollment.scenario_id).await?;
            if scenario.is_none() {
                warn!(scenario = %enrollment.scenario_id, "Enrollment references a missing scenario");
            }
            self.scenarios
                .insert(enrollment.scenario_id.clone(), scenario.map(Arc::new));
        }
        Ok(())
    }

    pub fn scenario(&self, id: &ScenarioId) -> Option<Arc<Scenario>> {
        self.scenarios.get(id).cloned().flatten()
    }

    /// Fetch the facts the due-set's current steps need, in one batch per kind.
    ///
    /// Provider failures are recorded as missing facts; they never abort the tick.
    pub async fn prefetch_facts(
        &self,
        provider: &dyn FactsProvider,
        due: &[Enrollment],
        now: DateTime<Utc>,
    ) -> FactsSnapshot {
        let mut needs_profiles = false;
        let mut windows = BTreeSet::new();
        let mut subjects = Vec::new();
        let mut seen = HashSet::new();

        for enrollment in due {
            let Some(scenario) = self.scenario(&enrollment.scenario_id) else {
                continue;
            };
            let Some(step) = scenario.steps.get(enrollment.current_step) else {
                continue;
            };

            let mut sets: Vec<&RuleSet> = Vec::with_capacity(2);
            if let Some(guard) = &step.exit {
                sets.push(&guard.rules);
            }
            if let StepKind::Condition { rules, .. } = &step.kind {
                sets.push(rules);
            }
            if sets.iter().all(|s| s.is_empty()) {
                continue;
            }

            for set in sets {
                needs_profiles |= set
                    .rules
                    .iter()
                    .any(|r| matches!(r, ConditionRule::Tag { .. } | ConditionRule::Mark { .. }));
                windows.extend(set.behavior_windows());
            }
            if seen.insert(enrollment.subject_id.clone()) {
                subjects.push(enrollment.subject_id.clone());
            }
        }

        let mut snapshot = FactsSnapshot::new();
        if subjects.is_empty() {
            return snapshot;
        }

        if needs_profiles {
            snapshot.set_profiles(lookup("profiles", provider.profiles(&subjects).await));
        }
        for window in windows {
            let facts = provider.behavior(&subjects, window, now).await;
            snapshot.set_behavior(window, lookup("behavior", facts));
        }

        debug!(subjects = subjects.len(), "Facts prefetched");
        snapshot
    }
}

fn lookup<T>(kind: &str, result: Result<HashMap<SubjectId, T>>) -> Option<HashMap<SubjectId, T>> {
    match result {
        Ok(facts) => Some(facts),
        Err(e) => {
            warn!(kind, error = %e, "Facts lookup failed; dependent rules will not match");
            None
        }
    }
}
