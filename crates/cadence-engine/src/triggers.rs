//! Event entry points that enroll subjects into matching scenarios.

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use tracing::{debug, info, warn};

use cadence_core::error::Result;
use cadence_core::types::{
    EnrollmentId, EnrollmentStatus, KeywordMatch, Scenario, ScenarioId, SubjectId, Trigger,
};

use crate::engine::{EnrollOutcome, Engine};

/// Enrollment results for one triggering event, per matched scenario.
pub type TriggerOutcomes = Vec<(ScenarioId, EnrollOutcome)>;

/// Result of a tag-assigned event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagOutcome {
    pub enrolled: TriggerOutcomes,
    /// Active enrollments fast-forwarded by a tag jump.
    pub jumped: Vec<EnrollmentId>,
}

/// Whether a keyword trigger accepts the incoming text.
///
/// Exact and contains compare case-insensitively after trimming; regex
/// patterns are matched as written.
pub fn keyword_matches(pattern: &str, mode: KeywordMatch, text: &str) -> bool {
    let text = text.trim();
    match mode {
        KeywordMatch::Exact => text.eq_ignore_ascii_case(pattern.trim()),
        KeywordMatch::Contains => {
            let pattern = pattern.trim().to_lowercase();
            !pattern.is_empty() && text.to_lowercase().contains(&pattern)
        }
        KeywordMatch::Regex => match RegexBuilder::new(pattern).size_limit(1 << 20).build() {
            Ok(re) => re.is_match(text),
            Err(e) => {
                warn!(pattern, error = %e, "Invalid keyword regex");
                false
            }
        },
    }
}

impl Engine {
    /// The subject became eligible (registered, linked an account).
    pub async fn on_eligible(&self, subject: &SubjectId) -> Result<TriggerOutcomes> {
        self.on_eligible_at(subject, Utc::now()).await
    }

    pub async fn on_eligible_at(&self, subject: &SubjectId, now: DateTime<Utc>) -> Result<TriggerOutcomes> {
        self.enroll_matching(subject, now, |t| matches!(t, Trigger::Eligible))
            .await
    }

    /// The subject sent a message.
    pub async fn on_keyword(&self, subject: &SubjectId, text: &str) -> Result<TriggerOutcomes> {
        self.on_keyword_at(subject, text, Utc::now()).await
    }

    pub async fn on_keyword_at(
        &self,
        subject: &SubjectId,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcomes> {
        self.enroll_matching(subject, now, |t| match t {
            Trigger::Keyword { pattern, mode } => keyword_matches(pattern, *mode, text),
            _ => false,
        })
        .await
    }

    /// A tag was assigned to the subject.
    ///
    /// Enrolls into scenarios triggered by the tag, then fast-forwards the
    /// subject's active enrollments whose scenario declares a jump for it.
    pub async fn on_tag_assigned(&self, subject: &SubjectId, tag_id: &str) -> Result<TagOutcome> {
        self.on_tag_assigned_at(subject, tag_id, Utc::now()).await
    }

    pub async fn on_tag_assigned_at(
        &self,
        subject: &SubjectId,
        tag_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TagOutcome> {
        // Jumps apply to enrollments that existed before this event.
        let active: Vec<_> = self
            .subject_enrollments(subject)
            .await?
            .into_iter()
            .filter(|e| e.status == EnrollmentStatus::Active)
            .collect();

        let enrolled = self
            .enroll_matching(subject, now, |t| {
                matches!(t, Trigger::TagAssigned { tag_id: wanted } if wanted == tag_id)
            })
            .await?;

        let mut jumped = Vec::new();
        for enrollment in active {
            let scenario = match self.load_scenario(&enrollment.scenario_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(enrollment = %enrollment.id, error = %e, "Cannot load scenario for tag jump");
                    continue;
                }
            };
            let Some(jump) = scenario.tag_jumps.iter().find(|j| j.tag_id == tag_id) else {
                continue;
            };
            if self.jump_to_at(enrollment.id, jump.target_step, now).await? {
                jumped.push(enrollment.id);
            }
        }

        Ok(TagOutcome { enrolled, jumped })
    }

    async fn enroll_matching<F>(
        &self,
        subject: &SubjectId,
        now: DateTime<Utc>,
        accepts: F,
    ) -> Result<TriggerOutcomes>
    where
        F: Fn(&Trigger) -> bool,
    {
        let candidates: Vec<Scenario> = self
            .list_scenarios()
            .await?
            .into_iter()
            .filter(|s| s.enabled && accepts(&s.trigger))
            .collect();

        let mut outcomes = Vec::with_capacity(candidates.len());
        for scenario in candidates {
            match self.enroll_into(&scenario, subject, now).await {
                Ok(outcome) => outcomes.push((scenario.id.clone(), outcome)),
                Err(e) => {
                    warn!(scenario = %scenario.id, subject = %subject, error = %e, "Trigger enrollment failed");
                }
            }
        }

        if outcomes.is_empty() {
            debug!(subject = %subject, "No scenario matched trigger");
        } else {
            info!(subject = %subject, matched = outcomes.len(), "Trigger matched scenarios");
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_keyword() {
        assert!(keyword_matches("BOOK", KeywordMatch::Exact, "  book "));
        assert!(!keyword_matches("book", KeywordMatch::Exact, "book now"));
    }

    #[test]
    fn test_contains_keyword() {
        assert!(keyword_matches("book", KeywordMatch::Contains, "I want to BOOK a visit"));
        assert!(!keyword_matches("cancel", KeywordMatch::Contains, "book"));
        assert!(!keyword_matches("  ", KeywordMatch::Contains, "anything"));
    }

    #[test]
    fn test_regex_keyword() {
        assert!(keyword_matches(r"^(hi|hello)\b", KeywordMatch::Regex, "hello there"));
        assert!(!keyword_matches(r"^(hi|hello)\b", KeywordMatch::Regex, "oh hello"));
        assert!(!keyword_matches("(", KeywordMatch::Regex, "("));
    }
}
