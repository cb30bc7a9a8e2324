//! Rule evaluation against prefetched facts.
//!
//! Evaluation never fails: anything that cannot be decided (non-numeric
//! operand, facts that could not be fetched) counts as "no match".

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use cadence_core::facts::{BehaviorFacts, SubjectFacts};
use cadence_core::rules::{BehaviorMetric, Combinator, CompareOp, ConditionRule, RuleSet, TagMatch};

/// Evaluate a rule set for one subject.
///
/// An empty `all` set matches; an empty `any` set does not.
pub fn evaluate(rules: &RuleSet, facts: &SubjectFacts<'_>, now: DateTime<Utc>) -> bool {
    match rules.combinator {
        Combinator::All => rules.rules.iter().all(|r| evaluate_rule(r, facts, now)),
        Combinator::Any => rules.rules.iter().any(|r| evaluate_rule(r, facts, now)),
    }
}

/// True when at least one of the rule sets matches.
pub fn evaluate_any_of(sets: &[RuleSet], facts: &SubjectFacts<'_>, now: DateTime<Utc>) -> bool {
    sets.iter().any(|set| evaluate(set, facts, now))
}

/// Evaluate a single rule.
pub fn evaluate_rule(rule: &ConditionRule, facts: &SubjectFacts<'_>, now: DateTime<Utc>) -> bool {
    match rule {
        ConditionRule::Tag { tag_ids, mode } => {
            let Some(profile) = facts.profile() else {
                return false;
            };
            let has = |id: &String| profile.tags.contains(id);
            match mode {
                TagMatch::AnyInclude => tag_ids.iter().any(has),
                TagMatch::AllInclude => tag_ids.iter().all(has),
                TagMatch::AnyExclude => !tag_ids.iter().any(has),
                TagMatch::AllExclude => !tag_ids.iter().all(has),
            }
        }
        ConditionRule::Mark { values } => facts
            .profile()
            .and_then(|p| p.mark.as_ref())
            .is_some_and(|mark| values.contains(mark)),
        ConditionRule::Behavior {
            metric,
            operator,
            value,
            value2,
            window_days,
        } => match facts.behavior(*window_days) {
            Some(behavior) => {
                compare_behavior(behavior, *metric, *operator, value, value2.as_ref(), now)
            }
            None => false,
        },
    }
}

fn compare_behavior(
    facts: &BehaviorFacts,
    metric: BehaviorMetric,
    operator: CompareOp,
    value: &Value,
    value2: Option<&Value>,
    now: DateTime<Utc>,
) -> bool {
    if operator.is_date_relative() {
        // Date operators only make sense against the last visit.
        if metric != BehaviorMetric::DaysSinceLastVisit {
            return false;
        }
        let (Some(last), Some(days)) = (facts.last_visit, operand(value)) else {
            return false;
        };
        let Some(cutoff) = days_before(now, days) else {
            return false;
        };
        return match operator {
            CompareOp::WithinDays => last >= cutoff,
            _ => last < cutoff,
        };
    }

    let Some(actual) = metric_value(facts, metric, now) else {
        return false;
    };
    let Some(expected) = operand(value) else {
        return false;
    };

    match operator {
        CompareOp::Eq => actual == expected,
        CompareOp::Ne => actual != expected,
        CompareOp::Gt => actual > expected,
        CompareOp::Ge => actual >= expected,
        CompareOp::Lt => actual < expected,
        CompareOp::Le => actual <= expected,
        CompareOp::Between => match value2.and_then(operand) {
            Some(upper) => actual >= expected && actual <= upper,
            None => false,
        },
        CompareOp::WithinDays | CompareOp::BeforeDays => false,
    }
}

fn metric_value(facts: &BehaviorFacts, metric: BehaviorMetric, now: DateTime<Utc>) -> Option<f64> {
    match metric {
        BehaviorMetric::VisitCount => Some(facts.visit_count as f64),
        BehaviorMetric::PurchaseAmount => Some(facts.purchase_total),
        BehaviorMetric::ReorderCount => Some(facts.reorder_count as f64),
        BehaviorMetric::DaysSinceLastVisit => facts
            .last_visit
            .map(|last| (now - last).num_days() as f64),
    }
}

/// Numeric operand from a JSON number or a numeric string.
fn operand(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn days_before(now: DateTime<Utc>, days: f64) -> Option<DateTime<Utc>> {
    if !(0.0..=36_500.0).contains(&days) {
        return None;
    }
    let minutes = (days * 24.0 * 60.0).round() as i64;
    now.checked_sub_signed(Duration::minutes(minutes))
}
