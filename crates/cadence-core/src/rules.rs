use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// How a rule set combines its rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    /// Every rule must match (empty set matches).
    #[default]
    All,
    /// At least one rule must match (empty set never matches).
    Any,
}

/// Tag membership mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    /// Subject has at least one of the tags.
    #[default]
    AnyInclude,
    /// Subject has every one of the tags.
    AllInclude,
    /// Subject has none of the tags.
    AnyExclude,
    /// Subject is missing at least one of the tags.
    AllExclude,
}

/// Behavioral fact a rule compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorMetric {
    VisitCount,
    PurchaseAmount,
    DaysSinceLastVisit,
    ReorderCount,
}

/// Comparison operator for behavioral rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "within_days", alias = "within-days")]
    WithinDays,
    #[serde(rename = "before_days", alias = "before-days")]
    BeforeDays,
}

impl CompareOp {
    /// Whether the operator compares a date against `now - N days`.
    pub fn is_date_relative(self) -> bool {
        matches!(self, CompareOp::WithinDays | CompareOp::BeforeDays)
    }
}

/// A single predicate over a subject's facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionRule {
    /// Tag membership test.
    Tag {
        #[serde(rename = "tagIds")]
        tag_ids: Vec<String>,
        #[serde(rename = "match", default)]
        mode: TagMatch,
    },
    /// The subject's mark must be one of `values`.
    Mark { values: Vec<String> },
    /// Behavioral comparison against batched facts.
    Behavior {
        metric: BehaviorMetric,
        operator: CompareOp,
        value: serde_json::Value,
        /// Upper bound for `between`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value2: Option<serde_json::Value>,
        /// Restrict the aggregation to the last N days.
        #[serde(
            rename = "windowDays",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        window_days: Option<u32>,
    },
}

impl ConditionRule {
    /// Convenience constructor for a tag rule.
    pub fn tags<I, S>(mode: TagMatch, tag_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ConditionRule::Tag {
            tag_ids: tag_ids.into_iter().map(Into::into).collect(),
            mode,
        }
    }

    /// Convenience constructor for a behavioral rule with a single operand.
    pub fn behavior(metric: BehaviorMetric, operator: CompareOp, value: serde_json::Value) -> Self {
        ConditionRule::Behavior {
            metric,
            operator,
            value,
            value2: None,
            window_days: None,
        }
    }
}

/// An ordered list of rules plus the combinator joining them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default)]
    pub rules: Vec<ConditionRule>,
}

impl RuleSet {
    pub fn all(rules: Vec<ConditionRule>) -> Self {
        Self {
            combinator: Combinator::All,
            rules,
        }
    }

    pub fn any(rules: Vec<ConditionRule>) -> Self {
        Self {
            combinator: Combinator::Any,
            rules,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Distinct aggregation windows referenced by behavioral rules.
    pub fn behavior_windows(&self) -> BTreeSet<Option<u32>> {
        self.rules
            .iter()
            .filter_map(|r| match r {
                ConditionRule::Behavior { window_days, .. } => Some(*window_days),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_wire_format() {
        let json = r#"[
            {"type": "tag", "tagIds": ["vip", "new"], "match": "all_exclude"},
            {"type": "mark", "values": ["gold"]},
            {"type": "behavior", "metric": "visit_count", "operator": ">=", "value": 3},
            {"type": "behavior", "metric": "purchase_amount", "operator": "between",
             "value": 100, "value2": 500, "windowDays": 30},
            {"type": "behavior", "metric": "days_since_last_visit", "operator": "within-days", "value": 14}
        ]"#;
        let rules: Vec<ConditionRule> = serde_json::from_str(json).unwrap();
        assert_eq!(rules.len(), 5);
        assert!(matches!(
            rules[0],
            ConditionRule::Tag { mode: TagMatch::AllExclude, .. }
        ));
        assert!(matches!(
            rules[2],
            ConditionRule::Behavior { operator: CompareOp::Ge, .. }
        ));
        assert!(matches!(
            rules[4],
            ConditionRule::Behavior { operator: CompareOp::WithinDays, .. }
        ));
    }

    #[test]
    fn test_tag_match_defaults_to_any_include() {
        let rule: ConditionRule =
            serde_json::from_str(r#"{"type": "tag", "tagIds": ["a"]}"#).unwrap();
        assert_eq!(rule, ConditionRule::tags(TagMatch::AnyInclude, ["a"]));
    }

    #[test]
    fn test_behavior_windows() {
        let set = RuleSet::all(vec![
            ConditionRule::behavior(BehaviorMetric::VisitCount, CompareOp::Gt, 1.into()),
            ConditionRule::Behavior {
                metric: BehaviorMetric::PurchaseAmount,
                operator: CompareOp::Gt,
                value: 10.into(),
                value2: None,
                window_days: Some(30),
            },
            ConditionRule::tags(TagMatch::AnyInclude, ["x"]),
        ]);
        let windows: Vec<_> = set.behavior_windows().into_iter().collect();
        assert_eq!(windows, vec![None, Some(30)]);
    }
}
