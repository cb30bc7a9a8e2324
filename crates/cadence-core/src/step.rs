use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::rules::{Combinator, ConditionRule, RuleSet};

/// Granularity of a step delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    #[default]
    Minutes,
    Hours,
    Days,
}

/// How long to wait before a step fires, relative to the previous transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelaySpec {
    pub unit: DelayUnit,
    pub amount: u32,
    /// Time-of-day anchor for day delays (civil time of the configured zone).
    pub send_time: Option<NaiveTime>,
}

impl DelaySpec {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn minutes(amount: u32) -> Self {
        Self {
            unit: DelayUnit::Minutes,
            amount,
            send_time: None,
        }
    }

    pub fn hours(amount: u32) -> Self {
        Self {
            unit: DelayUnit::Hours,
            amount,
            send_time: None,
        }
    }

    pub fn days(amount: u32) -> Self {
        Self {
            unit: DelayUnit::Days,
            amount,
            send_time: None,
        }
    }

    pub fn at(mut self, send_time: NaiveTime) -> Self {
        self.send_time = Some(send_time);
        self
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    /// Largest `amount` accepted for `unit`: [`MAX_DELAY_DAYS`] expressed in that unit.
    pub fn max_amount(unit: DelayUnit) -> u32 {
        match unit {
            DelayUnit::Minutes => MAX_DELAY_DAYS * 24 * 60,
            DelayUnit::Hours => MAX_DELAY_DAYS * 24,
            DelayUnit::Days => MAX_DELAY_DAYS,
        }
    }
}

/// Longest delay a step may declare, in days.
pub const MAX_DELAY_DAYS: u32 = 3650;

/// What happens when a step's exit rules match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Leave the scenario; the step's action never runs.
    Terminate,
    /// Move to the next step without running this one.
    Skip,
    /// Move to the given step index without running this one.
    JumpTo(usize),
}

/// Optional guard evaluated before a non-condition step runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitGuard {
    pub rules: RuleSet,
    pub action: ExitAction,
}

/// The kind-specific part of a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    SendText {
        content: String,
    },
    SendTemplate {
        template_id: String,
    },
    Condition {
        rules: RuleSet,
        true_target: Option<usize>,
        false_target: Option<usize>,
    },
    TagAdd {
        tag_id: String,
    },
    TagRemove {
        tag_id: String,
    },
    MarkChange {
        mark: String,
    },
    MenuChange {
        menu_id: String,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::SendText { .. } => StepType::SendText,
            StepKind::SendTemplate { .. } => StepType::SendTemplate,
            StepKind::Condition { .. } => StepType::Condition,
            StepKind::TagAdd { .. } => StepType::TagAdd,
            StepKind::TagRemove { .. } => StepType::TagRemove,
            StepKind::MarkChange { .. } => StepType::MarkChange,
            StepKind::MenuChange { .. } => StepType::MenuChange,
        }
    }

    pub fn is_condition(&self) -> bool {
        matches!(self, StepKind::Condition { .. })
    }
}

/// One element of a step program.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub kind: StepKind,
    pub delay: DelaySpec,
    pub exit: Option<ExitGuard>,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            delay: DelaySpec::immediate(),
            exit: None,
        }
    }

    pub fn send_text(content: impl Into<String>) -> Self {
        Self::new(StepKind::SendText {
            content: content.into(),
        })
    }

    pub fn condition(rules: RuleSet, true_target: Option<usize>, false_target: Option<usize>) -> Self {
        Self::new(StepKind::Condition {
            rules,
            true_target,
            false_target,
        })
    }

    pub fn tag_add(tag_id: impl Into<String>) -> Self {
        Self::new(StepKind::TagAdd {
            tag_id: tag_id.into(),
        })
    }

    pub fn menu_change(menu_id: impl Into<String>) -> Self {
        Self::new(StepKind::MenuChange {
            menu_id: menu_id.into(),
        })
    }

    pub fn with_delay(mut self, delay: DelaySpec) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_exit(mut self, rules: RuleSet, action: ExitAction) -> Self {
        self.exit = Some(ExitGuard { rules, action });
        self
    }

    pub fn is_condition(&self) -> bool {
        self.kind.is_condition()
    }
}

/// The ordered list of steps that defines a scenario.
///
/// Construction always validates: branch and jump targets index this program
/// and every step carries the payload its kind needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StepRecord>", into = "Vec<StepRecord>")]
pub struct StepProgram {
    steps: Vec<Step>,
}

impl StepProgram {
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        let program = Self { steps };
        program.validate()?;
        Ok(program)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    /// Check targets and payloads.
    pub fn validate(&self) -> Result<()> {
        let len = self.steps.len();
        let in_range = |index: usize, target: usize, what: &str| {
            if target < len {
                Ok(())
            } else {
                Err(CadenceError::invalid_step(
                    index,
                    format!("{} {} is outside the program (len {})", what, target, len),
                ))
            }
        };

        for (index, step) in self.steps.iter().enumerate() {
            let limit = DelaySpec::max_amount(step.delay.unit);
            if step.delay.amount > limit {
                return Err(CadenceError::invalid_step(
                    index,
                    format!(
                        "delay of {} {:?} exceeds the {} day limit",
                        step.delay.amount, step.delay.unit, MAX_DELAY_DAYS
                    )
                    .to_lowercase(),
                ));
            }

            match &step.kind {
                StepKind::Condition {
                    true_target,
                    false_target,
                    ..
                } => {
                    if let Some(t) = true_target {
                        in_range(index, *t, "true branch")?;
                    }
                    if let Some(t) = false_target {
                        in_range(index, *t, "false branch")?;
                    }
                    if step.exit.is_some() {
                        return Err(CadenceError::invalid_step(
                            index,
                            "condition steps cannot carry exit rules",
                        ));
                    }
                }
                StepKind::SendText { content } => require(index, content, "content")?,
                StepKind::SendTemplate { template_id } => require(index, template_id, "templateId")?,
                StepKind::TagAdd { tag_id } | StepKind::TagRemove { tag_id } => {
                    require(index, tag_id, "tagId")?
                }
                StepKind::MarkChange { mark } => require(index, mark, "mark")?,
                StepKind::MenuChange { menu_id } => require(index, menu_id, "menuId")?,
            }

            if let Some(guard) = &step.exit {
                if guard.rules.is_empty() {
                    return Err(CadenceError::invalid_step(
                        index,
                        "exit guard needs at least one rule",
                    ));
                }
                if let ExitAction::JumpTo(target) = guard.action {
                    in_range(index, target, "exit jump")?;
                }
            }
        }
        Ok(())
    }

    /// Convert to the persisted record list.
    pub fn to_records(&self) -> Vec<StepRecord> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepRecord::from_step(i, s))
            .collect()
    }

    /// Build from persisted records, ordered by `sortOrder`.
    pub fn from_records(mut records: Vec<StepRecord>) -> Result<Self> {
        records.sort_by_key(|r| r.sort_order);
        let steps = records
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.into_step(i))
            .collect::<Result<Vec<_>>>()?;
        Self::new(steps)
    }
}

fn require(index: usize, value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(CadenceError::invalid_step(
            index,
            format!("{} must not be empty", field),
        ))
    } else {
        Ok(())
    }
}

impl TryFrom<Vec<StepRecord>> for StepProgram {
    type Error = CadenceError;

    fn try_from(records: Vec<StepRecord>) -> Result<Self> {
        Self::from_records(records)
    }
}

impl From<StepProgram> for Vec<StepRecord> {
    fn from(program: StepProgram) -> Self {
        program.to_records()
    }
}

/// Persisted step type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SendText,
    SendTemplate,
    Condition,
    TagAdd,
    TagRemove,
    MarkChange,
    MenuChange,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::SendText => "send_text",
            StepType::SendTemplate => "send_template",
            StepType::Condition => "condition",
            StepType::TagAdd => "tag_add",
            StepType::TagRemove => "tag_remove",
            StepType::MarkChange => "mark_change",
            StepType::MenuChange => "menu_change",
        }
    }
}

/// Persisted exit action tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitActionKind {
    #[default]
    Terminate,
    Skip,
    Jump,
}

/// Flat, persisted shape of one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    #[serde(default)]
    pub sort_order: usize,
    pub step_type: Option<StepType>,
    #[serde(default)]
    pub delay_type: DelayUnit,
    #[serde(default)]
    pub delay_value: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu_id: Option<String>,
    #[serde(default)]
    pub condition_rules: Vec<ConditionRule>,
    #[serde(default)]
    pub condition_match: Combinator,
    #[serde(default)]
    pub branch_true_step: Option<usize>,
    #[serde(default)]
    pub branch_false_step: Option<usize>,
    #[serde(default)]
    pub exit_condition_rules: Vec<ConditionRule>,
    #[serde(default)]
    pub exit_match: Combinator,
    #[serde(default)]
    pub exit_action: ExitActionKind,
    #[serde(default)]
    pub exit_jump_to: Option<usize>,
}

impl StepRecord {
    pub fn from_step(index: usize, step: &Step) -> Self {
        let mut record = StepRecord {
            sort_order: index,
            step_type: Some(step.kind.step_type()),
            delay_type: step.delay.unit,
            delay_value: step.delay.amount,
            send_time: step.delay.send_time.map(format_send_time),
            ..Default::default()
        };

        match &step.kind {
            StepKind::SendText { content } => record.content = Some(content.clone()),
            StepKind::SendTemplate { template_id } => record.template_id = Some(template_id.clone()),
            StepKind::Condition {
                rules,
                true_target,
                false_target,
            } => {
                record.condition_rules = rules.rules.clone();
                record.condition_match = rules.combinator;
                record.branch_true_step = *true_target;
                record.branch_false_step = *false_target;
            }
            StepKind::TagAdd { tag_id } | StepKind::TagRemove { tag_id } => {
                record.tag_id = Some(tag_id.clone())
            }
            StepKind::MarkChange { mark } => record.mark = Some(mark.clone()),
            StepKind::MenuChange { menu_id } => record.menu_id = Some(menu_id.clone()),
        }

        if let Some(guard) = &step.exit {
            record.exit_condition_rules = guard.rules.rules.clone();
            record.exit_match = guard.rules.combinator;
            match guard.action {
                ExitAction::Terminate => record.exit_action = ExitActionKind::Terminate,
                ExitAction::Skip => record.exit_action = ExitActionKind::Skip,
                ExitAction::JumpTo(target) => {
                    record.exit_action = ExitActionKind::Jump;
                    record.exit_jump_to = Some(target);
                }
            }
        }

        record
    }

    /// Convert into a domain step. `index` is only used for error reporting.
    pub fn into_step(self, index: usize) -> Result<Step> {
        let step_type = self
            .step_type
            .ok_or_else(|| CadenceError::invalid_step(index, "stepType is missing"))?;

        let missing = |field: &str| {
            CadenceError::invalid_step(
                index,
                format!("{} step requires {}", step_type.as_str(), field),
            )
        };

        let kind = match step_type {
            StepType::SendText => StepKind::SendText {
                content: self.content.ok_or_else(|| missing("content"))?,
            },
            StepType::SendTemplate => StepKind::SendTemplate {
                template_id: self.template_id.ok_or_else(|| missing("templateId"))?,
            },
            StepType::Condition => StepKind::Condition {
                rules: RuleSet {
                    combinator: self.condition_match,
                    rules: self.condition_rules,
                },
                true_target: self.branch_true_step,
                false_target: self.branch_false_step,
            },
            StepType::TagAdd => StepKind::TagAdd {
                tag_id: self.tag_id.ok_or_else(|| missing("tagId"))?,
            },
            StepType::TagRemove => StepKind::TagRemove {
                tag_id: self.tag_id.ok_or_else(|| missing("tagId"))?,
            },
            StepType::MarkChange => StepKind::MarkChange {
                mark: self.mark.ok_or_else(|| missing("mark"))?,
            },
            StepType::MenuChange => StepKind::MenuChange {
                menu_id: self.menu_id.ok_or_else(|| missing("menuId"))?,
            },
        };

        if step_type != StepType::Condition
            && (self.branch_true_step.is_some() || self.branch_false_step.is_some())
        {
            return Err(CadenceError::invalid_step(
                index,
                "branch targets are only valid on condition steps",
            ));
        }

        let exit = if self.exit_condition_rules.is_empty() {
            None
        } else {
            let action = match self.exit_action {
                ExitActionKind::Terminate => ExitAction::Terminate,
                ExitActionKind::Skip => ExitAction::Skip,
                ExitActionKind::Jump => ExitAction::JumpTo(
                    self.exit_jump_to
                        .ok_or_else(|| CadenceError::invalid_step(index, "exit jump requires exitJumpTo"))?,
                ),
            };
            Some(ExitGuard {
                rules: RuleSet {
                    combinator: self.exit_match,
                    rules: self.exit_condition_rules,
                },
                action,
            })
        };

        let send_time = self
            .send_time
            .as_deref()
            .map(|s| parse_send_time(s).ok_or_else(|| {
                CadenceError::invalid_step(index, format!("invalid sendTime '{}'", s))
            }))
            .transpose()?;

        Ok(Step {
            kind,
            delay: DelaySpec {
                unit: self.delay_type,
                amount: self.delay_value,
                send_time,
            },
            exit,
        })
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_send_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
        .ok()
}

/// Format as `HH:MM`, keeping seconds only when they are non-zero.
pub fn format_send_time(t: NaiveTime) -> String {
    use chrono::Timelike;
    if t.second() == 0 {
        t.format("%H:%M").to_string()
    } else {
        t.format("%H:%M:%S").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{BehaviorMetric, CompareOp, TagMatch};

    fn sample_program() -> StepProgram {
        StepProgram::new(vec![
            Step::send_text("Welcome!"),
            Step::condition(
                RuleSet::all(vec![ConditionRule::tags(TagMatch::AnyInclude, ["vip"])]),
                Some(3),
                Some(2),
            ),
            Step::tag_add("followup").with_delay(DelaySpec::hours(1)),
            Step::menu_change("menu-b").with_exit(
                RuleSet::any(vec![ConditionRule::behavior(
                    BehaviorMetric::VisitCount,
                    CompareOp::Ge,
                    5.into(),
                )]),
                ExitAction::JumpTo(0),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_delay_beyond_limit_rejected() {
        let err = StepProgram::new(vec![
            Step::send_text("hi"),
            Step::send_text("far").with_delay(DelaySpec::days(3_000_000)),
        ])
        .unwrap_err();
        match err {
            CadenceError::InvalidStep { index, message } => {
                assert_eq!(index, 1);
                assert!(message.contains("3650 day limit"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(StepProgram::new(vec![
            Step::send_text("x").with_delay(DelaySpec::minutes(MAX_DELAY_DAYS * 24 * 60 + 1))
        ])
        .is_err());
        assert!(StepProgram::new(vec![
            Step::send_text("x").with_delay(DelaySpec::hours(MAX_DELAY_DAYS * 24))
        ])
        .is_ok());
        assert!(StepProgram::new(vec![
            Step::send_text("x").with_delay(DelaySpec::days(MAX_DELAY_DAYS))
        ])
        .is_ok());
    }

    #[test]
    fn test_records_roundtrip() {
        let program = sample_program();
        let json = serde_json::to_string(&program).unwrap();
        let parsed: StepProgram = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, program);
    }

    #[test]
    fn test_records_wire_shape() {
        let program = sample_program();
        let value = serde_json::to_value(&program).unwrap();
        assert_eq!(value[0]["stepType"], "send_text");
        assert_eq!(value[1]["branchTrueStep"], 3);
        assert_eq!(value[2]["delayType"], "hours");
        assert_eq!(value[2]["delayValue"], 1);
        assert_eq!(value[3]["exitAction"], "jump");
        assert_eq!(value[3]["exitJumpTo"], 0);
    }

    #[test]
    fn test_from_records_sorts_by_sort_order() {
        let records = vec![
            StepRecord {
                sort_order: 1,
                step_type: Some(StepType::TagAdd),
                tag_id: Some("b".into()),
                ..Default::default()
            },
            StepRecord {
                sort_order: 0,
                step_type: Some(StepType::TagAdd),
                tag_id: Some("a".into()),
                ..Default::default()
            },
        ];
        let program = StepProgram::from_records(records).unwrap();
        assert_eq!(
            program.get(0).unwrap().kind,
            StepKind::TagAdd { tag_id: "a".into() }
        );
    }

    #[test]
    fn test_dangling_branch_rejected() {
        let err = StepProgram::new(vec![Step::condition(RuleSet::default(), Some(5), None)])
            .unwrap_err();
        assert!(matches!(err, CadenceError::InvalidStep { index: 0, .. }));
    }

    #[test]
    fn test_missing_payload_rejected() {
        let record = StepRecord {
            step_type: Some(StepType::SendTemplate),
            ..Default::default()
        };
        let err = StepProgram::from_records(vec![record]).unwrap_err();
        assert!(err.to_string().contains("templateId"));

        let err = StepProgram::new(vec![Step::send_text("   ")]).unwrap_err();
        assert!(err.to_string().contains("content"));
    }

    #[test]
    fn test_branch_on_action_step_rejected() {
        let record = StepRecord {
            step_type: Some(StepType::TagAdd),
            tag_id: Some("t".into()),
            branch_true_step: Some(0),
            ..Default::default()
        };
        assert!(StepProgram::from_records(vec![record]).is_err());
    }

    #[test]
    fn test_send_time_parsing() {
        let t = parse_send_time("09:30").unwrap();
        assert_eq!(format_send_time(t), "09:30");
        let t = parse_send_time("09:30:15").unwrap();
        assert_eq!(format_send_time(t), "09:30:15");
        assert!(parse_send_time("25:00").is_none());

        let record = StepRecord {
            step_type: Some(StepType::SendText),
            content: Some("hi".into()),
            delay_type: DelayUnit::Days,
            delay_value: 2,
            send_time: Some("nope".into()),
            ..Default::default()
        };
        assert!(record.into_step(0).is_err());
    }
}
