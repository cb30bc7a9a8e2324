use std::io::Write;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::NamedTempFile;

use cadence_core::rules::{ConditionRule, RuleSet, TagMatch};
use cadence_core::step::{DelaySpec, Step, StepProgram};
use cadence_core::types::{Scenario, Trigger};

/// UTC instant shorthand.
pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .expect("valid fixture timestamp")
}

/// `[SendText, Condition(vip: true→3, false→2), TagAdd after 1h, MenuChange]`.
pub fn vip_program() -> StepProgram {
    StepProgram::new(vec![
        Step::send_text("Welcome to the clinic"),
        Step::condition(
            RuleSet::all(vec![ConditionRule::tags(TagMatch::AnyInclude, ["vip"])]),
            Some(3),
            Some(2),
        ),
        Step::tag_add("followup").with_delay(DelaySpec::hours(1)),
        Step::menu_change("menu-b"),
    ])
    .expect("valid fixture program")
}

/// A manual-trigger scenario around [`vip_program`].
pub fn vip_scenario(id: &str) -> Scenario {
    Scenario::new(id, "VIP onboarding", Trigger::Manual, vip_program())
}

/// Single-step scenario with the given trigger.
pub fn greeting_scenario(id: &str, trigger: Trigger) -> Scenario {
    Scenario::new(
        id,
        format!("Greeting {}", id),
        trigger,
        StepProgram::new(vec![Step::send_text(format!("hello from {}", id))])
            .expect("valid fixture program"),
    )
}

/// Write a TOML config to a temporary file.
pub fn temp_config(toml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(toml.as_bytes()).expect("write temp config");
    file
}
