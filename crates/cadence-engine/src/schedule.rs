use chrono::{DateTime, Days, Duration, FixedOffset, NaiveTime, TimeZone, Utc};

use cadence_core::config::SchedulerConfig;
use cadence_core::error::Result;
use cadence_core::step::{DelaySpec, DelayUnit, Step};

/// 9999-12-31T23:59:59Z, the last instant with a four-digit year.
const LATEST_FIRE_SECS: i64 = 253_402_300_799;

/// Upper bound for computed fire times. Later instants cannot be stored as
/// fixed-width timestamps.
pub fn latest_fire() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_FIRE_SECS, 0).unwrap_or_default()
}

/// Computes when a delayed step becomes due.
///
/// Minute and hour delays are plain offsets from `now`. Day delays move the
/// civil date forward in a fixed UTC offset and fire at the step's send time,
/// or at the configured default time of day.
#[derive(Debug, Clone, Copy)]
pub struct DelayClock {
    zone: FixedOffset,
    anchor: NaiveTime,
}

impl DelayClock {
    pub fn new(zone: FixedOffset, anchor: NaiveTime) -> Self {
        Self { zone, anchor }
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        Ok(Self::new(config.timezone()?, config.anchor_time()?))
    }

    /// UTC instant at which a step with `delay` becomes due, never earlier than `now`.
    pub fn next_fire(&self, delay: &DelaySpec, now: DateTime<Utc>) -> DateTime<Utc> {
        if delay.is_zero() {
            return now;
        }
        let target = match delay.unit {
            DelayUnit::Minutes => now.checked_add_signed(Duration::minutes(delay.amount as i64)),
            DelayUnit::Hours => now.checked_add_signed(Duration::hours(delay.amount as i64)),
            DelayUnit::Days => self.anchored(delay, now),
        };
        let latest = latest_fire();
        target.map_or(latest, |t| t.min(latest)).max(now)
    }

    /// When `step` becomes due once the pointer lands on it. Condition steps
    /// are evaluated immediately.
    pub fn due_at(&self, step: &Step, now: DateTime<Utc>) -> DateTime<Utc> {
        if step.is_condition() {
            now
        } else {
            self.next_fire(&step.delay, now)
        }
    }

    fn anchored(&self, delay: &DelaySpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_date = now.with_timezone(&self.zone).date_naive();
        let date = local_date.checked_add_days(Days::new(delay.amount as u64))?;
        let time = delay.send_time.unwrap_or(self.anchor);
        self.zone
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|local| local.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn clock(offset_hours: i32) -> DelayClock {
        DelayClock::new(FixedOffset::east_opt(offset_hours * 3600).unwrap(), at(10, 0))
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_zero_delay_is_now() {
        let now = utc(2025, 3, 1, 8, 0);
        assert_eq!(clock(0).next_fire(&DelaySpec::immediate(), now), now);
        assert_eq!(clock(0).next_fire(&DelaySpec::days(0).at(at(9, 0)), now), now);
    }

    #[test]
    fn test_minutes_and_hours() {
        let now = utc(2025, 3, 1, 8, 0);
        assert_eq!(clock(0).next_fire(&DelaySpec::minutes(90), now), utc(2025, 3, 1, 9, 30));
        assert_eq!(clock(5).next_fire(&DelaySpec::hours(20), now), utc(2025, 3, 2, 4, 0));
    }

    #[test]
    fn test_days_anchor_to_default_time() {
        let now = utc(2025, 3, 1, 23, 30);
        assert_eq!(clock(0).next_fire(&DelaySpec::days(2), now), utc(2025, 3, 3, 10, 0));
    }

    #[test]
    fn test_days_use_step_send_time() {
        let now = utc(2025, 3, 1, 8, 0);
        let delay = DelaySpec::days(1).at(at(18, 45));
        assert_eq!(clock(0).next_fire(&delay, now), utc(2025, 3, 2, 18, 45));
    }

    #[test]
    fn test_days_follow_civil_date_in_offset() {
        // 2025-03-01 20:00 UTC is already 2025-03-02 05:00 at UTC+9.
        let now = utc(2025, 3, 1, 20, 0);
        // local 2025-03-03 10:00 +09:00 == 2025-03-03 01:00 UTC
        assert_eq!(clock(9).next_fire(&DelaySpec::days(1), now), utc(2025, 3, 3, 1, 0));

        // At UTC-5 the same instant is still 2025-03-01 15:00.
        // local 2025-03-02 10:00 -05:00 == 2025-03-02 15:00 UTC
        assert_eq!(clock(-5).next_fire(&DelaySpec::days(1), now), utc(2025, 3, 2, 15, 0));
    }

    #[test]
    fn test_condition_steps_are_due_immediately() {
        use cadence_core::rules::RuleSet;
        let now = utc(2025, 3, 1, 8, 0);
        let step = Step::condition(RuleSet::default(), None, None).with_delay(DelaySpec::days(3));
        assert_eq!(clock(0).due_at(&step, now), now);
        let step = Step::send_text("x").with_delay(DelaySpec::minutes(5));
        assert_eq!(clock(0).due_at(&step, now), utc(2025, 3, 1, 8, 5));
    }

    #[test]
    fn test_never_before_now() {
        let now = utc(2025, 3, 1, 8, 0);
        let clock = DelayClock::new(FixedOffset::east_opt(0).unwrap(), at(10, 0));
        assert!(clock.next_fire(&DelaySpec::days(1), now) > now);
    }

    #[test]
    fn test_fire_time_capped_at_year_9999() {
        let now = utc(9999, 6, 1, 8, 0);
        assert_eq!(
            clock(0).next_fire(&DelaySpec::days(3650), now),
            utc(9999, 12, 31, 23, 59) + Duration::seconds(59)
        );
        assert_eq!(
            clock(0).next_fire(&DelaySpec::days(u32::MAX), utc(2025, 1, 1, 0, 0)),
            latest_fire()
        );
    }
}
