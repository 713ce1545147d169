use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::scheduler::DigestSchedule;

/// How long after its target time a digest stays eligible for dispatch.
pub const DEFAULT_DUE_WINDOW_MINUTES: i64 = 5;
/// Minimum gap between two dispatches of the same digest. Slightly under a
/// day so a run that fired late yesterday does not block today's window.
pub const DEFAULT_COOLDOWN_HOURS: i64 = 23;

pub fn parse_schedule_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

/// Today's target instant for the schedule, in UTC. None when the timezone
/// or time-of-day is unparseable, or when the local target does not exist
/// (DST gap); such a schedule waits for the next valid day.
fn scheduled_instant(schedule: &DigestSchedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz: Tz = schedule.time_zone.parse().ok()?;
    let time = parse_schedule_time(&schedule.schedule_time)?;
    let local_date = now.with_timezone(&tz).date_naive();
    let target = tz.from_local_datetime(&local_date.and_time(time)).single()?;
    Some(target.with_timezone(&Utc))
}

pub fn cooldown_satisfied(
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> bool {
    match last_run_at {
        Some(last) => now - last > cooldown,
        None => true,
    }
}

/// Whether a digest should fire at `now`: active, inside the window after
/// its in-timezone target time, and past the cooldown since its last run.
/// The window is one-sided; a digest never fires before its target.
pub fn digest_due(
    schedule: &DigestSchedule,
    now: DateTime<Utc>,
    window: Duration,
    cooldown: Duration,
) -> bool {
    if !schedule.is_active {
        return false;
    }
    let Some(target) = scheduled_instant(schedule, now) else {
        return false;
    };
    let elapsed = now - target;
    if elapsed < Duration::zero() || elapsed > window {
        return false;
    }
    cooldown_satisfied(schedule.last_run_at, now, cooldown)
}

/// The next target instant strictly after `now`. Scans a few days forward so
/// a target erased by a DST gap resolves to the next valid day.
pub fn next_digest_run(schedule: &DigestSchedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz: Tz = schedule.time_zone.parse().ok()?;
    let time = parse_schedule_time(&schedule.schedule_time)?;
    let local_date = now.with_timezone(&tz).date_naive();
    for offset in 0..3 {
        let date = local_date + Duration::days(offset);
        if let Some(target) = tz.from_local_datetime(&date.and_time(time)).single() {
            let target = target.with_timezone(&Utc);
            if target > now {
                return Some(target);
            }
        }
    }
    None
}
