//! Next-run computation for fixed-time and cron schedules.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// Parse a cron expression. Five-field expressions get a leading seconds field.
pub(crate) fn parse_cron(expr: &str) -> Result<cron::Schedule, String> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| format!("invalid cron '{expr}': {e}"))
}

pub(crate) fn next_cron(expr: &str, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, String> {
    let schedule = parse_cron(expr)?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|next| next.with_timezone(&Utc))
        .ok_or_else(|| format!("cron '{expr}' has no future occurrence"))
}

/// Next occurrence of `time` on an allowed day, strictly after `after`.
///
/// Local times that do not exist (DST gap) are skipped for that day; ambiguous
/// ones resolve to the earlier instant.
pub(crate) fn next_fixed_time(
    after: DateTime<Utc>,
    time: NaiveTime,
    days: &[Weekday],
    tz: Tz,
) -> Result<DateTime<Utc>, String> {
    let local_date = after.with_timezone(&tz).date_naive();

    for offset in 0..=8 {
        let Some(date) = local_date.checked_add_days(chrono::Days::new(offset)) else {
            break;
        };
        if !days.is_empty() && !days.contains(&date.weekday()) {
            continue;
        }

        let Some(candidate) = tz.from_local_datetime(&date.and_time(time)).earliest() else {
            continue;
        };
        let candidate = candidate.with_timezone(&Utc);
        if candidate > after {
            return Ok(candidate);
        }
    }

    Err(format!("no occurrence of {time} within the next week"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn fixed_time_later_today() {
        let after = utc(2026, 3, 2, 1, 0);
        let next = next_fixed_time(after, NaiveTime::from_hms_opt(3, 0, 0).unwrap(), &[], Tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2026, 3, 2, 3, 0));
    }

    #[test]
    fn fixed_time_already_passed_rolls_to_tomorrow() {
        let after = utc(2026, 3, 2, 3, 0);
        let next = next_fixed_time(after, NaiveTime::from_hms_opt(3, 0, 0).unwrap(), &[], Tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2026, 3, 3, 3, 0));
    }

    #[test]
    fn fixed_time_respects_allowed_days() {
        // 2026-03-02 is a Monday
        let after = utc(2026, 3, 2, 12, 0);
        let next = next_fixed_time(
            after,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            &[Weekday::Fri],
            Tz::UTC,
        )
        .unwrap();
        assert_eq!(next, utc(2026, 3, 6, 9, 0));
    }

    #[test]
    fn fixed_time_uses_task_timezone() {
        // 09:00 in New York during EST is 14:00 UTC
        let after = utc(2026, 1, 10, 0, 0);
        let next = next_fixed_time(
            after,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            &[],
            chrono_tz::America::New_York,
        )
        .unwrap();
        assert_eq!(next, utc(2026, 1, 10, 14, 0));
    }

    #[test]
    fn fixed_time_in_dst_gap_skips_to_next_day() {
        // 2026-03-08 02:30 does not exist in New York
        let after = utc(2026, 3, 8, 5, 0);
        let next = next_fixed_time(
            after,
            NaiveTime::from_hms_opt(2, 30, 0).unwrap(),
            &[],
            chrono_tz::America::New_York,
        )
        .unwrap();
        assert_eq!(next, utc(2026, 3, 9, 6, 30));
    }

    #[test]
    fn five_field_cron_is_accepted() {
        let after = utc(2026, 3, 2, 12, 7);
        let next = next_cron("*/15 * * * *", after, Tz::UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 2, 12, 15));
    }

    #[test]
    fn six_field_cron_is_accepted() {
        let after = utc(2026, 3, 2, 12, 7);
        let next = next_cron("0 0 * * * *", after, Tz::UTC).unwrap();
        assert_eq!(next, utc(2026, 3, 2, 13, 0));
    }

    #[test]
    fn garbage_cron_is_rejected() {
        assert!(parse_cron("every tuesday").is_err());
    }
}
