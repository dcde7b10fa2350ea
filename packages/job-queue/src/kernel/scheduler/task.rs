//! Recurring task definitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::schedule;
use crate::error::{QueueError, Result};
use crate::kernel::jobs::{JobPriority, JobType, DEFAULT_MAX_RETRIES};

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    FixedTimeOfDay,
    IntervalMinutes,
    CronExpression,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::FixedTimeOfDay => "fixed_time_of_day",
            ScheduleKind::IntervalMinutes => "interval_minutes",
            ScheduleKind::CronExpression => "cron_expression",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed, validated trigger for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Every allowed day at `time` (local to the task's timezone). No days means every day.
    FixedTimeOfDay { time: NaiveTime, days: Vec<Weekday> },
    Interval { minutes: i32 },
    /// 5-field (minute precision) or 6/7-field cron expression.
    Cron { expr: String },
}

impl Schedule {
    pub fn daily_at(time: NaiveTime) -> Self {
        Schedule::FixedTimeOfDay { time, days: Vec::new() }
    }

    pub fn every_minutes(minutes: i32) -> Self {
        Schedule::Interval { minutes }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Schedule::Cron { expr: expr.into() }
    }

    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::FixedTimeOfDay { .. } => ScheduleKind::FixedTimeOfDay,
            Schedule::Interval { .. } => ScheduleKind::IntervalMinutes,
            Schedule::Cron { .. } => ScheduleKind::CronExpression,
        }
    }

    /// Check the schedule can produce run times.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Schedule::FixedTimeOfDay { .. } => Ok(()),
            Schedule::Interval { minutes } if *minutes > 0 => Ok(()),
            Schedule::Interval { minutes } => {
                Err(format!("interval must be positive, got {minutes} minutes"))
            }
            Schedule::Cron { expr } => schedule::parse_cron(expr).map(|_| ()),
        }
    }

    /// Next trigger strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> std::result::Result<DateTime<Utc>, String> {
        match self {
            Schedule::FixedTimeOfDay { time, days } => {
                schedule::next_fixed_time(after, *time, days, tz)
            }
            Schedule::Interval { minutes } => {
                if *minutes <= 0 {
                    return Err(format!("interval must be positive, got {minutes} minutes"));
                }
                Ok(after + chrono::Duration::minutes(i64::from(*minutes)))
            }
            Schedule::Cron { expr } => schedule::next_cron(expr, after, tz),
        }
    }
}

/// Row of `scheduled_tasks`.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub name: String,
    pub task_type: JobType,
    pub enabled: bool,

    pub schedule_kind: ScheduleKind,
    pub schedule_time: Option<NaiveTime>,
    pub schedule_days: Vec<String>,
    pub interval_minutes: Option<i32>,
    pub cron_expr: Option<String>,
    pub timezone: String,

    pub params: serde_json::Value,
    pub priority: JobPriority,
    pub max_retries: i32,

    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Materialize a freshly inserted row (used by the in-memory store).
    pub fn from_new(id: TaskId, new: NewScheduledTask, now: DateTime<Utc>) -> Self {
        let columns = ScheduleColumns::from(&new.schedule);
        Self {
            id,
            name: new.name,
            task_type: new.task_type,
            enabled: new.enabled,
            schedule_kind: new.schedule.kind(),
            schedule_time: columns.time,
            schedule_days: columns.days,
            interval_minutes: columns.interval_minutes,
            cron_expr: columns.cron_expr,
            timezone: new.timezone,
            params: new.params,
            priority: new.priority,
            max_retries: new.max_retries,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> QueueError {
        QueueError::InvalidSchedule {
            task: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Rebuild the schedule from whichever columns `schedule_kind` selects.
    pub fn schedule(&self) -> Result<Schedule> {
        let schedule = match self.schedule_kind {
            ScheduleKind::FixedTimeOfDay => {
                let time = self
                    .schedule_time
                    .ok_or_else(|| self.invalid("fixed_time_of_day requires schedule_time"))?;
                let days = self
                    .schedule_days
                    .iter()
                    .map(|day| {
                        Weekday::from_str(day.trim())
                            .map_err(|_| self.invalid(format!("unknown weekday '{day}'")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Schedule::FixedTimeOfDay { time, days }
            }
            ScheduleKind::IntervalMinutes => Schedule::Interval {
                minutes: self
                    .interval_minutes
                    .ok_or_else(|| self.invalid("interval_minutes requires interval_minutes"))?,
            },
            ScheduleKind::CronExpression => Schedule::Cron {
                expr: self
                    .cron_expr
                    .clone()
                    .ok_or_else(|| self.invalid("cron_expression requires cron_expr"))?,
            },
        };

        schedule.validate().map_err(|reason| self.invalid(reason))?;
        Ok(schedule)
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| self.invalid(format!("unknown timezone '{}'", self.timezone)))
    }

    /// `next_run_at` for a task that has none yet.
    ///
    /// Interval tasks are due `interval` after their last run, or right away if
    /// they never ran. Other kinds use the next trigger after `now`.
    pub fn first_run_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let schedule = self.schedule()?;
        let tz = self.tz()?;
        match (&schedule, self.last_run_at) {
            (Schedule::Interval { .. }, None) => Ok(now),
            (Schedule::Interval { .. }, Some(last)) => {
                schedule.next_after(last, tz).map_err(|r| self.invalid(r))
            }
            _ => schedule.next_after(now, tz).map_err(|r| self.invalid(r)),
        }
    }

    /// `next_run_at` after firing at `now`. Missed windows are coalesced.
    pub fn next_run_after_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let schedule = self.schedule()?;
        let tz = self.tz()?;
        schedule.next_after(now, tz).map_err(|r| self.invalid(r))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|at| at <= now)
    }
}

/// Insert parameters for a scheduled task.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewScheduledTask {
    pub name: String,
    pub task_type: JobType,
    pub schedule: Schedule,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default = "UTC".to_string())]
    pub timezone: String,
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub params: serde_json::Value,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
}

/// Column projection of a [`Schedule`], as stored in `scheduled_tasks`.
#[derive(Debug, Default)]
pub(crate) struct ScheduleColumns {
    pub time: Option<NaiveTime>,
    pub days: Vec<String>,
    pub interval_minutes: Option<i32>,
    pub cron_expr: Option<String>,
}

impl From<&Schedule> for ScheduleColumns {
    fn from(schedule: &Schedule) -> Self {
        match schedule {
            Schedule::FixedTimeOfDay { time, days } => Self {
                time: Some(*time),
                days: days.iter().map(|d| weekday_name(*d).to_string()).collect(),
                ..Default::default()
            },
            Schedule::Interval { minutes } => Self {
                interval_minutes: Some(*minutes),
                ..Default::default()
            },
            Schedule::Cron { expr } => Self {
                cron_expr: Some(expr.clone()),
                ..Default::default()
            },
        }
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}
