//! Recurring scheduler.
//!
//! - [`ScheduledTask`] - Task definition row (fixed time of day, interval or cron)
//! - [`RecurringScheduler`] - Leader-elected tick loop that turns due tasks into jobs

mod recurring;
mod schedule;
mod task;

pub use recurring::{RecurringScheduler, SchedulerConfig, TickReport};
pub use task::{NewScheduledTask, Schedule, ScheduleKind, ScheduledTask, TaskId};

pub(crate) use task::ScheduleColumns;
