//! Task pipeline data model: functions, tasks, and crontabs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::BusTrackError;

/// A stored script plus the environment bindings it runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    /// Script source text.
    pub code: String,
    /// Name → value bindings exposed to the script.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Task lifecycle: `pending → running → done`. `done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = BusTrackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            other => Err(BusTrackError::Store(format!("unknown task status '{other}'"))),
        }
    }
}

/// One scheduled or ad hoc execution attempt of a [`Function`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub function_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    /// Persisted outcome; empty string when the task failed.
    pub result: Option<String>,
    /// Failure message; empty string when the task succeeded.
    pub error: Option<String>,
    /// The crontab that generated this task, if any.
    pub cron_id: Option<String>,
}

/// The identity handed from the claimer to an execution worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task_id: String,
    pub function_id: String,
    pub started_at: DateTime<Utc>,
}

/// A recurring schedule that generates tasks for a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crontab {
    pub id: String,
    pub function_id: String,
    pub user_id: String,
    /// 5-field cron expression: minute hour day-of-month month day-of-week.
    pub expression: String,
    pub next_run_at: DateTime<Utc>,
}

impl Crontab {
    /// Whether this schedule should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }
}

/// Fixed-width RFC 3339 rendering, so stored timestamps sort lexicographically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp previously written by [`format_timestamp`].
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, BusTrackError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| BusTrackError::Store(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_roundtrip_names() {
        for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Done] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("finished".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Done.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2026, 2, 22, 9, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap();
        let (sa, sb) = (format_timestamp(a), format_timestamp(b));
        assert!(sa < sb);
        assert_eq!(sa, "2026-02-22T09:00:00.000Z");
        assert_eq!(parse_timestamp(&sa).unwrap(), a);
    }

    #[test]
    fn test_crontab_due() {
        let at = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let cron = Crontab {
            id: "c1".into(),
            function_id: "f1".into(),
            user_id: "u1".into(),
            expression: "0 * * * *".into(),
            next_run_at: at,
        };
        assert!(cron.is_due(at));
        assert!(cron.is_due(at + chrono::Duration::minutes(1)));
        assert!(!cron.is_due(at - chrono::Duration::seconds(1)));
    }
}
