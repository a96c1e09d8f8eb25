use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    RemoveRole,
    Reminder,
    Birthday,
}

impl TaskType {
    pub fn as_i64(self) -> i64 {
        match self {
            TaskType::RemoveRole => 0,
            TaskType::Reminder => 1,
            TaskType::Birthday => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(TaskType::RemoveRole),
            1 => Some(TaskType::Reminder),
            2 => Some(TaskType::Birthday),
            _ => None,
        }
    }
}

/// A row of `scheduled_tasks`. `task_type` stays raw so unknown values can be reported.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: i64,
    pub guild_id: String,
    pub user_id: String,
    pub task_type: i64,
    pub process_after: DateTime<Utc>,
    pub payload: String,
}

impl ScheduledTask {
    pub fn kind(&self) -> Option<TaskType> {
        TaskType::from_i64(self.task_type)
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub guild_id: String,
    pub user_id: String,
    pub task_type: TaskType,
    pub process_after: DateTime<Utc>,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveRolePayload {
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub user_id: String,
    pub timezone: Option<String>,
    /// Minutes after local midnight.
    pub bedtime_minutes: Option<u32>,
    pub last_bedtime_notified: Option<DateTime<Utc>>,
    pub suppress_mentions: bool,
}

impl User {
    pub fn bedtime(&self) -> Option<NaiveTime> {
        let minutes = self.bedtime_minutes?;
        NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub id: i64,
    pub guild_id: String,
    pub user_id: String,
    pub added_by: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddQuote {
    Added(i64),
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetric {
    pub message_count: u64,
    pub distinct_days: u64,
}

pub(crate) fn from_unix(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}
