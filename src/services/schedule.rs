use crate::db::{Database, NewTask, ReminderPayload, RemoveRolePayload, ScheduledTask, TaskType};
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, GuildId, RoleId, UserId};

/// Typed access to the `scheduled_tasks` table.
#[derive(Clone)]
pub struct ScheduleService {
    db: Database,
}

impl ScheduleService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn create(&self, task: NewTask) -> anyhow::Result<i64> {
        self.db.run_blocking(move |db| db.create_task(&task)).await
    }

    pub async fn create_reminder(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: ChannelId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let payload = serde_json::to_string(&ReminderPayload {
            channel: channel_id.to_string(),
            reason: reason.to_string(),
        })?;
        self.create(NewTask {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            task_type: TaskType::Reminder,
            process_after: at,
            payload,
        })
        .await
    }

    pub async fn create_role_removal(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        role_id: RoleId,
        at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let payload = serde_json::to_string(&RemoveRolePayload {
            role: role_id.to_string(),
        })?;
        self.create(NewTask {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            task_type: TaskType::RemoveRole,
            process_after: at,
            payload,
        })
        .await
    }

    /// Replaces any birthday already scheduled for the user in this guild.
    pub async fn set_birthday(&self, guild_id: GuildId, user_id: UserId, at: DateTime<Utc>) -> anyhow::Result<i64> {
        let guild = guild_id.to_string();
        let user = user_id.to_string();
        self.db
            .run_blocking(move |db| {
                db.delete_user_tasks(&guild, &user, Some(TaskType::Birthday))?;
                db.create_task(&NewTask {
                    guild_id: guild,
                    user_id: user,
                    task_type: TaskType::Birthday,
                    process_after: at,
                    payload: "{}".to_string(),
                })
            })
            .await
    }

    pub async fn clear_birthday(&self, guild_id: GuildId, user_id: UserId) -> anyhow::Result<usize> {
        let guild = guild_id.to_string();
        let user = user_id.to_string();
        self.db
            .run_blocking(move |db| db.delete_user_tasks(&guild, &user, Some(TaskType::Birthday)))
            .await
    }

    /// Re-inserts a recurring task for its next occurrence.
    pub async fn reschedule(&self, task: &ScheduledTask, task_type: TaskType, at: DateTime<Utc>) -> anyhow::Result<i64> {
        self.create(NewTask {
            guild_id: task.guild_id.clone(),
            user_id: task.user_id.clone(),
            task_type,
            process_after: at,
            payload: task.payload.clone(),
        })
        .await
    }

    pub async fn list_reminders(&self, guild_id: GuildId, limit: usize) -> anyhow::Result<(Vec<ScheduledTask>, usize)> {
        let guild = guild_id.to_string();
        self.db
            .run_blocking(move |db| db.list_tasks(&guild, TaskType::Reminder, limit))
            .await
    }

    pub async fn cancel_reminder(&self, guild_id: GuildId, id: i64) -> anyhow::Result<bool> {
        let guild = guild_id.to_string();
        self.db
            .run_blocking(move |db| db.delete_task(&guild, TaskType::Reminder, id))
            .await
    }

    pub async fn claim_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledTask>> {
        self.db.run_blocking(move |db| db.claim_due_tasks(now)).await
    }

    pub async fn delete_user_tasks(&self, guild_id: GuildId, user_id: UserId) -> anyhow::Result<usize> {
        let guild = guild_id.to_string();
        let user = user_id.to_string();
        self.db
            .run_blocking(move |db| db.delete_user_tasks(&guild, &user, None))
            .await
    }
}
