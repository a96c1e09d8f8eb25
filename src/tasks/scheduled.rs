use super::TaskContext;
use crate::db::{ReminderPayload, RemoveRolePayload, ScheduledTask, TaskType};
use crate::guild_config::BIRTHDAY_CHANNEL;
use crate::timeparse::one_year_after;
use crate::vars;
use anyhow::Context as _;
use chrono::Utc;
use serenity::all::{ChannelId, CreateAllowedMentions, CreateMessage, GuildId, RoleId, UserId};
use tracing::{debug, error, info, info_span, warn, Instrument};

fn snowflake(raw: &str) -> anyhow::Result<u64> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .with_context(|| format!("invalid id '{}'", raw))
}

/// Claims every due row and processes each one concurrently. Claimed rows are already gone
/// from storage, so a failure here drops the task.
pub async fn run(ctx: TaskContext) -> anyhow::Result<()> {
    let tasks = ctx.data.schedule.claim_due(Utc::now()).await?;
    if tasks.is_empty() {
        return Ok(());
    }
    info!("Processing {} scheduled tasks", tasks.len());
    for task in tasks {
        let ctx = ctx.clone();
        let span = info_span!("scheduled_task", task_id = task.id, task_type = task.task_type);
        tokio::spawn(
            async move {
                if let Err(e) = process(&ctx, &task).await {
                    error!("Failed to process scheduled task: {:#}", e);
                }
            }
            .instrument(span),
        );
    }
    Ok(())
}

pub async fn process(ctx: &TaskContext, task: &ScheduledTask) -> anyhow::Result<()> {
    let guild = GuildId::new(snowflake(&task.guild_id)?);
    let user = UserId::new(snowflake(&task.user_id)?);
    let Some(bot) = ctx.bots.messenger(guild) else {
        anyhow::bail!("no bot serves guild {}", guild);
    };
    let data = &ctx.data;

    match task.kind() {
        Some(TaskType::Reminder) => {
            let payload: ReminderPayload = serde_json::from_str(&task.payload).context("bad reminder payload")?;
            let channel = ChannelId::new(snowflake(&payload.channel)?);
            let locale = data.locales.get(&*bot, guild).await;
            let content = data.i18n.render(
                &locale,
                "reminder.notif",
                &vars! { "name" => format!("<@{}>", user), "content" => payload.reason },
            );
            debug!("Sending reminder to {}", channel);
            bot.send(
                channel,
                CreateMessage::new()
                    .content(content)
                    .allowed_mentions(CreateAllowedMentions::new().users([user])),
            )
            .await?;
        }
        Some(TaskType::Birthday) => {
            let Some(channel) = data.guild_config.get(&BIRTHDAY_CHANNEL, guild).ok() else {
                warn!("No birthday channel configured for {}, dropping birthday", guild);
                return Ok(());
            };
            let locale = data.locales.get(&*bot, guild).await;
            let content = data
                .i18n
                .render(&locale, "my/birthday.notif", &vars! { "name" => format!("<@{}>", user) });
            bot.send(
                channel.channel(),
                CreateMessage::new()
                    .content(content)
                    .allowed_mentions(CreateAllowedMentions::new().users([user])),
            )
            .await?;
            let next = one_year_after(task.process_after);
            data.schedule.reschedule(task, TaskType::Birthday, next).await?;
            debug!("Next birthday for {} at {}", user, next);
        }
        Some(TaskType::RemoveRole) => {
            let payload: RemoveRolePayload = serde_json::from_str(&task.payload).context("bad role payload")?;
            let role = RoleId::new(snowflake(&payload.role)?);
            info!("Removing role {} from {}", role, user);
            bot.remove_role(guild, user, role).await?;
        }
        None => warn!("Unknown scheduled task type {}", task.task_type),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::testing::{FakeDirectory, FakeMessenger};
    use crate::test_data;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn context(guild: GuildId, bot: Arc<FakeMessenger>) -> TaskContext {
        let mut directory = FakeDirectory::default();
        directory.bots.insert(guild, bot);
        TaskContext::new(test_data(), Arc::new(directory))
    }

    #[tokio::test]
    async fn test_birthday_is_announced_and_rescheduled() {
        let guild = GuildId::new(10);
        let bot = Arc::new(FakeMessenger::default());
        let ctx = context(guild, bot.clone());
        ctx.data.db.set_config("profile.birthday_channel", "10", "\"77\"").unwrap();

        let due = Utc.with_ymd_and_hms(2025, 6, 1, 4, 0, 0).unwrap();
        ctx.data.schedule.set_birthday(guild, UserId::new(5), due).await.unwrap();
        let claimed = ctx.data.schedule.claim_due(due).await.unwrap();
        assert_eq!(claimed.len(), 1);

        process(&ctx, &claimed[0]).await.unwrap();

        let sent = bot.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChannelId::new(77));
        assert!(bot.contents()[0].contains("<@5>"));

        let next_year = due + Duration::days(365);
        assert!(ctx.data.schedule.claim_due(next_year - Duration::hours(1)).await.unwrap().is_empty());
        let rescheduled = ctx.data.schedule.claim_due(next_year).await.unwrap();
        assert_eq!(rescheduled.len(), 1);
        assert_eq!(rescheduled[0].kind(), Some(TaskType::Birthday));
    }

    #[tokio::test]
    async fn test_birthday_without_channel_is_dropped() {
        let guild = GuildId::new(10);
        let bot = Arc::new(FakeMessenger::default());
        let ctx = context(guild, bot.clone());

        let due = Utc.with_ymd_and_hms(2025, 6, 1, 4, 0, 0).unwrap();
        ctx.data.schedule.set_birthday(guild, UserId::new(5), due).await.unwrap();
        let claimed = ctx.data.schedule.claim_due(due).await.unwrap();
        process(&ctx, &claimed[0]).await.unwrap();

        assert!(bot.sent.lock().unwrap().is_empty());
        assert!(ctx.data.schedule.claim_due(due + Duration::days(400)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reminder_and_role_removal() {
        let guild = GuildId::new(10);
        let bot = Arc::new(FakeMessenger::default());
        let ctx = context(guild, bot.clone());
        let at = Utc::now() - Duration::minutes(1);

        ctx.data
            .schedule
            .create_reminder(guild, UserId::new(5), ChannelId::new(33), "drink water", at)
            .await
            .unwrap();
        ctx.data
            .schedule
            .create_role_removal(guild, UserId::new(5), RoleId::new(44), at)
            .await
            .unwrap();

        for task in ctx.data.schedule.claim_due(Utc::now()).await.unwrap() {
            process(&ctx, &task).await.unwrap();
        }

        let sent = bot.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChannelId::new(33));
        assert_eq!(sent[0].1["allowed_mentions"]["users"].as_array().map(Vec::len), Some(1));
        assert!(bot.contents()[0].contains("drink water"));
        assert_eq!(
            *bot.roles_removed.lock().unwrap(),
            vec![(guild, UserId::new(5), RoleId::new(44))]
        );
    }

    #[tokio::test]
    async fn test_unserved_guild_is_an_error() {
        let ctx = context(GuildId::new(10), Arc::new(FakeMessenger::default()));
        let task = ScheduledTask {
            id: 1,
            guild_id: "99".into(),
            user_id: "5".into(),
            task_type: TaskType::RemoveRole.as_i64(),
            process_after: Utc::now(),
            payload: "{\"role\":\"1\"}".into(),
        };
        assert!(process(&ctx, &task).await.is_err());
    }
}
