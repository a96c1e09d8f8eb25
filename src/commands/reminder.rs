use crate::commands::tree::{CommandNode, OptionKind, OptionSpec};
use crate::commands::{Invocation, Response};
use crate::db::ReminderPayload;
use crate::services::ScheduleService;
use crate::timeparse;
use crate::{handler, vars};
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, CreateEmbed, CreateEmbedFooter, GuildId, UserId};
use tracing::info;

const LIST_LIMIT: usize = 10;

pub fn reminder() -> CommandNode<Invocation> {
    CommandNode::group(
        "reminder",
        vec![
            CommandNode::leaf("set", handler!(set))
                .option(OptionSpec::new("time", OptionKind::String).required())
                .option(OptionSpec::new("message", OptionKind::String).required()),
            CommandNode::leaf("cancel", handler!(cancel))
                .option(OptionSpec::new("id", OptionKind::Integer).required()),
            CommandNode::leaf("list", handler!(list)),
        ],
    )
}

#[derive(Debug, PartialEq)]
enum SetOutcome {
    NoTimezone,
    BadFormat,
    Past,
    Created { id: i64, at: DateTime<Utc> },
}

impl SetOutcome {
    fn suffix(&self) -> &'static str {
        match self {
            SetOutcome::NoTimezone => "timezone",
            SetOutcome::BadFormat => "format",
            SetOutcome::Past => "past",
            SetOutcome::Created { .. } => "success",
        }
    }
}

struct ReminderRequest<'a> {
    guild: GuildId,
    user: UserId,
    channel: ChannelId,
    timezone: Option<&'a str>,
    time: &'a str,
    reason: &'a str,
}

/// Parses the time in the user's zone and stores the reminder when it lies in the future.
async fn schedule(
    schedule: &ScheduleService,
    request: ReminderRequest<'_>,
    now: DateTime<Utc>,
) -> anyhow::Result<SetOutcome> {
    let Some(tz) = request
        .timezone
        .and_then(|zone| timeparse::parse_timezone(zone).ok())
    else {
        return Ok(SetOutcome::NoTimezone);
    };
    let Ok(at) = timeparse::parse_reminder_time(request.time, &tz, now) else {
        return Ok(SetOutcome::BadFormat);
    };
    if at <= now {
        return Ok(SetOutcome::Past);
    }
    let id = schedule
        .create_reminder(request.guild, request.user, request.channel, request.reason, at)
        .await?;
    Ok(SetOutcome::Created { id, at })
}

async fn set(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?;
    let user = call.data.users.get(call.author().id).await?;
    let request = ReminderRequest {
        guild,
        user: call.author().id,
        channel: call.interaction.channel_id,
        timezone: user.timezone.as_deref(),
        time: call.str("time").unwrap_or_default(),
        reason: call.str("message").unwrap_or_default(),
    };
    let outcome = schedule(&call.data.schedule, request, Utc::now()).await?;
    let suffix = outcome.suffix();
    match outcome {
        SetOutcome::Created { id, at } => {
            info!("Created reminder {} for {} at {}", id, call.author().id, at);
            call.reply(
                suffix,
                vars! { "time" => format!("<t:{}:f>", at.timestamp()), "id" => id },
            )
            .await
        }
        _ => call.reply(suffix, vars!()).await,
    }
}

async fn cancel(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?;
    let id = call.int("id").unwrap_or_default();
    if call.data.schedule.cancel_reminder(guild, id).await? {
        info!("Cancelled reminder {} in {}", id, guild);
        call.reply("success", vars! { "id" => id }).await
    } else {
        call.reply("missing", vars! { "id" => id }).await
    }
}

async fn list(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?;
    let (reminders, total) = call.data.schedule.list_reminders(guild, LIST_LIMIT).await?;
    if reminders.is_empty() {
        return call.reply("empty", vars!()).await;
    }

    let unknown = call.render(".unknownUser", &vars!(), false);
    let mut embed = CreateEmbed::new().title(call.render(".title", &vars!(), false));
    for task in &reminders {
        let name = call
            .member_name(&task.user_id)
            .await
            .unwrap_or_else(|| unknown.clone());
        let reason = serde_json::from_str::<ReminderPayload>(&task.payload)
            .map(|payload| payload.reason)
            .unwrap_or_default();
        embed = embed.field(
            format!("[#{}] {}", task.id, name),
            format!("<t:{}:f>\n{}", task.process_after.timestamp(), reason),
            false,
        );
    }
    if total > reminders.len() {
        let footer = call.render(".hasMore", &vars! { "count" => total - reminders.len() }, false);
        embed = embed.footer(CreateEmbedFooter::new(footer));
    }
    call.respond(Response::new(".listed").embed(embed)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::TimeZone;

    fn request<'a>(timezone: Option<&'a str>, time: &'a str) -> ReminderRequest<'a> {
        ReminderRequest {
            guild: GuildId::new(1),
            user: UserId::new(2),
            channel: ChannelId::new(3),
            timezone,
            time,
            reason: "stretch",
        }
    }

    #[tokio::test]
    async fn test_past_time_is_rejected_without_storing() {
        let service = ScheduleService::new(Database::open_in_memory().unwrap());
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap();

        let outcome = schedule(&service, request(Some("America/New_York"), "5m ago"), now)
            .await
            .unwrap();
        assert_eq!(outcome, SetOutcome::Past);
        assert_eq!(outcome.suffix(), "past");

        let (rows, total) = service.list_reminders(GuildId::new(1), 10).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_schedule_outcomes() {
        let service = ScheduleService::new(Database::open_in_memory().unwrap());
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap();

        assert_eq!(
            schedule(&service, request(None, "10m"), now).await.unwrap(),
            SetOutcome::NoTimezone
        );
        assert_eq!(
            schedule(&service, request(Some("America/New_York"), "whenever"), now)
                .await
                .unwrap(),
            SetOutcome::BadFormat
        );

        let outcome = schedule(&service, request(Some("America/New_York"), "in 2h"), now)
            .await
            .unwrap();
        let SetOutcome::Created { id, at } = outcome else {
            panic!("expected a reminder, got {:?}", outcome);
        };
        assert_eq!(at, now + chrono::Duration::hours(2));

        let (rows, total) = service.list_reminders(GuildId::new(1), 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, id);
        let payload: ReminderPayload = serde_json::from_str(&rows[0].payload).unwrap();
        assert_eq!(payload.channel, "3");
        assert_eq!(payload.reason, "stretch");
    }
}
