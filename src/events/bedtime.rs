//! Nudges people who are still chatting after their bedtime.

use crate::db::User;
use crate::timeparse;
use crate::{vars, Data};
use chrono::{DateTime, Duration, Utc};
use serenity::all::{Context, CreateAllowedMentions, CreateMessage, Message};
use std::sync::Arc;
use tracing::{debug, info, warn};

const NOTIFY_COOLDOWN_MINUTES: i64 = 30;
const SLEEP_WINDOW_HOURS: i64 = 6;

/// Response key to post for `user` at `now`, if any.
pub fn nudge(user: &User, now: DateTime<Utc>) -> Option<&'static str> {
    let zone = user.timezone.as_deref()?;
    let bedtime = user.bedtime()?;
    if user
        .last_bedtime_notified
        .is_some_and(|last| now - last < Duration::minutes(NOTIFY_COOLDOWN_MINUTES))
    {
        return None;
    }
    let tz = match timeparse::parse_timezone(zone) {
        Ok(tz) => tz,
        Err(e) => {
            warn!("Ignoring bedtime for {}: {}", user.user_id, e);
            return None;
        }
    };

    let local_now = now.with_timezone(&tz);
    let mut last_bedtime = timeparse::localize(&tz, local_now.date_naive().and_time(bedtime))?;
    if last_bedtime > local_now {
        // 1am with an 11pm bedtime belongs to yesterday's night.
        last_bedtime = last_bedtime - Duration::days(1);
    }
    let since = local_now.signed_duration_since(last_bedtime);
    let window = Duration::hours(SLEEP_WINDOW_HOURS);
    if since > window {
        None
    } else if since < window / 2 {
        Some("my/bedtime/notifs.late")
    } else {
        Some("my/bedtime/notifs.early")
    }
}

pub async fn on_message(ctx: Context, data: Arc<Data>, message: Message) -> anyhow::Result<()> {
    let Some(guild) = message.guild_id else {
        return Ok(());
    };
    if message.author.bot {
        return Ok(());
    }
    let user = data.users.get(message.author.id).await?;
    let now = Utc::now();
    let Some(key) = nudge(&user, now) else {
        debug!("No bedtime nudge for {}", message.author.id);
        return Ok(());
    };

    info!("Sending bedtime notification to {}", message.author.id);
    let locale = data.locales.get(&*ctx.http, guild).await;
    let text = data
        .i18n
        .render(&locale, key, &vars! { "user" => format!("<@{}>", message.author.id) });
    message
        .channel_id
        .send_message(
            &ctx.http,
            CreateMessage::new()
                .content(text)
                .allowed_mentions(CreateAllowedMentions::new().users([message.author.id])),
        )
        .await?;
    data.users.set_bedtime_notified(message.author.id, now).await
}
