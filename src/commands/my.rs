//! `/my ...`: per-user profile settings.

use crate::commands::tree::{Choice, CommandNode, OptionKind, OptionSpec};
use crate::commands::{Invocation, Response};
use crate::guild_config::BIRTHDAY_CHANNEL;
use crate::timeparse::{self, TimeParseError};
use crate::{handler, vars};
use chrono::Utc;
use serenity::all::AutocompleteChoice;
use tracing::info;

const TIMEZONE_SUGGESTIONS: usize = 10;

pub fn my() -> CommandNode<Invocation> {
    CommandNode::group(
        "my",
        vec![
            CommandNode::group(
                "bedtime",
                vec![
                    CommandNode::leaf("set", handler!(set_bedtime))
                        .option(OptionSpec::new("time", OptionKind::String).required()),
                    CommandNode::leaf("get", handler!(get_bedtime)),
                    CommandNode::leaf("clear", handler!(clear_bedtime)),
                ],
            ),
            CommandNode::group(
                "timezone",
                vec![
                    CommandNode::leaf("set", handler!(set_timezone))
                        .option(OptionSpec::new("zone", OptionKind::String).required().autocomplete())
                        .on_autocomplete(handler!(suggest_timezones)),
                    CommandNode::leaf("get", handler!(get_timezone)),
                ],
            ),
            CommandNode::group(
                "birthday",
                vec![
                    CommandNode::leaf("set", handler!(set_birthday))
                        .option(
                            OptionSpec::new("month", OptionKind::Integer)
                                .required()
                                .choices((1..=12).map(Choice::Int)),
                        )
                        .option(OptionSpec::new("day", OptionKind::Integer).required().range(1, 31)),
                    CommandNode::leaf("clear", handler!(clear_birthday)),
                ],
            ),
            CommandNode::group(
                "settings",
                vec![CommandNode::leaf("mentions", handler!(set_mentions))
                    .option(OptionSpec::new("suppress", OptionKind::Boolean).required())],
            ),
        ],
    )
}

async fn set_bedtime(call: Invocation) -> anyhow::Result<()> {
    let input = call.str("time").unwrap_or_default();
    let Ok(minutes) = timeparse::parse_bedtime(input) else {
        return call.reply("invalid", vars!()).await;
    };
    let user = call.data.users.get(call.author().id).await?;
    if user.timezone.is_none() {
        return call.reply("timezone", vars!()).await;
    }
    info!("Setting bedtime for {} to {}", call.author().id, timeparse::format_bedtime(minutes));
    call.data.users.set_bedtime(call.author().id, Some(minutes)).await?;
    call.reply("success", vars! { "time" => timeparse::format_bedtime(minutes) })
        .await
}

async fn get_bedtime(call: Invocation) -> anyhow::Result<()> {
    let user = call.data.users.get(call.author().id).await?;
    match user.bedtime_minutes {
        Some(minutes) => {
            call.reply("success", vars! { "time" => timeparse::format_bedtime(minutes) })
                .await
        }
        None => call.reply("missing", vars!()).await,
    }
}

async fn clear_bedtime(call: Invocation) -> anyhow::Result<()> {
    call.data.users.set_bedtime(call.author().id, None).await?;
    info!("Cleared bedtime for {}", call.author().id);
    call.reply("success", vars!()).await
}

async fn suggest_timezones(call: Invocation) -> anyhow::Result<()> {
    let choices = timeparse::timezone_suggestions(call.focused(), TIMEZONE_SUGGESTIONS)
        .into_iter()
        .map(|zone| AutocompleteChoice::new(zone, zone))
        .collect();
    call.autocomplete(choices).await
}

async fn set_timezone(call: Invocation) -> anyhow::Result<()> {
    let input = call.str("zone").unwrap_or_default().to_string();
    let zone = match timeparse::parse_timezone(&input) {
        Ok(zone) => zone.name().to_string(),
        Err(_) => return call.reply("invalid", vars! { "zone" => input }).await,
    };
    call.data.users.set_timezone(call.author().id, zone.clone()).await?;
    info!("Set timezone for {} to {}", call.author().id, zone);
    call.reply("success", vars! { "zone" => zone }).await
}

async fn get_timezone(call: Invocation) -> anyhow::Result<()> {
    let user = call.data.users.get(call.author().id).await?;
    match user.timezone {
        Some(zone) => call.reply("success", vars! { "zone" => zone }).await,
        None => call.reply("missing", vars!()).await,
    }
}

async fn set_birthday(call: Invocation) -> anyhow::Result<()> {
    let guild_id = call.guild_id()?;
    if call.data.guild_config.get(&BIRTHDAY_CHANNEL, guild_id).ok().is_none() {
        return call.reply("no_channel", vars!()).await;
    }

    let user = call.data.users.get(call.author().id).await?;
    let Some(tz) = user
        .timezone
        .as_deref()
        .and_then(|zone| timeparse::parse_timezone(zone).ok())
    else {
        return call.reply("timezone", vars!()).await;
    };

    let month = call.int("month").unwrap_or_default();
    let day = call.int("day").unwrap_or_default();
    let (Ok(month), Ok(day)) = (u32::try_from(month), u32::try_from(day)) else {
        return call.reply("invalid", vars!()).await;
    };
    let at = match timeparse::next_birthday(month, day, &tz, Utc::now()) {
        Ok(at) => at,
        Err(TimeParseError::InvalidDate) => return call.reply("invalid", vars!()).await,
        Err(e) => return Err(e.into()),
    };

    let id = call
        .data
        .schedule
        .set_birthday(guild_id, call.author().id, at)
        .await?;
    info!("Created birthday task {} for {}", id, call.author().id);
    call.reply("success", vars!()).await
}

async fn clear_birthday(call: Invocation) -> anyhow::Result<()> {
    let guild_id = call.guild_id()?;
    call.data
        .schedule
        .clear_birthday(guild_id, call.author().id)
        .await?;
    info!("Cleared birthday for {}", call.author().id);
    call.reply("success", vars!()).await
}

async fn set_mentions(call: Invocation) -> anyhow::Result<()> {
    let suppress = call.bool("suppress").unwrap_or_default();
    call.data
        .users
        .set_suppress_mentions(call.author().id, suppress)
        .await?;
    call.respond(
        Response::new(if suppress { ".set" } else { ".unset" }).vars(vars! { "suppress" => suppress }),
    )
    .await
}
