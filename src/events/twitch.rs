//! Live role and go-live announcements driven by streaming presences.

use crate::guild_config::{
    TWITCH_ELIGIBLE_ROLE_IDS, TWITCH_LIVE_CHANNEL_ID, TWITCH_LIVE_ROLE_ID, TWITCH_LIVE_TEMPLATE,
};
use crate::i18n::render_template;
use crate::twitch::{login_from_url, Stream};
use crate::{vars, Data};
use serenity::all::{
    Activity, ActivityType, ChannelId, Context, CreateAllowedMentions, CreateEmbed, CreateEmbedAuthor,
    CreateEmbedFooter, CreateMessage, Guild, GuildId, Presence, Timestamp, UserId,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Twitch login of the first streaming activity that points at Twitch.
pub fn streaming_login<'a, I>(activities: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (ActivityType, Option<&'a str>)>,
{
    activities
        .into_iter()
        .filter(|(kind, _)| *kind == ActivityType::Streaming)
        .find_map(|(_, url)| url.and_then(login_from_url))
}

fn activity_pairs(activities: &[Activity]) -> impl Iterator<Item = (ActivityType, Option<&str>)> {
    activities
        .iter()
        .map(|activity| (activity.kind, activity.url.as_ref().map(|url| url.as_str())))
}

pub fn stream_embed(stream: &Stream, profile_image: Option<String>, image: String) -> CreateEmbed {
    let mut embed = CreateEmbed::new()
        .title(stream.title.clone())
        .description(stream.game_name.clone())
        .url(stream.channel_url())
        .author(CreateEmbedAuthor::new(stream.user_login.clone()))
        .footer(CreateEmbedFooter::new(stream.tags.join(", ")))
        .image(image);
    if let Some(profile_image) = profile_image {
        embed = embed.thumbnail(profile_image);
    }
    if let Ok(started) = Timestamp::from_unix_timestamp(stream.started_at.timestamp()) {
        embed = embed.timestamp(started);
    }
    embed
}

/// Brings the live role in line with who is streaming now and warms the stream cache.
pub async fn on_guild_create(ctx: Context, data: Arc<Data>, guild: Guild) -> anyhow::Result<()> {
    let Some(role) = data.guild_config.get(&TWITCH_LIVE_ROLE_ID, guild.id).ok() else {
        return Ok(());
    };
    let role = role.role();
    info!("Syncing live role from presences in {}", guild.id);

    let mut live = Vec::new();
    for (user, presence) in &guild.presences {
        match streaming_login(activity_pairs(&presence.activities)) {
            Some(login) => {
                info!("{} is streaming as {}, adding live role", user, login);
                live.push(login.to_string());
                if let Err(e) = ctx.http.add_member_role(guild.id, *user, role, None).await {
                    error!("Failed to add live role to {}: {}", user, e);
                }
            }
            None => {
                debug!("{} is not streaming, removing live role", user);
                if let Err(e) = ctx.http.remove_member_role(guild.id, *user, role, None).await {
                    debug!("Failed to remove live role from {}: {}", user, e);
                }
            }
        }
    }
    info!("Found {} live members in {}", live.len(), guild.id);
    if !live.is_empty() {
        // Only for the cache: streams already live are not announced again.
        data.twitch.get_streams(&live).await?;
    }
    Ok(())
}

pub async fn on_presence_update(ctx: Context, data: Arc<Data>, presence: Presence) -> anyhow::Result<()> {
    let Some(guild) = presence.guild_id else {
        return Ok(());
    };
    let role = data.guild_config.get(&TWITCH_LIVE_ROLE_ID, guild).ok().map(|id| id.role());
    let channel = data
        .guild_config
        .get(&TWITCH_LIVE_CHANNEL_ID, guild)
        .ok()
        .map(|id| id.channel());
    if role.is_none() && channel.is_none() {
        return Ok(());
    }
    let user = presence.user.id;

    let eligible = data
        .guild_config
        .get(&TWITCH_ELIGIBLE_ROLE_IDS, guild)
        .ok()
        .unwrap_or_default();
    if !eligible.is_empty() {
        let member = guild.member(&ctx, user).await?;
        if !eligible.iter().any(|id| member.roles.contains(&id.role())) {
            return Ok(());
        }
    }

    match streaming_login(activity_pairs(&presence.activities)) {
        Some(login) => {
            if let Some(role) = role {
                debug!("{} is streaming, adding live role", user);
                ctx.http.add_member_role(guild, user, role, None).await?;
            }
            if let Some(channel) = channel {
                let login = login.to_string();
                tokio::spawn(async move {
                    if let Err(e) = announce(&ctx, &data, guild, channel, user, &login).await {
                        error!("Failed to announce stream for {}: {:#}", login, e);
                    }
                });
            }
        }
        None => {
            if let Some(role) = role {
                debug!("{} is not streaming, removing live role", user);
                ctx.http.remove_member_role(guild, user, role, None).await?;
            }
        }
    }
    Ok(())
}

async fn announce(
    ctx: &Context,
    data: &Data,
    guild: GuildId,
    channel: ChannelId,
    user: UserId,
    login: &str,
) -> anyhow::Result<()> {
    debug!("Getting stream info for {}", login);
    let (stream, is_new) = data.twitch.attempt_get_stream(login, &data.shutdown).await?;
    if !is_new {
        debug!("Stream {} is not new, skipping notification", stream.id);
        return Ok(());
    }

    let image = stream.thumbnail();
    if !data.twitch.wait_for_thumbnail(&image, &data.shutdown).await && data.shutdown.is_triggered() {
        info!("Abandoning stream notification for {} during shutdown", login);
        return Ok(());
    }
    let profile_image = data.twitch.profile_image_url(login).await.unwrap_or_else(|e| {
        debug!("No profile image for {}: {:#}", login, e);
        None
    });

    let template = data
        .guild_config
        .get(&TWITCH_LIVE_TEMPLATE, guild)
        .ok()
        .unwrap_or_default();
    let content = render_template(&template, &vars! { "user" => format!("<@{}>", user) });
    let mut message = CreateMessage::new()
        .embed(stream_embed(&stream, profile_image, image))
        .allowed_mentions(CreateAllowedMentions::new().users([user]));
    if !content.is_empty() {
        message = message.content(content);
    }
    info!("Sending stream notification for {} to {}", login, channel);
    channel.send_message(&ctx.http, message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_streaming_login() {
        let activities = [
            (ActivityType::Playing, Some("https://www.twitch.tv/nope")),
            (ActivityType::Streaming, Some("https://youtube.com/live")),
            (ActivityType::Streaming, Some("https://www.twitch.tv/sleepycat")),
        ];
        assert_eq!(streaming_login(activities), Some("sleepycat"));
        assert_eq!(streaming_login([(ActivityType::Streaming, None)]), None);
        assert_eq!(streaming_login(Vec::new()), None);
    }

    #[test]
    fn test_stream_embed() {
        let stream = Stream {
            id: "1".into(),
            user_login: "sleepycat".into(),
            user_name: "SleepyCat".into(),
            game_name: "Just Chatting".into(),
            title: "naps".into(),
            started_at: Utc.with_ymd_and_hms(2025, 2, 1, 20, 0, 0).unwrap(),
            thumbnail_url: "https://cdn/x-{width}x{height}.jpg".into(),
            tags: vec!["cozy".into(), "English".into()],
        };
        let embed = stream_embed(&stream, Some("https://cdn/face.png".into()), stream.thumbnail());
        let json = serde_json::to_value(&embed).unwrap();
        assert_eq!(json["title"], "naps");
        assert_eq!(json["description"], "Just Chatting");
        assert_eq!(json["url"], "https://www.twitch.tv/sleepycat");
        assert_eq!(json["author"]["name"], "sleepycat");
        assert_eq!(json["footer"]["text"], "cozy, English");
        assert_eq!(json["image"]["url"], "https://cdn/x-1024x576.jpg");
        assert_eq!(json["thumbnail"]["url"], "https://cdn/face.png");
    }
}
