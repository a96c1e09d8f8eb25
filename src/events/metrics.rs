use crate::commands::roles::{try_grant_regulars, MemberSnapshot, RegularsPolicy, RegularsVerdict};
use crate::guild_config::{REGULARS_AUTO_ASSIGN, REGULARS_ROLE_ID};
use crate::Data;
use chrono::{DateTime, Utc};
use serenity::all::{Context, Message};
use std::sync::Arc;
use tracing::{debug, error};

/// Counts activity towards the regulars role and grants it automatically when enabled.
pub async fn on_message(ctx: Context, data: Arc<Data>, message: Message) -> anyhow::Result<()> {
    let Some(guild) = message.guild_id else {
        return Ok(());
    };
    let Some(role) = data.guild_config.get(&REGULARS_ROLE_ID, guild).ok() else {
        return Ok(());
    };
    let Some(member) = message.member.as_deref() else {
        return Ok(());
    };
    if message.author.bot || member.roles.contains(&role.role()) {
        return Ok(());
    }

    let now = Utc::now();
    let (guild_key, user_key) = (guild.to_string(), message.author.id.to_string());
    if let Err(e) = data
        .db
        .run_blocking(move |db| db.record_message(&guild_key, &user_key, now))
        .await
    {
        error!("Failed to update message metrics: {:#}", e);
    }

    if !data.guild_config.get(&REGULARS_AUTO_ASSIGN, guild).ok().unwrap_or(false) {
        return Ok(());
    }
    let Some(policy) = RegularsPolicy::load(&data, guild) else {
        return Ok(());
    };
    let snapshot = MemberSnapshot {
        user: message.author.id,
        roles: &member.roles,
        joined_at: member
            .joined_at
            .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), 0)),
    };
    let verdict = try_grant_regulars(&data, &*ctx.http, guild, &policy, snapshot, now).await?;
    if verdict != RegularsVerdict::Eligible {
        debug!("{} not yet eligible for regulars: {:?}", message.author.id, verdict);
    }
    Ok(())
}
