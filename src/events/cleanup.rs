use crate::Data;
use serenity::all::{GuildId, UserId};
use std::sync::Arc;
use tracing::{info, warn};

/// Forgets everything stored about a member who left the guild.
pub async fn on_member_leave(data: Arc<Data>, guild: GuildId, user: UserId) -> anyhow::Result<()> {
    info!("Cleaning up data for {} after leaving {}", user, guild);
    let guild_key = guild.to_string();
    let user_key = user.to_string();

    let (g, u) = (guild_key.clone(), user_key.clone());
    if let Err(e) = data.db.run_blocking(move |db| db.delete_user_quotes(&g, &u)).await {
        warn!("Failed to delete quotes for {} in {}: {:#}", user, guild, e);
    }
    if let Err(e) = data.schedule.delete_user_tasks(guild, user).await {
        warn!("Failed to delete scheduled tasks for {} in {}: {:#}", user, guild, e);
    }
    if let Err(e) = data
        .db
        .run_blocking(move |db| db.delete_metric(&guild_key, &user_key))
        .await
    {
        warn!("Failed to delete message metrics for {} in {}: {:#}", user, guild, e);
    }
    Ok(())
}
