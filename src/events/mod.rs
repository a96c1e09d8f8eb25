//! Gateway event routing. Every handler runs in its own task so that one failing or
//! panicking handler never affects the others or the session.

pub mod bedtime;
pub mod chat;
pub mod cleanup;
pub mod logging;
pub mod metrics;
pub mod twitch;

use crate::commands;
use crate::Data;
use serenity::all::{Context, FullEvent};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info_span, Instrument};

/// Runs `handler` detached, logging its error or panic under the `event` span.
pub fn spawn_handler<F>(name: &'static str, handler: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let task = tokio::spawn(handler.instrument(info_span!("event", event = name)));
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(event = name, "Error handling event: {:#}", e),
            Err(e) if e.is_panic() => error!(event = name, "Captured panic during event handling: {}", e),
            Err(e) => error!(event = name, "Event handler was cancelled: {}", e),
        }
    });
}

pub fn dispatch(ctx: &Context, event: &FullEvent, data: &Arc<Data>) {
    match event {
        FullEvent::Message { new_message } => {
            spawn_handler(
                "bedtime",
                bedtime::on_message(ctx.clone(), data.clone(), new_message.clone()),
            );
            spawn_handler(
                "roleMessageMetrics",
                metrics::on_message(ctx.clone(), data.clone(), new_message.clone()),
            );
            spawn_handler(
                "chatMessageCreate",
                chat::on_message(ctx.clone(), data.clone(), new_message.clone()),
            );
            spawn_handler(
                "logMessageCreate",
                logging::on_message(data.clone(), new_message.clone()),
            );
        }
        FullEvent::MessageUpdate { event, .. } => {
            spawn_handler(
                "logMessageUpdate",
                logging::on_message_update(ctx.clone(), data.clone(), event.clone()),
            );
        }
        FullEvent::MessageDelete {
            channel_id,
            deleted_message_id,
            guild_id,
        } => {
            spawn_handler(
                "logMessageDelete",
                logging::on_message_delete(ctx.clone(), data.clone(), *guild_id, *channel_id, *deleted_message_id),
            );
        }
        FullEvent::GuildBanAddition { guild_id, banned_user } => {
            spawn_handler(
                "logBan",
                logging::on_ban(ctx.clone(), data.clone(), *guild_id, banned_user.clone()),
            );
        }
        FullEvent::GuildBanRemoval { guild_id, unbanned_user } => {
            spawn_handler(
                "logUnban",
                logging::on_unban(ctx.clone(), data.clone(), *guild_id, unbanned_user.clone()),
            );
        }
        FullEvent::GuildMemberRemoval { guild_id, user, .. } => {
            spawn_handler(
                "memberLeaveCleanup",
                cleanup::on_member_leave(data.clone(), *guild_id, user.id),
            );
            spawn_handler(
                "logLeave",
                logging::on_leave(ctx.clone(), data.clone(), *guild_id, user.clone()),
            );
        }
        FullEvent::GuildMemberUpdate {
            old_if_available,
            event,
            ..
        } => {
            spawn_handler(
                "logTimeout",
                logging::on_member_update(ctx.clone(), data.clone(), old_if_available.clone(), event.clone()),
            );
        }
        FullEvent::GuildAuditLogEntryCreate { entry, .. } => {
            spawn_handler("logAuditLog", logging::on_audit_entry(data.clone(), entry.clone()));
        }
        FullEvent::GuildCreate { guild, .. } => {
            spawn_handler(
                "twitchStreamGuildAvailable",
                twitch::on_guild_create(ctx.clone(), data.clone(), guild.clone()),
            );
        }
        FullEvent::PresenceUpdate { new_data } => {
            spawn_handler(
                "twitchStreamPresenceUpdate",
                twitch::on_presence_update(ctx.clone(), data.clone(), new_data.clone()),
            );
        }
        FullEvent::InteractionCreate { interaction } => {
            let (ctx, data, interaction) = (ctx.clone(), data.clone(), interaction.clone());
            spawn_handler("interactionCreate", async move {
                commands::handle_interaction(data, ctx, interaction).await;
                Ok::<_, anyhow::Error>(())
            });
        }
        _ => {}
    }
}
