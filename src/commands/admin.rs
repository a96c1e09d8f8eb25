use crate::commands::tree::{Access, CommandNode, OptionKind, OptionSpec};
use crate::commands::{Invocation, Response};
use crate::handler;
use serenity::all::{CreateInteractionResponse, CreateInteractionResponseMessage};
use tracing::info;

pub fn echo() -> CommandNode<Invocation> {
    CommandNode::leaf("echo", handler!(echo_text))
        .option(OptionSpec::new("text", OptionKind::String).required())
        .access(Access::Admin)
}

pub fn admin() -> CommandNode<Invocation> {
    CommandNode::group(
        "admin",
        vec![CommandNode::group(
            "config",
            vec![CommandNode::leaf("reload", handler!(reload_config))],
        )],
    )
    .access(Access::Admin)
}

async fn echo_text(call: Invocation) -> anyhow::Result<()> {
    let text = call.str("text").unwrap_or_default().to_string();
    let message = CreateInteractionResponseMessage::new().content(text).ephemeral(true);
    call.interaction
        .create_response(&call.ctx.http, CreateInteractionResponse::Message(message))
        .await?;
    Ok(())
}

async fn reload_config(call: Invocation) -> anyhow::Result<()> {
    info!(
        "Reloading all configs, requested in guild {:?} by {}",
        call.interaction.guild_id,
        call.author().id
    );
    call.data.guild_config.clear();
    call.respond(Response::new(".success")).await
}
