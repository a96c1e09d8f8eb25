use crate::commands::tree::{Choice, CommandNode, OptionKind, OptionSpec};
use crate::commands::{Invocation, Response};
use crate::guild_config::{REPORT_CHANNEL_ID, REPORT_MESSAGE};
use crate::{handler, vars};
use serenity::all::{Attachment, CreateAllowedMentions, CreateEmbed, CreateMessage};
use tracing::info;

const LOCATIONS: [&str; 4] = ["Private Message", "This Server", "Another Server", "Outside Discord"];

pub fn report() -> CommandNode<Invocation> {
    CommandNode::leaf("report", handler!(submit))
        .option(OptionSpec::new("user", OptionKind::User).required())
        .option(
            OptionSpec::new("location", OptionKind::String)
                .required()
                .choices(LOCATIONS.into_iter().map(Choice::Str)),
        )
        .option(OptionSpec::new("screenshot", OptionKind::Attachment).required())
        .option(OptionSpec::new("comment", OptionKind::String))
}

fn is_image(attachment: &Attachment) -> bool {
    attachment
        .content_type
        .as_deref()
        .is_some_and(|kind| kind.starts_with("image/"))
}

async fn submit(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?;
    let Some(channel) = call.data.guild_config.get(&REPORT_CHANNEL_ID, guild).ok() else {
        return call.reply("notAvailable", vars!()).await;
    };
    let screenshot = call
        .attachment("screenshot")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("screenshot not resolved"))?;
    if !is_image(&screenshot) {
        return call.reply("invalidImage", vars!()).await;
    }
    let target = call
        .user("user")
        .map(|user| user.id)
        .ok_or_else(|| anyhow::anyhow!("reported user not resolved"))?;
    let location = call.str("location").unwrap_or_default();

    let mut content = call.data.guild_config.get(&REPORT_MESSAGE, guild).ok().unwrap_or_default();
    if let Some(comment) = call.str("comment").filter(|c| !c.is_empty()) {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(comment);
    }

    let locale = call.guild_locale();
    let i18n = &call.data.i18n;
    let embed = CreateEmbed::new()
        .title(i18n.text(locale, "report.title"))
        .field(i18n.text(locale, "report.originator"), format!("<@{}>", call.author().id), true)
        .field(i18n.text(locale, "report.location"), location, true)
        .field(i18n.text(locale, "report.target"), format!("<@{}>", target), true)
        .image(screenshot.url.clone());
    let mut message = CreateMessage::new()
        .embed(embed)
        .allowed_mentions(CreateAllowedMentions::new());
    if !content.is_empty() {
        message = message.content(content);
    }
    channel.channel().send_message(&call.ctx.http, message).await?;
    info!("Forwarded report about {} from {}", target, call.author().id);

    call.respond(Response::new(".success")).await
}
