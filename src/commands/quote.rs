//! Quote book: `/quote`, `/quotes ...` and the "Add Quote" message menu.

use crate::commands::tree::{Access, CommandNode, OptionKind, OptionSpec};
use crate::commands::{Invocation, Response};
use crate::db::{AddQuote, Quote};
use crate::{handler, vars};
use serenity::all::{CreateEmbed, CreateEmbedFooter, GuildId, User};
use tracing::info;

const FIND_LIMIT: usize = 10;

pub fn quote() -> CommandNode<Invocation> {
    CommandNode::leaf("quote", handler!(random)).option(OptionSpec::new("user", OptionKind::User).required())
}

pub fn quotes() -> CommandNode<Invocation> {
    CommandNode::group(
        "quotes",
        vec![
            CommandNode::leaf("get", handler!(get))
                .option(OptionSpec::new("id", OptionKind::Integer).required()),
            CommandNode::leaf("add", handler!(add))
                .option(OptionSpec::new("user", OptionKind::User).required())
                .option(OptionSpec::new("text", OptionKind::String).required()),
            CommandNode::leaf("find", handler!(find))
                .option(OptionSpec::new("text_search", OptionKind::String))
                .option(OptionSpec::new("user", OptionKind::User)),
            CommandNode::leaf("delete", handler!(delete))
                .option(OptionSpec::new("id", OptionKind::Integer).required()),
        ],
    )
    .access(Access::Moderator)
}

pub fn add_quote_menu() -> CommandNode<Invocation> {
    CommandNode::message_menu("Add Quote", handler!(add_from_message)).access(Access::Moderator)
}

async fn show(call: &Invocation, quote: Option<Quote>) -> anyhow::Result<()> {
    let Some(quote) = quote else {
        return call.respond(Response::new("quote.missing")).await;
    };
    let unknown = call.render("quote.unknownUser", &vars!(), true);
    let user = call.member_name(&quote.user_id).await.unwrap_or(unknown);
    call.respond(
        Response::new("quote.success")
            .vars(vars! { "user" => user, "content" => quote.content, "id" => quote.id })
            .public(),
    )
    .await
}

async fn random(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?.to_string();
    let user = call
        .user("user")
        .map(|user| user.id.to_string())
        .ok_or_else(|| anyhow::anyhow!("quote user not resolved"))?;
    let quote = call
        .data
        .db
        .run_blocking(move |db| db.random_quote(&guild, &user))
        .await?;
    show(&call, quote).await
}

async fn get(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?.to_string();
    let id = call.int("id").unwrap_or_default();
    let quote = call
        .data
        .db
        .run_blocking(move |db| db.get_quote(&guild, id))
        .await?;
    show(&call, quote).await
}

/// Stores a quote unless it targets the bot or repeats an existing one.
async fn store(call: &Invocation, guild: GuildId, target: &User, content: String) -> anyhow::Result<()> {
    if target.bot {
        return call.respond(Response::new("quotes/add.botTarget")).await;
    }
    let guild_key = guild.to_string();
    let user = target.id.to_string();
    let added_by = call.author().id.to_string();
    let outcome = call
        .data
        .db
        .run_blocking(move |db| db.add_quote(&guild_key, &user, &added_by, &content))
        .await?;
    match outcome {
        AddQuote::Added(id) => {
            info!("Added quote {} for {} in {}", id, target.id, guild);
            call.respond(Response::new("quotes/add.success").vars(vars! { "id" => id }))
                .await
        }
        AddQuote::Duplicate => call.respond(Response::new("quotes/add.duplicate")).await,
    }
}

async fn add(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?;
    let target = call
        .user("user")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("quote user not resolved"))?;
    let text = call.str("text").unwrap_or_default().to_string();
    store(&call, guild, &target, text).await
}

async fn add_from_message(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?;
    let message = call
        .target_message()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("target message not resolved"))?;
    store(&call, guild, &message.author, message.content).await
}

async fn find(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?.to_string();
    let text = call.str("text_search").map(str::to_string);
    let user = call.user("user").map(|user| user.id.to_string());
    // One extra row tells whether there are more matches than shown.
    let mut found = call
        .data
        .db
        .run_blocking(move |db| db.find_quotes(&guild, text.as_deref(), user.as_deref(), FIND_LIMIT + 1))
        .await?;
    if found.is_empty() {
        return call.reply("empty", vars!()).await;
    }
    let has_more = found.len() > FIND_LIMIT;
    found.truncate(FIND_LIMIT);

    let unknown = call.render("quote.unknownUser", &vars!(), false);
    let mut embed = CreateEmbed::new().title(call.render(".title", &vars!(), false));
    for quote in found {
        let name = call
            .member_name(&quote.user_id)
            .await
            .unwrap_or_else(|| unknown.clone());
        embed = embed.field(format!("[#{}] {}", quote.id, name), quote.content, false);
    }
    if has_more {
        embed = embed.footer(CreateEmbedFooter::new(call.render(".hasMore", &vars!(), false)));
    }
    call.respond(Response::new(".listed").embed(embed)).await
}

async fn delete(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?.to_string();
    let id = call.int("id").unwrap_or_default();
    let deleted = call
        .data
        .db
        .run_blocking(move |db| db.delete_quote(&guild, id))
        .await?;
    if deleted {
        info!("Deleted quote {}", id);
        call.reply("success", vars! { "id" => id }).await
    } else {
        call.reply("missing", vars! { "id" => id }).await
    }
}
