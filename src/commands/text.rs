use crate::commands::tree::{CommandNode, OptionKind, OptionSpec};
use crate::commands::{Invocation, Response};
use crate::{handler, vars};
use rand::Rng;
use serenity::all::{CreateAttachment, PartialMember, User};

const MIN_SIDES: i64 = 3;
const MAX_SIDES: i64 = 120;
const PETPET_URL: &str = "https://memeado.vercel.app/api/petpet";

pub fn flip() -> CommandNode<Invocation> {
    CommandNode::leaf("flip", handler!(flip_coin))
}

pub fn roll() -> CommandNode<Invocation> {
    CommandNode::leaf("roll", handler!(roll_die)).option(OptionSpec::new("sides", OptionKind::Integer).required())
}

pub fn petpet() -> CommandNode<Invocation> {
    CommandNode::leaf("petpet", handler!(petpet_gif)).option(OptionSpec::new("user", OptionKind::User).required())
}

/// A playful `/<name> user` command with `.self`, `.bot` and `.user` phrasings.
pub fn targeted(name: &'static str) -> CommandNode<Invocation> {
    CommandNode::leaf(name, handler!(targeted_action)).option(OptionSpec::new("user", OptionKind::User).required())
}

async fn flip_coin(call: Invocation) -> anyhow::Result<()> {
    let (failed, heads) = {
        let mut rng = rand::rng();
        (rng.random::<f32>() < 0.01, rng.random::<f32>() < 0.5)
    };
    if failed {
        return call.respond(Response::new(".failure").public()).await;
    }
    let result = call
        .data
        .i18n
        .text(call.guild_locale(), if heads { "flip.heads" } else { "flip.tails" });
    call.respond(Response::new(".success").vars(vars! { "result" => result }).public())
        .await
}

/// Response suffix and rolled value for a die with `sides` sides.
fn roll_outcome(sides: i64) -> (&'static str, Option<i64>) {
    if sides < MIN_SIDES {
        ("tooFewSides", None)
    } else if sides > MAX_SIDES {
        ("tooManySides", None)
    } else {
        ("success", Some(rand::rng().random_range(1..=sides)))
    }
}

async fn roll_die(call: Invocation) -> anyhow::Result<()> {
    let sides = call.int("sides").unwrap_or_default();
    let (suffix, result) = roll_outcome(sides);
    let mut vars = vars! { "sides" => sides };
    if let Some(result) = result {
        vars.insert("result".into(), result.to_string());
    }
    call.respond(Response::new(format!(".{}", suffix)).vars(vars).public())
        .await
}

/// Generator request for an avatar. The generator only reads PNG images.
fn petpet_url(avatar: &str) -> anyhow::Result<reqwest::Url> {
    let png = avatar.replacen(".webp", ".png", 1);
    Ok(reqwest::Url::parse_with_params(PETPET_URL, &[("image", png)])?)
}

async fn petpet_gif(call: Invocation) -> anyhow::Result<()> {
    let target = call
        .user("user")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("target user not resolved"))?;
    let url = petpet_url(&target.face())?;
    let gif = call
        .data
        .http_client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    let attachment = CreateAttachment::bytes(gif.to_vec(), format!("{}_petpet.gif", target.name));
    call.respond(
        Response::new(".success")
            .vars(vars! { "target" => target.display_name() })
            .attach(attachment)
            .public(),
    )
    .await
}

async fn targeted_action(call: Invocation) -> anyhow::Result<()> {
    let guild_id = call.guild_id()?;
    if !call
        .data
        .fun_cooldown
        .can(&call.data.guild_config, guild_id, call.interaction.channel_id, call.actor())
    {
        return call.respond(Response::new("base.cooldown")).await;
    }

    let target = call
        .user("user")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("target user not resolved"))?;
    let command = call.key().to_string();
    let mut vars = call.data.i18n.fragments(call.guild_locale(), &command);
    vars.insert("author".into(), call.author_name());

    let bot_id = call.ctx.cache.current_user().id;
    let mut response = if target.id == call.author().id {
        vars.insert("target".into(), call.author_name());
        Response::new(".self")
    } else if target.id == bot_id {
        let name = match guild_id.member(&call.ctx, bot_id).await {
            Ok(member) => member.display_name().to_string(),
            Err(_) => target.display_name().to_string(),
        };
        vars.insert("target".into(), name);
        Response::new(".bot")
    } else {
        let member = call.interaction.data.resolved.members.get(&target.id);
        let (text, mention) = mention_if_wanted(&call, &target, member).await;
        vars.insert("target".into(), text);
        let response = Response::new(".user");
        if mention {
            response.mention(target.id)
        } else {
            response
        }
    };
    response = response.vars(vars).public();
    call.respond(response).await
}

/// Mentions `target` unless they opted out or are a moderator.
async fn mention_if_wanted(call: &Invocation, target: &User, member: Option<&PartialMember>) -> (String, bool) {
    let display = member
        .and_then(|m| m.nick.clone())
        .unwrap_or_else(|| target.display_name().to_string());
    let moderator = member
        .and_then(|m| m.permissions)
        .is_some_and(|p| p.manage_messages());
    let suppressed = match call.data.users.get(target.id).await {
        Ok(user) => user.suppress_mentions,
        Err(_) => true,
    };
    if suppressed || moderator {
        (display, false)
    } else {
        (format!("<@{}>", target.id), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_bounds() {
        assert_eq!(roll_outcome(2), ("tooFewSides", None));
        assert_eq!(roll_outcome(121), ("tooManySides", None));
        for _ in 0..200 {
            let (suffix, result) = roll_outcome(6);
            assert_eq!(suffix, "success");
            assert!((1..=6).contains(&result.unwrap()));
        }
        assert_eq!(roll_outcome(MIN_SIDES).0, "success");
        assert_eq!(roll_outcome(MAX_SIDES).0, "success");
    }

    #[test]
    fn test_petpet_url_asks_for_png() {
        let url = petpet_url("https://cdn.discordapp.com/avatars/1/abc.webp?size=1024").unwrap();
        assert_eq!(
            url.as_str(),
            "https://memeado.vercel.app/api/petpet?image=https%3A%2F%2Fcdn.discordapp.com%2Favatars%2F1%2Fabc.png%3Fsize%3D1024"
        );
        let gif = petpet_url("https://cdn.discordapp.com/avatars/1/a_abc.gif").unwrap();
        assert_eq!(
            gif.query_pairs().next().map(|(_, v)| v.into_owned()),
            Some("https://cdn.discordapp.com/avatars/1/a_abc.gif".to_string())
        );
    }
}
