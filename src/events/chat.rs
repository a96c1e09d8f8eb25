//! Replies from the language model when someone mentions the bot.

use crate::cache::RingBuffer;
use crate::cooldown::{Actor, CooldownManager};
use crate::guild_config::{CHAT_PROMPTS, CHAT_ROLE_IDS};
use crate::i18n::render_template;
use crate::{vars, Data};
use chrono::Utc;
use serenity::all::{ChannelId, Context, CreateAllowedMentions, CreateMessage, Message};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

const HISTORY_SIZE: usize = 10;
const DEFAULT_PROMPT: &str = include_str!("chat_default_prompt.txt");
const HISTORY_INSTRUCTION: &str =
    "The message contains the most recent conversation in the channel for context. Respond only to the last message.";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub author: String,
    pub content: String,
}

impl From<&Message> for ChatLine {
    fn from(message: &Message) -> Self {
        Self {
            author: message.author.name.clone(),
            content: message.content.clone(),
        }
    }
}

/// Recent channel history and the chat rate limiter.
pub struct ChatState {
    histories: Mutex<HashMap<ChannelId, RingBuffer<ChatLine>>>,
    cooldown: CooldownManager,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
            cooldown: CooldownManager::new(2, 5, Duration::from_secs(3 * 60)),
        }
    }
}

impl ChatState {
    pub fn record(&self, channel: ChannelId, line: ChatLine) {
        self.histories
            .lock()
            .unwrap()
            .entry(channel)
            .or_insert_with(|| RingBuffer::new(HISTORY_SIZE))
            .push(line);
    }

    /// Oldest to newest.
    pub fn history(&self, channel: ChannelId) -> Vec<ChatLine> {
        self.histories
            .lock()
            .unwrap()
            .get(&channel)
            .map(RingBuffer::to_vec)
            .unwrap_or_default()
    }
}

/// System prompt and the single user turn sent to the model.
pub fn build_request(prompt: &str, history: &[ChatLine]) -> (String, String) {
    let system = format!("{}\n\n{}", prompt.trim_end(), HISTORY_INSTRUCTION);
    let transcript = history
        .iter()
        .map(|line| format!("[{}] {}", line.author, line.content))
        .collect::<Vec<_>>()
        .join("\n");
    (system, transcript)
}

pub async fn on_message(ctx: Context, data: Arc<Data>, message: Message) -> anyhow::Result<()> {
    let Some(guild) = message.guild_id else {
        return Ok(());
    };
    // No role list means chat is off. Listing @everyone turns it on for all.
    let Some(role_ids) = data.guild_config.get(&CHAT_ROLE_IDS, guild).ok() else {
        trace!("Chat not configured for {}", guild);
        return Ok(());
    };
    data.chat.record(message.channel_id, ChatLine::from(&message));

    let bot_id = ctx.cache.current_user().id;
    if message.author.bot || !message.mentions.iter().any(|user| user.id == bot_id) {
        return Ok(());
    }

    let member = message.member.as_deref();
    let actor = Actor::new(message.author.id, member.and_then(|m| m.permissions));
    if !data.chat.cooldown.can(&data.guild_config, guild, message.channel_id, actor) {
        let locale = data.locales.get(&*ctx.http, guild).await;
        message
            .reply(&ctx.http, data.i18n.text(&locale, "chat.cooldown"))
            .await?;
        return Ok(());
    }

    let roles = member.map(|m| m.roles.as_slice()).unwrap_or_default();
    let privileged = role_ids.is_empty() || role_ids.iter().any(|id| roles.contains(&id.role()));
    let (prompt, history) = if privileged {
        debug!("{} has a chat role, using the guild prompt", message.author.id);
        let template = data
            .guild_config
            .get(&CHAT_PROMPTS, guild)
            .ok()
            .unwrap_or_default()
            .join("\n");
        let bot_name = match guild.member(&ctx, bot_id).await {
            Ok(me) => me.display_name().to_string(),
            Err(_) => ctx.cache.current_user().name.clone(),
        };
        let guild_name = ctx
            .cache
            .guild(guild)
            .map(|g| g.name.clone())
            .unwrap_or_default();
        let user_name = member
            .and_then(|m| m.nick.clone())
            .unwrap_or_else(|| message.author.display_name().to_string());
        let prompt = render_template(
            &template,
            &vars! {
                "bot_name" => bot_name,
                "guild_name" => guild_name,
                "current_time_utc" => Utc::now().to_rfc2822(),
                "user_name" => user_name,
                "user_mention" => format!("<@{}>", message.author.id),
                "is_mod" => actor.moderator,
            },
        );
        (prompt, data.chat.history(message.channel_id))
    } else {
        debug!("{} lacks a chat role, using the default prompt", message.author.id);
        (DEFAULT_PROMPT.to_string(), vec![ChatLine::from(&message)])
    };

    let (system, transcript) = build_request(&prompt, &history);
    debug!("Sending {} lines of history to the model", history.len());
    let reply = data.llm.reply(&system, &[transcript]).await?;
    message
        .channel_id
        .send_message(
            &ctx.http,
            CreateMessage::new()
                .content(reply)
                .reference_message(&message)
                .allowed_mentions(CreateAllowedMentions::new().replied_user(true)),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(author: &str, content: &str) -> ChatLine {
        ChatLine {
            author: author.into(),
            content: content.into(),
        }
    }

    #[test]
    fn test_history_keeps_last_ten_per_channel() {
        let state = ChatState::default();
        let (a, b) = (ChannelId::new(1), ChannelId::new(2));
        for i in 0..12 {
            state.record(a, line("ana", &i.to_string()));
        }
        state.record(b, line("bo", "hi"));

        let history = state.history(a);
        assert_eq!(history.len(), HISTORY_SIZE);
        assert_eq!(history.first().unwrap().content, "2");
        assert_eq!(history.last().unwrap().content, "11");
        assert_eq!(state.history(b), vec![line("bo", "hi")]);
        assert!(state.history(ChannelId::new(3)).is_empty());
    }

    #[test]
    fn test_build_request() {
        let (system, transcript) = build_request("Be nice.\n", &[line("ana", "hi"), line("bo", "hello")]);
        assert!(system.starts_with("Be nice.\n\n"));
        assert!(system.ends_with("Respond only to the last message."));
        assert_eq!(transcript, "[ana] hi\n[bo] hello");
    }
}
