//! Moderation log: posts embeds about edits, deletions, bans, kicks and timeouts.
//!
//! Messages are cached while a guild has a log channel so that edits and deletions can show
//! the previous content. Audit log entries arrive on their own event, usually shortly after
//! the action they describe; handlers poll the audit cache briefly to attribute an action.

use crate::cache::ExpiringLru;
use crate::guild_config::LOGS_CHANNEL_ID;
use crate::Data;
use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId, Context, CreateEmbed, CreateMessage, GuildId, GuildMemberUpdateEvent, Member, Message,
    MessageId, MessageUpdateEvent, Timestamp, User, UserId,
};
use serenity::model::guild::audit_log::{Action, AuditLogEntry, Change, MemberAction, MessageAction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const MESSAGE_CACHE_SIZE: usize = 100_000;
const MESSAGE_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const AUDIT_CACHE_SIZE: usize = 1_000;
const AUDIT_CACHE_TTL: Duration = Duration::from_secs(5);
const AUDIT_ATTEMPTS: usize = 10;
const AUDIT_DELAY: Duration = Duration::from_millis(500);

const COLOR_BAN: u32 = 0xE63946;
const COLOR_UNBAN: u32 = 0xADC178;
const COLOR_KICK: u32 = 0xFB5607;
const COLOR_LEAVE: u32 = 0xDAD7CD;
const COLOR_TIMEOUT: u32 = 0xFFBE0B;
const COLOR_TIMEOUT_REMOVED: u32 = 0xFFD166;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedMessage {
    pub author: UserId,
    pub content: String,
    pub sent_at: i64,
    pub attachments: Vec<String>,
}

impl From<&Message> for CachedMessage {
    fn from(message: &Message) -> Self {
        Self {
            author: message.author.id,
            content: message.content.clone(),
            sent_at: message.timestamp.unix_timestamp(),
            attachments: message.attachments.iter().map(|a| a.url.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditKind {
    MessageDelete,
    Ban,
    Unban,
    Kick,
    Timeout,
}

/// Audit entries are matched by kind and target. Message deletions use channel + author.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuditKey {
    pub kind: AuditKind,
    pub target: String,
}

impl AuditKey {
    pub fn new(kind: AuditKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub actor: UserId,
    pub reason: Option<String>,
}

pub struct ModLog {
    messages: ExpiringLru<MessageId, CachedMessage>,
    audit: ExpiringLru<AuditKey, AuditRecord>,
}

impl Default for ModLog {
    fn default() -> Self {
        Self {
            messages: ExpiringLru::new(MESSAGE_CACHE_SIZE, MESSAGE_CACHE_TTL),
            audit: ExpiringLru::new(AUDIT_CACHE_SIZE, AUDIT_CACHE_TTL),
        }
    }
}

impl ModLog {
    pub fn remember(&self, id: MessageId, message: CachedMessage) {
        self.messages.insert(id, message);
    }

    pub fn record_audit(&self, key: AuditKey, record: AuditRecord) {
        self.audit.insert(key, record);
    }

    /// Polls the audit cache a few times for an entry matching `key`.
    pub async fn wait_for_audit(&self, key: &AuditKey) -> Option<AuditRecord> {
        for attempt in 0..AUDIT_ATTEMPTS {
            if let Some(record) = self.audit.get(key) {
                return Some(record);
            }
            if attempt + 1 < AUDIT_ATTEMPTS {
                tokio::time::sleep(AUDIT_DELAY).await;
            }
        }
        None
    }
}

fn with_audit(embed: CreateEmbed, record: Option<AuditRecord>) -> CreateEmbed {
    let Some(record) = record else {
        return embed;
    };
    embed
        .field("Performed By", format!("<@{}>", record.actor), true)
        .field(
            "Reason",
            record
                .reason
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| "Not provided".to_string()),
            false,
        )
}

fn message_url(guild: GuildId, channel: ChannelId, message: MessageId) -> String {
    format!("https://discord.com/channels/{}/{}/{}", guild, channel, message)
}

fn user_embed(title: &str, color: u32, user: &User) -> CreateEmbed {
    CreateEmbed::new()
        .title(title)
        .color(color)
        .field("User ID", user.id.to_string(), true)
        .field("Username", user.name.clone(), true)
}

pub fn edited_embed(
    guild: GuildId,
    channel: ChannelId,
    id: MessageId,
    cached: &CachedMessage,
    new_content: &str,
) -> CreateEmbed {
    CreateEmbed::new()
        .title("Message Updated")
        .field("Channel", format!("<#{}>", channel), true)
        .field("Originally Sent", format!("<t:{}:f>", cached.sent_at), true)
        .field("Message URL", message_url(guild, channel, id), false)
        .field("Previous Content", cached.content.clone(), false)
        .field("New Content", new_content, false)
}

pub fn deleted_embed(
    guild: GuildId,
    channel: ChannelId,
    id: MessageId,
    cached: &CachedMessage,
    audit: Option<AuditRecord>,
) -> CreateEmbed {
    let attachments = if cached.attachments.is_empty() {
        "None".to_string()
    } else {
        cached.attachments.join(", ")
    };
    let embed = CreateEmbed::new()
        .title("Message Deleted")
        .field("Channel", format!("<#{}>", channel), true)
        .field("Sent At", format!("<t:{}:f>", cached.sent_at), true)
        .field("Message URL", message_url(guild, channel, id), false)
        .field("Content", cached.content.clone(), false)
        .field("Attachments", attachments, false);
    with_audit(embed, audit)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeoutChange {
    Set(DateTime<Utc>),
    Removed,
}

/// Compares a member's timeout before and after an update. `before` is `None` when the old
/// state is unknown, in which case nothing is reported.
pub fn timeout_change(
    before: Option<Option<DateTime<Utc>>>,
    after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<TimeoutChange> {
    let before = before?;
    match after {
        Some(until) if until > now && Some(until) != before => Some(TimeoutChange::Set(until)),
        _ if before.is_some_and(|until| until > now) && !after.is_some_and(|until| until > now) => {
            Some(TimeoutChange::Removed)
        }
        _ => None,
    }
}

fn to_utc(at: Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(at.unix_timestamp(), 0)
}

fn log_channel(data: &Data, guild: GuildId) -> Option<ChannelId> {
    data.guild_config
        .get(&LOGS_CHANNEL_ID, guild)
        .ok()
        .map(|id| id.channel())
}

async fn post(ctx: &Context, channel: ChannelId, embed: CreateEmbed) -> anyhow::Result<()> {
    channel
        .send_message(&ctx.http, CreateMessage::new().embed(embed))
        .await?;
    Ok(())
}

pub async fn on_message(data: Arc<Data>, message: Message) -> anyhow::Result<()> {
    let Some(guild) = message.guild_id else {
        return Ok(());
    };
    if message.author.bot || log_channel(&data, guild).is_none() {
        return Ok(());
    }
    trace!("Caching message {}", message.id);
    data.mod_log.remember(message.id, CachedMessage::from(&message));
    Ok(())
}

pub async fn on_message_update(ctx: Context, data: Arc<Data>, event: MessageUpdateEvent) -> anyhow::Result<()> {
    let Some(guild) = event.guild_id else {
        return Ok(());
    };
    let Some(channel) = log_channel(&data, guild) else {
        return Ok(());
    };
    let Some(mut cached) = data.mod_log.messages.get(&event.id) else {
        debug!("Message {} updated, but not found in cache", event.id);
        return Ok(());
    };
    let is_human = event.author.as_ref().is_some_and(|author| !author.bot);
    let Some(content) = event.content.clone() else {
        return Ok(());
    };
    if is_human && event.edited_timestamp.is_some() {
        let embed = edited_embed(guild, event.channel_id, event.id, &cached, &content);
        post(&ctx, channel, embed).await?;
    }
    cached.content = content;
    data.mod_log.remember(event.id, cached);
    Ok(())
}

pub async fn on_message_delete(
    ctx: Context,
    data: Arc<Data>,
    guild: Option<GuildId>,
    channel_id: ChannelId,
    id: MessageId,
) -> anyhow::Result<()> {
    let Some(guild) = guild else {
        return Ok(());
    };
    let Some(channel) = log_channel(&data, guild) else {
        return Ok(());
    };
    let Some(cached) = data.mod_log.messages.remove(&id) else {
        debug!("Message {} deleted, but not found in cache", id);
        return Ok(());
    };
    let key = AuditKey::new(AuditKind::MessageDelete, format!("{}{}", channel_id, cached.author));
    let audit = data.mod_log.wait_for_audit(&key).await;
    post(&ctx, channel, deleted_embed(guild, channel_id, id, &cached, audit)).await
}

pub async fn on_ban(ctx: Context, data: Arc<Data>, guild: GuildId, user: User) -> anyhow::Result<()> {
    let Some(channel) = log_channel(&data, guild) else {
        return Ok(());
    };
    let audit = data
        .mod_log
        .wait_for_audit(&AuditKey::new(AuditKind::Ban, user.id.to_string()))
        .await;
    let embed = with_audit(user_embed("User Banned", COLOR_BAN, &user), audit);
    post(&ctx, channel, embed).await
}

pub async fn on_unban(ctx: Context, data: Arc<Data>, guild: GuildId, user: User) -> anyhow::Result<()> {
    let Some(channel) = log_channel(&data, guild) else {
        return Ok(());
    };
    let audit = data
        .mod_log
        .wait_for_audit(&AuditKey::new(AuditKind::Unban, user.id.to_string()))
        .await;
    let embed = user_embed("User Unbanned", COLOR_UNBAN, &user).thumbnail(user.face());
    post(&ctx, channel, with_audit(embed, audit)).await
}

/// A member leaving is reported as a kick when a matching audit entry shows up.
pub async fn on_leave(ctx: Context, data: Arc<Data>, guild: GuildId, user: User) -> anyhow::Result<()> {
    let Some(channel) = log_channel(&data, guild) else {
        return Ok(());
    };
    let audit = data
        .mod_log
        .wait_for_audit(&AuditKey::new(AuditKind::Kick, user.id.to_string()))
        .await;
    let embed = match audit {
        Some(record) => with_audit(
            user_embed("User Kicked", COLOR_KICK, &user).thumbnail(user.face()),
            Some(record),
        ),
        None => user_embed("User Left", COLOR_LEAVE, &user),
    };
    post(&ctx, channel, embed).await
}

pub async fn on_member_update(
    ctx: Context,
    data: Arc<Data>,
    old: Option<Member>,
    event: GuildMemberUpdateEvent,
) -> anyhow::Result<()> {
    let Some(channel) = log_channel(&data, event.guild_id) else {
        return Ok(());
    };
    let before = old.map(|member| member.communication_disabled_until.and_then(to_utc));
    let after = event.communication_disabled_until.and_then(to_utc);
    let nick = event.nick.clone().unwrap_or_default();
    let embed = match timeout_change(before, after, Utc::now()) {
        Some(TimeoutChange::Set(until)) => user_embed("User Timed Out", COLOR_TIMEOUT, &event.user)
            .field("Server Name", nick, true)
            .field("Until", format!("<t:{}:f>", until.timestamp()), false),
        Some(TimeoutChange::Removed) => {
            user_embed("User Timeout Removed", COLOR_TIMEOUT_REMOVED, &event.user).field("Server Name", nick, true)
        }
        None => return Ok(()),
    };
    post(&ctx, channel, embed).await
}

/// Key under which an audit entry is cached, for the actions the log attributes.
pub fn audit_key(entry: &AuditLogEntry) -> Option<AuditKey> {
    let target = entry.target_id.map(|id| id.to_string()).unwrap_or_default();
    match entry.action {
        Action::Message(MessageAction::Delete) | Action::Message(MessageAction::BulkDelete) => {
            let channel = entry
                .options
                .as_ref()
                .and_then(|options| options.channel_id)
                .map(|id| id.to_string())
                .unwrap_or_default();
            Some(AuditKey::new(AuditKind::MessageDelete, format!("{}{}", channel, target)))
        }
        Action::Member(MemberAction::BanAdd) => Some(AuditKey::new(AuditKind::Ban, target)),
        Action::Member(MemberAction::BanRemove) => Some(AuditKey::new(AuditKind::Unban, target)),
        Action::Member(MemberAction::Kick) => Some(AuditKey::new(AuditKind::Kick, target)),
        Action::Member(MemberAction::Update) => {
            let timeout = entry
                .changes
                .as_ref()
                .and_then(|changes| changes.first())
                .is_some_and(|change| matches!(change, Change::CommunicationDisabledUntil { .. }));
            timeout.then(|| AuditKey::new(AuditKind::Timeout, target))
        }
        _ => None,
    }
}

pub async fn on_audit_entry(data: Arc<Data>, entry: AuditLogEntry) -> anyhow::Result<()> {
    if let Some(key) = audit_key(&entry) {
        trace!("Caching audit entry {:?}", key);
        data.mod_log.record_audit(
            key,
            AuditRecord {
                actor: entry.user_id,
                reason: entry.reason.clone(),
            },
        );
    }
    Ok(())
}
