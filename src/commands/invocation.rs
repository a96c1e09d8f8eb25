use crate::commands::tree::Routable;
use crate::cooldown::Actor;
use crate::i18n::{Vars, DEFAULT_LOCALE};
use crate::Data;
use serenity::all::{
    Attachment, AutocompleteChoice, CommandDataOptionValue, CommandInteraction, Context, CreateAllowedMentions,
    CreateAttachment, CreateAutocompleteResponse, CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
    GuildId, Message, ResolvedTarget, User, UserId,
};
use std::sync::Arc;

/// A reply to an interaction. Keys starting with `.` are relative to the command's key.
pub struct Response {
    key: String,
    vars: Vars,
    public: bool,
    mentions: Vec<UserId>,
    embeds: Vec<CreateEmbed>,
    attachments: Vec<CreateAttachment>,
}

impl Response {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            vars: Vars::new(),
            public: false,
            mentions: Vec::new(),
            embeds: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn vars(mut self, vars: Vars) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Visible to the whole channel, rendered in the guild's locale.
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn mention(mut self, user: UserId) -> Self {
        self.mentions.push(user);
        self
    }

    pub fn embed(mut self, embed: CreateEmbed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn attach(mut self, attachment: CreateAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// One slash command, context menu, or autocomplete request being routed.
pub struct Invocation {
    pub data: Arc<Data>,
    pub ctx: Context,
    pub interaction: CommandInteraction,
    options: Vec<serenity::all::CommandDataOption>,
    key: String,
    autocomplete: bool,
}

impl Routable for Invocation {
    fn command_name(&self) -> &str {
        &self.interaction.data.name
    }

    fn take_subcommand(&mut self) -> Option<String> {
        let first = self.options.first()?;
        match &first.value {
            CommandDataOptionValue::SubCommand(inner) | CommandDataOptionValue::SubCommandGroup(inner) => {
                let name = first.name.clone();
                self.options = inner.clone();
                Some(name)
            }
            _ => None,
        }
    }

    fn enter(&mut self, key: &str) {
        self.key = key.to_string();
    }

    fn is_autocomplete(&self) -> bool {
        self.autocomplete
    }
}

impl Invocation {
    pub fn new(data: Arc<Data>, ctx: Context, interaction: CommandInteraction, autocomplete: bool) -> Self {
        let options = interaction.data.options.clone();
        Self {
            data,
            ctx,
            interaction,
            options,
            key: String::new(),
            autocomplete,
        }
    }

    /// Localization key of the resolved command, e.g. `reminder/set`.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn option(&self, name: &str) -> Option<&CommandDataOptionValue> {
        self.options
            .iter()
            .find(|option| option.name == name)
            .map(|option| &option.value)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.option(name)? {
            CommandDataOptionValue::String(value) => Some(value),
            CommandDataOptionValue::Autocomplete { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.option(name)? {
            CommandDataOptionValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.option(name)? {
            CommandDataOptionValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        match self.option(name)? {
            CommandDataOptionValue::User(id) => self.interaction.data.resolved.users.get(id),
            _ => None,
        }
    }

    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        match self.option(name)? {
            CommandDataOptionValue::Attachment(id) => self.interaction.data.resolved.attachments.get(id),
            _ => None,
        }
    }

    /// What the user has typed so far into the option being autocompleted.
    pub fn focused(&self) -> &str {
        self.options
            .iter()
            .find_map(|option| match &option.value {
                CommandDataOptionValue::Autocomplete { value, .. } => Some(value.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    pub fn target_user(&self) -> Option<&User> {
        match self.interaction.data.target()? {
            ResolvedTarget::User(user, _) => Some(user),
            _ => None,
        }
    }

    pub fn target_message(&self) -> Option<&Message> {
        match self.interaction.data.target()? {
            ResolvedTarget::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn author(&self) -> &User {
        &self.interaction.user
    }

    pub fn author_name(&self) -> String {
        self.interaction
            .member
            .as_ref()
            .map(|member| member.display_name().to_string())
            .unwrap_or_else(|| self.interaction.user.display_name().to_string())
    }

    /// Guild display name of a stored user id, `None` if they left or the id is malformed.
    pub async fn member_name(&self, user_id: &str) -> Option<String> {
        let guild_id = self.interaction.guild_id?;
        let id = user_id.parse::<u64>().ok().filter(|id| *id != 0)?;
        let member = guild_id.member(&self.ctx, UserId::new(id)).await.ok()?;
        Some(member.display_name().to_string())
    }

    pub fn actor(&self) -> Actor {
        Actor::new(
            self.interaction.user.id,
            self.interaction.member.as_ref().and_then(|member| member.permissions),
        )
    }

    pub fn guild_id(&self) -> anyhow::Result<GuildId> {
        self.interaction
            .guild_id
            .ok_or_else(|| anyhow::anyhow!("command {} used outside a guild", self.key))
    }

    /// Ephemeral replies follow the user's client language; public ones the guild's.
    pub fn locale(&self, public: bool) -> &str {
        if public {
            self.interaction.guild_locale.as_deref().unwrap_or(DEFAULT_LOCALE)
        } else {
            &self.interaction.locale
        }
    }

    pub fn guild_locale(&self) -> &str {
        self.locale(true)
    }

    pub fn resolve_key(&self, key: &str) -> String {
        match key.strip_prefix('.') {
            Some(suffix) => format!("{}.{}", self.key, suffix),
            None => key.to_string(),
        }
    }

    pub fn render(&self, key: &str, vars: &Vars, public: bool) -> String {
        self.data.i18n.render(self.locale(public), &self.resolve_key(key), vars)
    }

    pub async fn respond(&self, response: Response) -> anyhow::Result<()> {
        let content = self.render(&response.key, &response.vars, response.public);
        let mut message = CreateInteractionResponseMessage::new()
            .content(content)
            .ephemeral(!response.public)
            .allowed_mentions(CreateAllowedMentions::new().users(response.mentions));
        for embed in response.embeds {
            message = message.embed(embed);
        }
        for attachment in response.attachments {
            message = message.add_file(attachment);
        }
        self.interaction
            .create_response(&self.ctx.http, CreateInteractionResponse::Message(message))
            .await?;
        Ok(())
    }

    /// Shorthand for an ephemeral reply relative to the command key.
    pub async fn reply(&self, suffix: &str, vars: Vars) -> anyhow::Result<()> {
        self.respond(Response::new(format!(".{}", suffix)).vars(vars)).await
    }

    pub async fn autocomplete(&self, choices: Vec<AutocompleteChoice>) -> anyhow::Result<()> {
        let response = CreateAutocompleteResponse::new().set_choices(choices);
        self.interaction
            .create_response(&self.ctx.http, CreateInteractionResponse::Autocomplete(response))
            .await?;
        Ok(())
    }
}
