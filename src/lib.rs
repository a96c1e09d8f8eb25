pub mod bot;
pub mod cache;
pub mod commands;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod events;
pub mod guild_config;
pub mod i18n;
pub mod llm;
pub mod messenger;
pub mod services;
pub mod shutdown;
pub mod supervisor;
pub mod tasks;
pub mod timeparse;
pub mod twitch;

use std::sync::Arc;
use std::time::Duration;

/// Shared state handed to every command, event and periodic task, across all sessions.
pub struct Data {
    pub config: config::Config,
    pub db: db::Database,
    pub guild_config: guild_config::GuildConfigCache,
    pub users: services::UserService,
    pub schedule: services::ScheduleService,
    pub i18n: i18n::Localizer,
    pub commands: commands::tree::CommandTree<commands::Invocation>,
    pub llm: llm::LlmClient,
    pub twitch: twitch::TwitchClient,
    pub http_client: reqwest::Client,
    pub locales: messenger::LocaleCache,
    /// Shared by the playful targeted commands (bap, hug, ...).
    pub fun_cooldown: cooldown::CooldownManager,
    pub chat: events::chat::ChatState,
    pub mod_log: events::logging::ModLog,
    pub shutdown: shutdown::Shutdown,
}

impl Data {
    pub fn new(config: config::Config, db: db::Database) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::new();
        Ok(Self {
            guild_config: guild_config::GuildConfigCache::new(Arc::new(db.clone())),
            users: services::UserService::new(db.clone()),
            schedule: services::ScheduleService::new(db.clone()),
            i18n: i18n::Localizer::embedded()?,
            commands: commands::build_tree()?,
            llm: llm::LlmClient::new(&config),
            twitch: twitch::TwitchClient::new(
                http_client.clone(),
                config.twitch_client_id.clone(),
                config.twitch_client_secret.clone(),
            )?,
            http_client,
            locales: messenger::LocaleCache::default(),
            fun_cooldown: cooldown::CooldownManager::new(3, 5, Duration::from_secs(5 * 60)),
            chat: events::chat::ChatState::default(),
            mod_log: events::logging::ModLog::default(),
            shutdown: shutdown::Shutdown::new(),
            config,
            db,
        })
    }
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
pub(crate) fn test_data() -> Arc<Data> {
    let config = config::Config {
        database_url: ":memory:".into(),
        openai_api_key: "test".into(),
        openai_model: config::DEFAULT_OPENAI_MODEL.into(),
        openai_base_url: None,
        bsky_username: "test".into(),
        bsky_app_password: "test".into(),
        youtube_api_key: "test".into(),
        twitch_client_id: "test".into(),
        twitch_client_secret: "test".into(),
        log_level: "info".into(),
        log_json: false,
    };
    let db = db::Database::open_in_memory().unwrap();
    Arc::new(Data::new(config, db).unwrap())
}
