use crate::cache::ExpiringLru;
use crate::i18n::DEFAULT_LOCALE;
use async_trait::async_trait;
use serenity::all::{ChannelId, CreateMessage, GuildId, Http, RoleId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Outbound guild actions used by background work that has no gateway context of its own.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, channel: ChannelId, message: CreateMessage) -> anyhow::Result<()>;
    async fn guild_locale(&self, guild: GuildId) -> anyhow::Result<String>;
    async fn add_role(&self, guild: GuildId, user: UserId, role: RoleId) -> anyhow::Result<()>;
    async fn remove_role(&self, guild: GuildId, user: UserId, role: RoleId) -> anyhow::Result<()>;
}

#[async_trait]
impl Messenger for Http {
    async fn send(&self, channel: ChannelId, message: CreateMessage) -> anyhow::Result<()> {
        channel.send_message(self, message).await?;
        Ok(())
    }

    async fn guild_locale(&self, guild: GuildId) -> anyhow::Result<String> {
        Ok(self.get_guild(guild).await?.preferred_locale)
    }

    async fn add_role(&self, guild: GuildId, user: UserId, role: RoleId) -> anyhow::Result<()> {
        self.add_member_role(guild, user, role, None).await?;
        Ok(())
    }

    async fn remove_role(&self, guild: GuildId, user: UserId, role: RoleId) -> anyhow::Result<()> {
        self.remove_member_role(guild, user, role, None).await?;
        Ok(())
    }
}

/// Finds the session that serves a guild.
pub trait BotDirectory: Send + Sync {
    fn messenger(&self, guild: GuildId) -> Option<Arc<dyn Messenger>>;
}

/// Guild locales change rarely; one lookup per hour is plenty.
pub struct LocaleCache {
    cache: ExpiringLru<GuildId, String>,
}

impl Default for LocaleCache {
    fn default() -> Self {
        Self {
            cache: ExpiringLru::new(1024, Duration::from_secs(60 * 60)),
        }
    }
}

impl LocaleCache {
    /// The guild's preferred locale, or the default locale when it cannot be fetched.
    pub async fn get(&self, messenger: &dyn Messenger, guild: GuildId) -> String {
        if let Some(locale) = self.cache.get(&guild) {
            return locale;
        }
        match messenger.guild_locale(guild).await {
            Ok(locale) => {
                self.cache.insert(guild, locale.clone());
                locale
            }
            Err(e) => {
                warn!("Failed to fetch locale for guild {}: {}", guild, e);
                DEFAULT_LOCALE.to_string()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every action instead of talking to the platform.
    #[derive(Default)]
    pub struct FakeMessenger {
        pub sent: Mutex<Vec<(ChannelId, serde_json::Value)>>,
        pub roles_added: Mutex<Vec<(GuildId, UserId, RoleId)>>,
        pub roles_removed: Mutex<Vec<(GuildId, UserId, RoleId)>>,
        pub locale: Option<String>,
    }

    impl FakeMessenger {
        pub fn contents(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, body)| body["content"].as_str().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn send(&self, channel: ChannelId, message: CreateMessage) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((channel, serde_json::to_value(&message)?));
            Ok(())
        }

        async fn guild_locale(&self, _guild: GuildId) -> anyhow::Result<String> {
            self.locale
                .clone()
                .ok_or_else(|| anyhow::anyhow!("guild unavailable"))
        }

        async fn add_role(&self, guild: GuildId, user: UserId, role: RoleId) -> anyhow::Result<()> {
            self.roles_added.lock().unwrap().push((guild, user, role));
            Ok(())
        }

        async fn remove_role(&self, guild: GuildId, user: UserId, role: RoleId) -> anyhow::Result<()> {
            self.roles_removed.lock().unwrap().push((guild, user, role));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeDirectory {
        pub bots: HashMap<GuildId, Arc<FakeMessenger>>,
    }

    impl BotDirectory for FakeDirectory {
        fn messenger(&self, guild: GuildId) -> Option<Arc<dyn Messenger>> {
            self.bots
                .get(&guild)
                .map(|bot| bot.clone() as Arc<dyn Messenger>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeMessenger;
    use super::*;

    #[tokio::test]
    async fn test_locale_falls_back_and_caches() {
        let locales = LocaleCache::default();
        let guild = GuildId::new(1);

        let broken = FakeMessenger::default();
        assert_eq!(locales.get(&broken, guild).await, DEFAULT_LOCALE);

        let french = FakeMessenger {
            locale: Some("fr".into()),
            ..Default::default()
        };
        assert_eq!(locales.get(&french, guild).await, "fr");
        // Cached: a failing messenger no longer matters.
        assert_eq!(locales.get(&broken, guild).await, "fr");
    }
}
