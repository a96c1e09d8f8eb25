//! Per-guild configuration stored as JSON values in the database.
//!
//! Every lookup goes through [`GuildConfigCache`], which remembers both hits and misses for
//! an hour so that the event handlers checking "is this feature on for this guild?" on every
//! message do not touch storage.

use crate::cache::ExpiringLru;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serenity::all::{ChannelId, GuildId, RoleId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

const CACHE_CAPACITY: usize = 512;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Typed name of a configuration entry.
pub struct ConfigKey<T> {
    pub name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ConfigKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }
}

pub const DISCORD_TOKEN: ConfigKey<String> = ConfigKey::new("secret.discord.token");
pub const COOLDOWN_EXEMPT_CHANNELS: ConfigKey<Vec<Snowflake>> =
    ConfigKey::new("cooldown.exempt_channels");
pub const BIRTHDAY_CHANNEL: ConfigKey<Snowflake> = ConfigKey::new("profile.birthday_channel");
pub const LOGS_CHANNEL_ID: ConfigKey<Snowflake> = ConfigKey::new("logs.channel_id");
pub const REPORT_CHANNEL_ID: ConfigKey<Snowflake> = ConfigKey::new("report.channel_id");
pub const REPORT_MESSAGE: ConfigKey<String> = ConfigKey::new("report.message");

pub const YOUTUBE_PLAYLIST_IDS: ConfigKey<Vec<String>> =
    ConfigKey::new("youtube.notif.playlist_ids");
pub const YOUTUBE_CHANNEL_ID: ConfigKey<Snowflake> = ConfigKey::new("youtube.notif.channel_id");
pub const YOUTUBE_TEMPLATE: ConfigKey<String> = ConfigKey::new("youtube.notif.title_template");

pub const BSKY_CHANNEL_ID: ConfigKey<Snowflake> = ConfigKey::new("bsky.post_notif.channel_id");
pub const BSKY_USERS: ConfigKey<Vec<String>> = ConfigKey::new("bsky.post_notif.users");
pub const BSKY_TEMPLATE: ConfigKey<String> = ConfigKey::new("bsky.post_notif.title_template");

pub const TWITCH_LIVE_ROLE_ID: ConfigKey<Snowflake> = ConfigKey::new("twitch.live_role_id");
pub const TWITCH_LIVE_CHANNEL_ID: ConfigKey<Snowflake> = ConfigKey::new("twitch.live_channel_id");
pub const TWITCH_ELIGIBLE_ROLE_IDS: ConfigKey<Vec<Snowflake>> =
    ConfigKey::new("twitch.live_eligible_role_ids");
pub const TWITCH_LIVE_TEMPLATE: ConfigKey<String> = ConfigKey::new("twitch.live_template");

pub const TEMP_ROLE_ID: ConfigKey<Snowflake> = ConfigKey::new("roles.temp.role_id");
pub const TEMP_ROLE_DURATION_MINUTES: ConfigKey<u64> =
    ConfigKey::new("roles.temp.duration_minutes");

pub const REGULARS_ROLE_ID: ConfigKey<Snowflake> = ConfigKey::new("roles.regulars.role_id");
pub const REGULARS_MIN_MESSAGES: ConfigKey<u64> = ConfigKey::new("roles.regulars.min_messages");
pub const REGULARS_MIN_DAYS_JOINED: ConfigKey<u64> =
    ConfigKey::new("roles.regulars.min_days_joined");
pub const REGULARS_MIN_DAYS_ACTIVE: ConfigKey<u64> =
    ConfigKey::new("roles.regulars.min_days_active");
pub const REGULARS_AUTO_ASSIGN: ConfigKey<bool> = ConfigKey::new("roles.regulars.auto_assign");

pub const CHAT_ROLE_IDS: ConfigKey<Vec<Snowflake>> = ConfigKey::new("chat.role_ids");
pub const CHAT_PROMPTS: ConfigKey<Vec<String>> = ConfigKey::new("chat.prompts");

/// A platform id written either as a JSON number or a JSON string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Snowflake(pub u64);

impl Snowflake {
    pub fn channel(self) -> ChannelId {
        ChannelId::new(self.0)
    }

    pub fn role(self) -> RoleId {
        RoleId::new(self.0)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        let id = match Repr::deserialize(deserializer)? {
            Repr::Number(n) => n,
            Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom)?,
        };
        if id == 0 {
            return Err(serde::de::Error::custom("snowflake must be non-zero"));
        }
        Ok(Snowflake(id))
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config {key} is not set for guild {guild}")]
    Absent { key: &'static str, guild: String },
    #[error("config {key} for guild {guild} is malformed: {source}")]
    Decode {
        key: &'static str,
        guild: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("config {key} for guild {guild} could not be read: {message}")]
    Storage {
        key: &'static str,
        guild: String,
        message: String,
    },
}

/// Where configuration rows live.
pub trait ConfigSource: Send + Sync {
    /// Raw JSON for one key in one guild, `None` when no row exists.
    fn config_value(&self, key: &str, guild: &str) -> anyhow::Result<Option<String>>;

    /// `(guild, raw JSON)` for every guild that has the key.
    fn config_values(&self, key: &str) -> anyhow::Result<Vec<(String, String)>>;
}

#[derive(Debug, Clone)]
enum Raw {
    Present(String),
    Absent,
    Failed(String),
}

/// Result of a config lookup. Decoding happens on demand.
#[derive(Debug, Clone)]
pub struct ConfigValue<T> {
    key: &'static str,
    guild: String,
    raw: Raw,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ConfigValue<T> {
    fn new(key: &'static str, guild: String, raw: Raw) -> Self {
        Self {
            key,
            guild,
            raw,
            _marker: PhantomData,
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self.raw, Raw::Present(_))
    }

    pub fn value(&self) -> Result<T, ConfigError> {
        match &self.raw {
            Raw::Present(json) => {
                serde_json::from_str(json).map_err(|source| ConfigError::Decode {
                    key: self.key,
                    guild: self.guild.clone(),
                    source,
                })
            }
            Raw::Absent => Err(ConfigError::Absent {
                key: self.key,
                guild: self.guild.clone(),
            }),
            Raw::Failed(message) => Err(ConfigError::Storage {
                key: self.key,
                guild: self.guild.clone(),
                message: message.clone(),
            }),
        }
    }

    /// Decoded value, or `None` when the key is unset. Malformed values are logged.
    pub fn ok(&self) -> Option<T> {
        match self.value() {
            Ok(value) => Some(value),
            Err(ConfigError::Absent { .. }) => None,
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }
}

pub struct GuildConfigCache {
    source: Arc<dyn ConfigSource>,
    cache: ExpiringLru<String, Raw>,
}

impl GuildConfigCache {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            cache: ExpiringLru::new(CACHE_CAPACITY, CACHE_TTL),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>, guild: GuildId) -> ConfigValue<T> {
        let guild = guild.to_string();
        let cache_key = format!("{}:{}", key.name, guild);
        if let Some(raw) = self.cache.get(&cache_key) {
            return ConfigValue::new(key.name, guild, raw);
        }

        let raw = match self.source.config_value(key.name, &guild) {
            Ok(Some(json)) => Raw::Present(json),
            Ok(None) => Raw::Absent,
            Err(e) => {
                // Not cached, so the next lookup retries storage.
                error!("Failed to read config {} for guild {}: {:#}", key.name, guild, e);
                return ConfigValue::new(key.name, guild, Raw::Failed(e.to_string()));
            }
        };
        debug!("Config cache miss for {}", cache_key);
        self.cache.insert(cache_key, raw.clone());
        ConfigValue::new(key.name, guild, raw)
    }

    /// Every guild's value for `key`. Bypasses the cache.
    pub fn get_all<T: DeserializeOwned>(
        &self,
        key: &ConfigKey<T>,
    ) -> anyhow::Result<HashMap<GuildId, ConfigValue<T>>> {
        let rows = self.source.config_values(key.name)?;
        let mut values = HashMap::with_capacity(rows.len());
        for (guild, json) in rows {
            match guild.parse::<u64>().ok().filter(|id| *id != 0) {
                Some(id) => {
                    values.insert(
                        GuildId::new(id),
                        ConfigValue::new(key.name, guild, Raw::Present(json)),
                    );
                }
                None => warn!("Ignoring config {} for malformed guild id {:?}", key.name, guild),
            }
        }
        Ok(values)
    }

    pub fn clear(&self) {
        self.cache.purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingSource {
        rows: Mutex<HashMap<(String, String), String>>,
        reads: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CountingSource {
        fn set(&self, key: &str, guild: &str, json: &str) {
            self.rows
                .lock()
                .unwrap()
                .insert((key.to_string(), guild.to_string()), json.to_string());
        }
    }

    impl ConfigSource for CountingSource {
        fn config_value(&self, key: &str, guild: &str) -> anyhow::Result<Option<String>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&(key.to_string(), guild.to_string()))
                .cloned())
        }

        fn config_values(&self, key: &str) -> anyhow::Result<Vec<(String, String)>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|((k, _), _)| k == key)
                .map(|((_, g), v)| (g.clone(), v.clone()))
                .collect())
        }
    }

    fn guild() -> GuildId {
        GuildId::new(42)
    }

    #[test]
    fn test_cached_until_cleared() {
        let source = Arc::new(CountingSource::default());
        source.set("logs.channel_id", "42", "\"1234\"");
        let cache = GuildConfigCache::new(source.clone());

        let first = cache.get(&LOGS_CHANNEL_ID, guild());
        assert_eq!(first.value().unwrap(), Snowflake(1234));
        let _ = cache.get(&LOGS_CHANNEL_ID, guild());
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);

        cache.clear();
        let _ = cache.get(&LOGS_CHANNEL_ID, guild());
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_absent_is_cached() {
        let source = Arc::new(CountingSource::default());
        let cache = GuildConfigCache::new(source.clone());

        let value = cache.get(&REPORT_CHANNEL_ID, guild());
        assert!(!value.exists());
        assert!(matches!(value.value(), Err(ConfigError::Absent { .. })));
        assert!(value.ok().is_none());

        source.set("report.channel_id", "42", "5");
        assert!(!cache.get(&REPORT_CHANNEL_ID, guild()).exists());
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_storage_errors_not_cached() {
        let source = Arc::new(CountingSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let cache = GuildConfigCache::new(source.clone());

        let value = cache.get(&LOGS_CHANNEL_ID, guild());
        assert!(matches!(value.value(), Err(ConfigError::Storage { .. })));

        source.fail.store(false, Ordering::SeqCst);
        source.set("logs.channel_id", "42", "99");
        assert!(cache.get(&LOGS_CHANNEL_ID, guild()).exists());
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_decode_error() {
        let source = Arc::new(CountingSource::default());
        source.set("roles.temp.duration_minutes", "42", "\"soon\"");
        let cache = GuildConfigCache::new(source);

        let value = cache.get(&TEMP_ROLE_DURATION_MINUTES, guild());
        assert!(value.exists());
        assert!(matches!(value.value(), Err(ConfigError::Decode { .. })));
    }

    #[test]
    fn test_snowflake_forms() {
        let ids: Vec<Snowflake> = serde_json::from_str(r#"[1, "2", " 3 "]"#).unwrap();
        assert_eq!(ids, vec![Snowflake(1), Snowflake(2), Snowflake(3)]);
        assert!(serde_json::from_str::<Snowflake>("\"abc\"").is_err());
        assert!(serde_json::from_str::<Snowflake>("0").is_err());
    }

    #[test]
    fn test_get_all_skips_bad_guilds() {
        let source = Arc::new(CountingSource::default());
        source.set("bsky.post_notif.users", "1", r#"["a.bsky.social"]"#);
        source.set("bsky.post_notif.users", "nope", r#"["b.bsky.social"]"#);
        source.set("logs.channel_id", "1", "5");
        let cache = GuildConfigCache::new(source.clone());

        let all = cache.get_all(&BSKY_USERS).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[&GuildId::new(1)].value().unwrap(),
            vec!["a.bsky.social".to_string()]
        );
        // get_all never reads through the single-value path
        assert_eq!(source.reads.load(Ordering::SeqCst), 0);
    }
}
