use crate::guild_config::{GuildConfigCache, COOLDOWN_EXEMPT_CHANNELS};
use serenity::all::{ChannelId, GuildId, Permissions, UserId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// Who is invoking a rate-limited action.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user: UserId,
    pub moderator: bool,
}

impl Actor {
    pub fn new(user: UserId, permissions: Option<Permissions>) -> Self {
        Self {
            user,
            moderator: permissions.is_some_and(|p| p.contains(Permissions::MANAGE_MESSAGES)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    expires: Instant,
}

/// Fixed-window limiter with one bucket per channel and one per user within a channel.
///
/// Buckets are reset lazily when touched after their window ends and are never removed.
pub struct CooldownManager {
    user_invocations: u32,
    channel_invocations: u32,
    window: Duration,
    channel_buckets: Mutex<HashMap<String, Bucket>>,
    user_buckets: Mutex<HashMap<String, Bucket>>,
}

impl CooldownManager {
    pub fn new(user_invocations: u32, channel_invocations: u32, window: Duration) -> Self {
        Self {
            user_invocations,
            channel_invocations,
            window,
            channel_buckets: Mutex::new(HashMap::new()),
            user_buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `actor` may act in `channel` right now. Consumes capacity when allowed.
    pub fn can(
        &self,
        config: &GuildConfigCache,
        guild: GuildId,
        channel: ChannelId,
        actor: Actor,
    ) -> bool {
        if actor.moderator {
            trace!("Cooldown bypassed for moderator {}", actor.user);
            return true;
        }
        let exempt = config
            .get(&COOLDOWN_EXEMPT_CHANNELS, guild)
            .ok()
            .unwrap_or_default();
        if exempt.iter().any(|id| id.channel() == channel) {
            trace!("Cooldown bypassed in exempt channel {}", channel);
            return true;
        }
        self.check_at(channel, actor.user, Instant::now())
    }

    /// Bucket check without exemptions.
    pub fn check_at(&self, channel: ChannelId, user: UserId, now: Instant) -> bool {
        let channel_key = channel.to_string();
        if !Self::take(
            &self.channel_buckets,
            channel_key.clone(),
            self.channel_invocations,
            self.window,
            now,
        ) {
            return false;
        }
        Self::take(
            &self.user_buckets,
            format!("{}:{}", channel_key, user),
            self.user_invocations,
            self.window,
            now,
        )
    }

    fn take(
        buckets: &Mutex<HashMap<String, Bucket>>,
        key: String,
        max: u32,
        window: Duration,
        now: Instant,
    ) -> bool {
        let mut buckets = buckets.lock().unwrap();
        let bucket = buckets.entry(key).or_insert(Bucket {
            count: 0,
            expires: now,
        });
        if bucket.expires > now {
            if bucket.count >= max {
                return false;
            }
            bucket.count += 1;
        } else {
            *bucket = Bucket {
                count: 1,
                expires: now + window,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guild_config::ConfigSource;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(300);

    struct StaticSource(Option<String>);

    impl ConfigSource for StaticSource {
        fn config_value(&self, _key: &str, _guild: &str) -> anyhow::Result<Option<String>> {
            Ok(self.0.clone())
        }

        fn config_values(&self, _key: &str) -> anyhow::Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
    }

    fn ids() -> (ChannelId, UserId, UserId) {
        (ChannelId::new(10), UserId::new(1), UserId::new(2))
    }

    #[test]
    fn test_user_limit_then_reset() {
        let cdm = CooldownManager::new(3, 5, WINDOW);
        let (channel, alice, _) = ids();
        let start = Instant::now();

        for _ in 0..3 {
            assert!(cdm.check_at(channel, alice, start));
        }
        assert!(!cdm.check_at(channel, alice, start + Duration::from_secs(10)));
        // Window elapsed: bucket resets and the call is allowed again.
        assert!(cdm.check_at(channel, alice, start + WINDOW));
    }

    #[test]
    fn test_channel_limit_shared_across_users() {
        let cdm = CooldownManager::new(3, 5, WINDOW);
        let (channel, alice, bob) = ids();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(cdm.check_at(channel, alice, now));
        }
        assert!(cdm.check_at(channel, bob, now));
        assert!(cdm.check_at(channel, bob, now));
        // Channel bucket is now full at 5.
        assert!(!cdm.check_at(channel, bob, now));
        assert!(cdm.check_at(ChannelId::new(11), bob, now));
    }

    #[test]
    fn test_moderators_and_exempt_channels_bypass() {
        let (channel, alice, _) = ids();
        let config = GuildConfigCache::new(Arc::new(StaticSource(None)));
        let cdm = CooldownManager::new(1, 1, WINDOW);
        let guild = GuildId::new(7);

        let moderator = Actor::new(alice, Some(Permissions::MANAGE_MESSAGES));
        for _ in 0..5 {
            assert!(cdm.can(&config, guild, channel, moderator));
        }

        let member = Actor::new(alice, Some(Permissions::SEND_MESSAGES));
        assert!(cdm.can(&config, guild, channel, member));
        assert!(!cdm.can(&config, guild, channel, member));

        let exempt = GuildConfigCache::new(Arc::new(StaticSource(Some("[\"10\"]".into()))));
        for _ in 0..5 {
            assert!(cdm.can(&exempt, guild, channel, member));
        }
    }
}
