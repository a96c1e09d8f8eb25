use crate::cache::ExpiringLru;
use crate::db::{Database, User};
use chrono::{DateTime, Utc};
use serenity::all::UserId;
use std::sync::Arc;
use std::time::Duration;

const USER_CACHE_CAPACITY: usize = 512;
const USER_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-user profile settings, cached because every message consults them.
#[derive(Clone)]
pub struct UserService {
    db: Database,
    cache: Arc<ExpiringLru<UserId, User>>,
}

impl UserService {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: Arc::new(ExpiringLru::new(USER_CACHE_CAPACITY, USER_CACHE_TTL)),
        }
    }

    /// Profile for `user_id`; users with no stored row get an empty profile.
    pub async fn get(&self, user_id: UserId) -> anyhow::Result<User> {
        if let Some(user) = self.cache.get(&user_id) {
            return Ok(user);
        }
        let key = user_id.to_string();
        let user = self
            .db
            .run_blocking(move |db| db.get_user(&key))
            .await?
            .unwrap_or_else(|| User {
                user_id: user_id.to_string(),
                ..Default::default()
            });
        self.cache.insert(user_id, user.clone());
        Ok(user)
    }

    pub async fn set_timezone(&self, user_id: UserId, timezone: String) -> anyhow::Result<()> {
        let key = user_id.to_string();
        self.db
            .run_blocking(move |db| db.set_timezone(&key, &timezone))
            .await?;
        self.cache.remove(&user_id);
        Ok(())
    }

    pub async fn set_bedtime(&self, user_id: UserId, minutes: Option<u32>) -> anyhow::Result<()> {
        let key = user_id.to_string();
        self.db
            .run_blocking(move |db| db.set_bedtime(&key, minutes))
            .await?;
        self.cache.remove(&user_id);
        Ok(())
    }

    pub async fn set_bedtime_notified(&self, user_id: UserId, at: DateTime<Utc>) -> anyhow::Result<()> {
        let key = user_id.to_string();
        self.db
            .run_blocking(move |db| db.set_bedtime_notified(&key, at))
            .await?;
        self.cache.remove(&user_id);
        Ok(())
    }

    pub async fn set_suppress_mentions(&self, user_id: UserId, suppress: bool) -> anyhow::Result<()> {
        let key = user_id.to_string();
        self.db
            .run_blocking(move |db| db.set_suppress_mentions(&key, suppress))
            .await?;
        self.cache.remove(&user_id);
        Ok(())
    }
}
