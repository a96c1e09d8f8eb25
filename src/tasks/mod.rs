//! Periodic jobs run by the [`TaskSupervisor`](crate::supervisor::TaskSupervisor).

pub mod bluesky;
pub mod scheduled;
pub mod youtube;

use crate::guild_config::{ConfigValue, Snowflake};
use crate::i18n::{render_template, Vars};
use crate::messenger::{BotDirectory, Messenger};
use crate::supervisor::PeriodicTask;
use crate::Data;
use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use poise::BoxFuture;
use serenity::all::{ChannelId, CreateMessage, GuildId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Everything a periodic run needs. Cheap to clone, one copy per task loop.
#[derive(Clone)]
pub struct TaskContext {
    pub data: Arc<Data>,
    pub bots: Arc<dyn BotDirectory>,
    pub youtube: Arc<youtube::YouTubeFeed>,
    pub bluesky: Arc<bluesky::BlueskyFeed>,
}

impl TaskContext {
    pub fn new(data: Arc<Data>, bots: Arc<dyn BotDirectory>) -> Self {
        let youtube = youtube::YouTubeFeed::new(data.http_client.clone(), data.config.youtube_api_key.clone());
        let bluesky = bluesky::BlueskyFeed::new(
            data.http_client.clone(),
            data.config.bsky_username.clone(),
            data.config.bsky_app_password.clone(),
        );
        Self {
            data,
            bots,
            youtube: Arc::new(youtube),
            bluesky: Arc::new(bluesky),
        }
    }
}

pub fn periodic_tasks() -> Vec<PeriodicTask<TaskContext>> {
    vec![
        PeriodicTask {
            name: "scheduled_tasks",
            interval: std::time::Duration::from_secs(60),
            handler: |ctx| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(scheduled::run(ctx)) },
        },
        PeriodicTask {
            name: "youtube_notifications",
            interval: std::time::Duration::from_secs(15 * 60),
            handler: |ctx| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(youtube::run(ctx)) },
        },
        PeriodicTask {
            name: "bluesky_notifications",
            interval: std::time::Duration::from_secs(60),
            handler: |ctx| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(bluesky::run(ctx)) },
        },
    ]
}

/// Where and how a guild wants feed notifications posted.
pub struct Announcement {
    pub channel: ChannelId,
    pub template: String,
    pub bot: Arc<dyn Messenger>,
}

impl Announcement {
    pub fn resolve(
        guild: GuildId,
        channels: &HashMap<GuildId, ConfigValue<Snowflake>>,
        templates: &HashMap<GuildId, ConfigValue<String>>,
        bots: &dyn BotDirectory,
    ) -> anyhow::Result<Self> {
        let channel = channels
            .get(&guild)
            .context("no notification channel configured")?
            .value()?
            .channel();
        let template = templates
            .get(&guild)
            .context("no notification template configured")?
            .value()?;
        let bot = bots.messenger(guild).context("no bot serves this guild")?;
        Ok(Self { channel, template, bot })
    }

    pub async fn post(&self, vars: &Vars) -> anyhow::Result<()> {
        let content = render_template(&self.template, vars);
        self.bot
            .send(self.channel, CreateMessage::new().content(content))
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Nothing known yet. The latest item only seeds the watermark.
    First,
    Unchanged,
    /// Items published after `since` are new.
    Newer { since: DateTime<Utc> },
}

/// Per-source publish watermark for the feed pollers. Lives for the process only, so a
/// restart seeds again instead of re-announcing.
pub struct LastSeen {
    margin: Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LastSeen {
    /// `margin` is added to the watermark whenever it advances.
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, source: &str, latest: DateTime<Utc>) -> Observation {
        let mut seen = self.seen.lock().unwrap();
        match seen.get(source).copied() {
            None => {
                seen.insert(source.to_string(), latest);
                Observation::First
            }
            Some(known) if latest > known => {
                seen.insert(source.to_string(), latest + self.margin);
                Observation::Newer { since: known }
            }
            Some(_) => Observation::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_last_seen_seeds_then_advances() {
        let seen = LastSeen::new(Duration::seconds(5));
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        assert_eq!(seen.observe("a", t0), Observation::First);
        assert_eq!(seen.observe("a", t0), Observation::Unchanged);
        assert_eq!(seen.observe("b", t0), Observation::First);

        let t1 = t0 + Duration::minutes(1);
        assert_eq!(seen.observe("a", t1), Observation::Newer { since: t0 });
        // Inside the margin after advancing.
        assert_eq!(seen.observe("a", t1 + Duration::seconds(3)), Observation::Unchanged);
        assert_eq!(
            seen.observe("a", t1 + Duration::seconds(6)),
            Observation::Newer {
                since: t1 + Duration::seconds(5)
            }
        );
    }

    #[test]
    fn test_periodic_tasks_are_named() {
        let names: Vec<_> = periodic_tasks().iter().map(|task| task.name).collect();
        assert_eq!(names, ["scheduled_tasks", "youtube_notifications", "bluesky_notifications"]);
    }
}
