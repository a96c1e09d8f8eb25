//! New-post announcements for Bluesky accounts over the AT Protocol XRPC endpoints.

use super::{Announcement, LastSeen, Observation, TaskContext};
use crate::guild_config::{ConfigValue, BSKY_CHANNEL_ID, BSKY_TEMPLATE, BSKY_USERS};
use crate::vars;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serenity::all::GuildId;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, trace, warn};

const HOST: &str = "https://bsky.social";
const FEED_LIMIT: &str = "5";
/// Added to the watermark when it advances, against timestamp rounding.
const WATERMARK_MARGIN_SECS: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    refresh_jwt: String,
}

#[derive(Serialize)]
struct CreateSession<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedItem {
    pub post: Post,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Post {
    pub uri: String,
    pub author: Author,
    pub record: PostRecord,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Author {
    pub handle: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub created_at: String,
}

#[derive(Deserialize)]
struct AuthorFeed {
    #[serde(default)]
    feed: Vec<FeedItem>,
}

impl Post {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.record.created_at)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Web link, built from the record key at the end of the `at://` URI.
    pub fn url(&self) -> Option<String> {
        let rkey = self.uri.rsplit('/').next().filter(|key| !key.is_empty())?;
        Some(format!("https://bsky.app/profile/{}/post/{}", self.author.handle, rkey))
    }
}

pub struct BlueskyFeed {
    http: reqwest::Client,
    username: String,
    app_password: String,
    session: tokio::sync::Mutex<Option<Session>>,
    last_posts: LastSeen,
}

impl BlueskyFeed {
    pub fn new(http: reqwest::Client, username: String, app_password: String) -> Self {
        Self {
            http,
            username,
            app_password,
            session: tokio::sync::Mutex::new(None),
            last_posts: LastSeen::new(Duration::seconds(WATERMARK_MARGIN_SECS)),
        }
    }

    async fn create_session(&self) -> anyhow::Result<Session> {
        info!("Creating Bluesky session for {}", self.username);
        let session = self
            .http
            .post(format!("{}/xrpc/com.atproto.server.createSession", HOST))
            .json(&CreateSession {
                identifier: &self.username,
                password: &self.app_password,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(session)
    }

    async fn refresh(&self, refresh_jwt: &str) -> anyhow::Result<Session> {
        let session = self
            .http
            .post(format!("{}/xrpc/com.atproto.server.refreshSession", HOST))
            .bearer_auth(refresh_jwt)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(session)
    }

    /// Refreshes the session, logging in again when there is none or the refresh token
    /// has been rejected.
    pub async fn refresh_session(&self) -> anyhow::Result<()> {
        let mut session = self.session.lock().await;
        let fresh = match session.as_ref() {
            Some(current) => match self.refresh(&current.refresh_jwt).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    warn!("Bluesky session refresh failed, logging in again: {:#}", e);
                    self.create_session().await?
                }
            },
            None => self.create_session().await?,
        };
        *session = Some(fresh);
        Ok(())
    }

    async fn author_feed(&self, actor: &str) -> anyhow::Result<Vec<FeedItem>> {
        let token = match self.session.lock().await.as_ref() {
            Some(session) => session.access_jwt.clone(),
            None => anyhow::bail!("no Bluesky session"),
        };
        let page: AuthorFeed = self
            .http
            .get(format!("{}/xrpc/app.bsky.feed.getAuthorFeed", HOST))
            .query(&[("actor", actor), ("filter", "posts_no_replies"), ("limit", FEED_LIMIT)])
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page.feed)
    }

    /// Posts created since the last check, oldest first. The first check of a user only
    /// remembers their latest post.
    pub fn new_posts(&self, user: &str, feed: Vec<FeedItem>) -> Vec<Post> {
        let mut posts: Vec<(DateTime<Utc>, Post)> = feed
            .into_iter()
            .filter_map(|item| match item.post.created_at() {
                Some(at) => Some((at, item.post)),
                None => {
                    error!(user, "Failed to parse post creation time {:?}", item.post.record.created_at);
                    None
                }
            })
            .collect();
        let Some(latest) = posts.iter().map(|(at, _)| *at).max() else {
            warn!(user, "No posts found");
            return Vec::new();
        };
        match self.last_posts.observe(user, latest) {
            Observation::First => {
                info!(user, "Found initial Bluesky post created at {}", latest);
                Vec::new()
            }
            Observation::Unchanged => Vec::new(),
            Observation::Newer { since } => {
                debug!(user, "Found Bluesky posts newer than {}", since);
                posts.retain(|(at, _)| *at > since);
                posts.sort_by_key(|(at, _)| *at);
                posts.into_iter().map(|(_, post)| post).collect()
            }
        }
    }
}

/// Inverts guild -> watched users so every user is fetched once per run.
pub fn watchers_by_user(guild_users: &HashMap<GuildId, ConfigValue<Vec<String>>>) -> BTreeMap<String, Vec<GuildId>> {
    let mut watchers: BTreeMap<String, Vec<GuildId>> = BTreeMap::new();
    for (guild, users) in guild_users {
        match users.value() {
            Ok(users) => {
                for user in users {
                    watchers.entry(user).or_default().push(*guild);
                }
            }
            Err(e) => error!(guild_id = %guild, "{}", e),
        }
    }
    for guilds in watchers.values_mut() {
        guilds.sort();
    }
    watchers
}

pub async fn run(ctx: TaskContext) -> anyhow::Result<()> {
    ctx.bluesky.refresh_session().await?;
    let config = &ctx.data.guild_config;
    let watchers = watchers_by_user(&config.get_all(&BSKY_USERS)?);
    let channels = config.get_all(&BSKY_CHANNEL_ID)?;
    let templates = config.get_all(&BSKY_TEMPLATE)?;

    for (user, guilds) in watchers {
        let feed = match ctx.bluesky.author_feed(&user).await {
            Ok(feed) => feed,
            Err(e) => {
                error!(user = %user, "Failed to get latest posts: {:#}", e);
                continue;
            }
        };
        trace!(user = %user, "Got {} Bluesky posts", feed.len());

        for post in ctx.bluesky.new_posts(&user, feed) {
            let Some(url) = post.url() else {
                error!(user = %user, "Failed to parse post id from {}", post.uri);
                continue;
            };
            for guild in &guilds {
                let announcement = match Announcement::resolve(*guild, &channels, &templates, &*ctx.bots) {
                    Ok(announcement) => announcement,
                    Err(e) => {
                        error!(guild_id = %guild, user = %user, "Skipping Bluesky notification: {:#}", e);
                        continue;
                    }
                };
                match announcement.post(&vars! { "url" => url }).await {
                    Ok(()) => info!(guild_id = %guild, user = %user, "Sent Bluesky notification for {}", url),
                    Err(e) => error!(guild_id = %guild, user = %user, "Failed to send Bluesky notification: {:#}", e),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_data;
    use serde_json::json;

    fn feed(posts: &[(&str, &str)]) -> Vec<FeedItem> {
        let items: Vec<_> = posts
            .iter()
            .map(|(rkey, created)| {
                json!({
                    "post": {
                        "uri": format!("at://did:plc:abc/app.bsky.feed.post/{}", rkey),
                        "author": { "handle": "sleepy.bsky.social" },
                        "record": { "createdAt": created, "text": "hi" }
                    }
                })
            })
            .collect();
        serde_json::from_value::<AuthorFeed>(json!({ "feed": items }))
            .unwrap()
            .feed
    }

    #[test]
    fn test_new_posts_seed_then_announce() {
        let bsky = BlueskyFeed::new(reqwest::Client::new(), "u".into(), "p".into());
        assert!(bsky
            .new_posts("sleepy", feed(&[("p1", "2025-02-01T10:00:00.000Z")]))
            .is_empty());

        // Within the margin of the seed is still new: seeding adds no margin.
        let posts = bsky.new_posts(
            "sleepy",
            feed(&[
                ("p3", "2025-02-01T11:00:00.000Z"),
                ("broken", "yesterday"),
                ("p2", "2025-02-01T10:00:02.000Z"),
                ("p1", "2025-02-01T10:00:00.000Z"),
            ]),
        );
        let urls: Vec<_> = posts.iter().filter_map(Post::url).collect();
        assert_eq!(
            urls,
            [
                "https://bsky.app/profile/sleepy.bsky.social/post/p2",
                "https://bsky.app/profile/sleepy.bsky.social/post/p3",
            ]
        );

        // The watermark now sits 5 seconds past p3.
        assert!(bsky
            .new_posts("sleepy", feed(&[("p4", "2025-02-01T11:00:03.000Z")]))
            .is_empty());
    }

    #[test]
    fn test_watchers_by_user() {
        let data = test_data();
        data.db
            .set_config("bsky.post_notif.users", "1", r#"["a.bsky.social", "b.bsky.social"]"#)
            .unwrap();
        data.db
            .set_config("bsky.post_notif.users", "2", r#"["b.bsky.social"]"#)
            .unwrap();
        data.db.set_config("bsky.post_notif.users", "3", r#""c.bsky.social""#).unwrap();

        let watchers = watchers_by_user(&data.guild_config.get_all(&BSKY_USERS).unwrap());
        assert_eq!(watchers.len(), 2);
        assert_eq!(watchers["a.bsky.social"], [GuildId::new(1)]);
        assert_eq!(watchers["b.bsky.social"], [GuildId::new(1), GuildId::new(2)]);
    }
}
