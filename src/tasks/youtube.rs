//! New-upload announcements for YouTube playlists. The Data API quota is small, so each
//! guild's settings are validated before any playlist is queried.

use super::{Announcement, LastSeen, Observation, TaskContext};
use crate::guild_config::{YOUTUBE_CHANNEL_ID, YOUTUBE_PLAYLIST_IDS, YOUTUBE_TEMPLATE};
use crate::vars;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

const PLAYLIST_ITEMS_URL: &str = "https://www.googleapis.com/youtube/v3/playlistItems";
const WATCH_URL: &str = "https://www.youtube.com/watch?v=";
const PAGE_SIZE: &str = "5";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub snippet: Snippet,
    pub content_details: ContentDetails,
    pub status: Status,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub channel_title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDetails {
    pub video_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub privacy_status: String,
}

impl PlaylistItem {
    pub fn is_public(&self) -> bool {
        self.status.privacy_status == "public"
    }

    pub fn url(&self) -> String {
        format!("{}{}", WATCH_URL, self.content_details.video_id)
    }
}

#[derive(Deserialize)]
struct PlaylistPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

pub struct YouTubeFeed {
    http: reqwest::Client,
    api_key: String,
    last_published: LastSeen,
}

impl YouTubeFeed {
    pub fn new(http: reqwest::Client, api_key: String) -> Self {
        Self {
            http,
            api_key,
            last_published: LastSeen::new(Duration::zero()),
        }
    }

    async fn playlist_items(&self, playlist: &str) -> anyhow::Result<Vec<PlaylistItem>> {
        let page: PlaylistPage = self
            .http
            .get(PLAYLIST_ITEMS_URL)
            .query(&[
                ("part", "snippet,contentDetails,status"),
                ("playlistId", playlist),
                ("maxResults", PAGE_SIZE),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page.items)
    }

    /// Public videos published since the last check, oldest first. The first check of a
    /// playlist only remembers its latest video.
    pub fn new_videos(&self, playlist: &str, items: Vec<PlaylistItem>) -> Vec<PlaylistItem> {
        let mut public: Vec<PlaylistItem> = items.into_iter().filter(PlaylistItem::is_public).collect();
        let Some(latest) = public.iter().map(|item| item.snippet.published_at).max() else {
            warn!("YouTube returned no public videos for {}", playlist);
            return Vec::new();
        };
        match self.last_published.observe(playlist, latest) {
            Observation::First => {
                info!("First load of playlist {}, latest video published at {}", playlist, latest);
                Vec::new()
            }
            Observation::Unchanged => Vec::new(),
            Observation::Newer { since } => {
                public.retain(|item| item.snippet.published_at > since);
                public.sort_by_key(|item| item.snippet.published_at);
                public
            }
        }
    }
}

pub async fn run(ctx: TaskContext) -> anyhow::Result<()> {
    info!("Checking for new YouTube videos");
    let config = &ctx.data.guild_config;
    let playlists = config.get_all(&YOUTUBE_PLAYLIST_IDS)?;
    let channels = config.get_all(&YOUTUBE_CHANNEL_ID)?;
    let templates = config.get_all(&YOUTUBE_TEMPLATE)?;

    for (guild, playlist_ids) in playlists {
        let announcement = match Announcement::resolve(guild, &channels, &templates, &*ctx.bots) {
            Ok(announcement) => announcement,
            Err(e) => {
                error!(guild_id = %guild, "Skipping YouTube notifications: {:#}", e);
                continue;
            }
        };
        let playlist_ids = match playlist_ids.value() {
            Ok(ids) => ids,
            Err(e) => {
                error!(guild_id = %guild, "{}", e);
                continue;
            }
        };

        for playlist in playlist_ids {
            debug!(guild_id = %guild, "Checking playlist {}", playlist);
            let items = match ctx.youtube.playlist_items(&playlist).await {
                Ok(items) => items,
                Err(e) => {
                    error!(guild_id = %guild, "Failed to fetch playlist {}: {:#}", playlist, e);
                    continue;
                }
            };
            let videos = ctx.youtube.new_videos(&playlist, items);
            if !videos.is_empty() {
                info!(guild_id = %guild, "Found {} new videos in {}", videos.len(), playlist);
            }
            for video in videos {
                let vars = vars! { "url" => video.url(), "channel" => video.snippet.channel_title };
                if let Err(e) = announcement.post(&vars).await {
                    error!(guild_id = %guild, "Failed to send YouTube notification: {:#}", e);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, published: &str, privacy: &str) -> serde_json::Value {
        json!({
            "snippet": { "publishedAt": published, "channelTitle": "Sleepy Cat" },
            "contentDetails": { "videoId": id },
            "status": { "privacyStatus": privacy }
        })
    }

    fn page(items: Vec<serde_json::Value>) -> Vec<PlaylistItem> {
        serde_json::from_value::<PlaylistPage>(json!({ "items": items }))
            .unwrap()
            .items
    }

    #[test]
    fn test_new_videos_seed_then_announce() {
        let feed = YouTubeFeed::new(reqwest::Client::new(), "key".into());
        let first = page(vec![
            item("b", "2025-01-02T10:00:00Z", "public"),
            item("a", "2025-01-01T10:00:00Z", "public"),
        ]);
        assert!(feed.new_videos("PL1", first.clone()).is_empty());
        assert!(feed.new_videos("PL1", first).is_empty());

        let later = page(vec![
            item("d", "2025-01-04T10:00:00Z", "public"),
            item("secret", "2025-01-03T12:00:00Z", "private"),
            item("c", "2025-01-03T10:00:00Z", "public"),
            item("b", "2025-01-02T10:00:00Z", "public"),
        ]);
        let videos = feed.new_videos("PL1", later);
        let ids: Vec<_> = videos.iter().map(|v| v.content_details.video_id.as_str()).collect();
        assert_eq!(ids, ["c", "d"]);
        assert_eq!(videos[1].url(), "https://www.youtube.com/watch?v=d");
        assert_eq!(videos[1].snippet.channel_title, "Sleepy Cat");
    }

    #[test]
    fn test_private_only_playlist_is_ignored() {
        let feed = YouTubeFeed::new(reqwest::Client::new(), "key".into());
        let items = page(vec![item("x", "2025-01-01T10:00:00Z", "private")]);
        assert!(feed.new_videos("PL2", items).is_empty());
        // Still unseeded, so the first public video only seeds.
        let items = page(vec![item("y", "2025-01-02T10:00:00Z", "public")]);
        assert!(feed.new_videos("PL2", items).is_empty());
    }
}
