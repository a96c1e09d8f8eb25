//! Minimal Twitch Helix client for live notifications.

use crate::cache::ExpiringLru;
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const HELIX_URL: &str = "https://api.twitch.tv/helix";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const CHANNEL_URL_PREFIX: &str = "https://www.twitch.tv/";

const STREAM_CACHE_TTL: Duration = Duration::from_secs(10);
const STREAM_ATTEMPTS: usize = 12;
const STREAM_RETRY_DELAY: Duration = Duration::from_secs(15);
const THUMBNAIL_ATTEMPTS: usize = 20;
const THUMBNAIL_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Stream {
    pub id: String,
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub title: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail_url: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Stream {
    pub fn channel_url(&self) -> String {
        format!("{}{}", CHANNEL_URL_PREFIX, self.user_login)
    }

    /// Full-size preview image.
    pub fn thumbnail(&self) -> String {
        self.thumbnail_url.replacen("{width}x{height}", "1024x576", 1)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TwitchUser {
    profile_image_url: String,
}

#[derive(Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct AppToken {
    access_token: String,
}

#[derive(Clone)]
struct CachedStream {
    stream: Stream,
    is_new: bool,
}

/// Login from a streaming activity URL, if it points at Twitch.
pub fn login_from_url(url: &str) -> Option<&str> {
    url.strip_prefix(CHANNEL_URL_PREFIX)
        .map(|login| login.trim_end_matches('/'))
        .filter(|login| !login.is_empty())
}

pub struct TwitchClient {
    http: reqwest::Client,
    no_redirect: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: tokio::sync::Mutex<Option<String>>,
    /// A go-live triggers a presence update in every guild the streamer shares with the bot.
    streams: ExpiringLru<String, CachedStream>,
    last_stream_ids: Mutex<HashMap<String, String>>,
}

impl TwitchClient {
    pub fn new(http: reqwest::Client, client_id: String, client_secret: String) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            no_redirect: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()?,
            client_id,
            client_secret,
            token: tokio::sync::Mutex::new(None),
            streams: ExpiringLru::new(128, STREAM_CACHE_TTL),
            last_stream_ids: Mutex::new(HashMap::new()),
        })
    }

    async fn refresh_token(&self) -> anyhow::Result<String> {
        info!("Requesting Twitch app access token");
        let token: AppToken = self
            .http
            .post(TOKEN_URL)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        *self.token.lock().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn helix<T: for<'de> Deserialize<'de>>(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<Vec<T>> {
        let cached = self.token.lock().await.clone();
        let token = match cached {
            Some(token) => token,
            None => self.refresh_token().await?,
        };

        let send = |token: String| {
            self.http
                .get(format!("{}/{}", HELIX_URL, path))
                .query(query)
                .header("Client-Id", &self.client_id)
                .bearer_auth(token)
                .send()
        };

        let mut response = send(token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            info!("Twitch returned 401, refreshing app access token");
            let token = self.refresh_token().await?;
            response = send(token).await?;
        }
        let page: HelixPage<T> = response.error_for_status()?.json().await?;
        Ok(page.data)
    }

    /// Live streams among `logins`. Marks them as known so a restart does not re-announce.
    pub async fn get_streams(&self, logins: &[String]) -> anyhow::Result<HashMap<String, Stream>> {
        let mut result = HashMap::new();
        for chunk in logins.chunks(100) {
            let query: Vec<(&str, &str)> = chunk.iter().map(|login| ("user_login", login.as_str())).collect();
            let streams: Vec<Stream> = self.helix("streams", &query).await?;
            let mut known = self.last_stream_ids.lock().unwrap();
            for stream in streams {
                known.insert(stream.user_login.clone(), stream.id.clone());
                self.streams.insert(
                    stream.user_login.clone(),
                    CachedStream {
                        stream: stream.clone(),
                        is_new: false,
                    },
                );
                result.insert(stream.user_login.clone(), stream);
            }
        }
        Ok(result)
    }

    /// Fetches a stream that just went live, retrying while the API catches up.
    /// Returns the stream and whether it has not been seen before.
    pub async fn attempt_get_stream(&self, login: &str, shutdown: &Shutdown) -> anyhow::Result<(Stream, bool)> {
        if let Some(cached) = self.streams.get(&login.to_string()) {
            debug!("Got stream for {} from cache", login);
            return Ok((cached.stream, cached.is_new));
        }

        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            let mut streams: Vec<Stream> = self.helix("streams", &[("user_login", login)]).await?;
            if !streams.is_empty() {
                break streams.swap_remove(0);
            }
            debug!("No stream found for {} (attempt {})", login, attempt);
            if attempt >= STREAM_ATTEMPTS || !shutdown.sleep(STREAM_RETRY_DELAY).await {
                anyhow::bail!("no stream found for {}", login);
            }
        };

        Ok(self.record(login, stream))
    }

    fn record(&self, login: &str, stream: Stream) -> (Stream, bool) {
        let mut known = self.last_stream_ids.lock().unwrap();
        // Another guild may have resolved the same go-live meanwhile.
        if let Some(cached) = self.streams.get(&login.to_string()) {
            return (cached.stream, cached.is_new);
        }
        let is_new = known.get(login) != Some(&stream.id);
        known.insert(login.to_string(), stream.id.clone());
        self.streams.insert(
            login.to_string(),
            CachedStream {
                stream: stream.clone(),
                is_new,
            },
        );
        (stream, is_new)
    }

    pub async fn profile_image_url(&self, login: &str) -> anyhow::Result<Option<String>> {
        let users: Vec<TwitchUser> = self.helix("users", &[("login", login)]).await?;
        Ok(users.into_iter().next().map(|user| user.profile_image_url))
    }

    /// Waits until Twitch serves the real preview image instead of redirecting to a placeholder.
    /// Returns `false` when it never appeared or shutdown started.
    pub async fn wait_for_thumbnail(&self, url: &str, shutdown: &Shutdown) -> bool {
        for attempt in 1..=THUMBNAIL_ATTEMPTS {
            match self.no_redirect.head(url).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => debug!("Thumbnail {} not ready ({}), attempt {}", url, response.status(), attempt),
                Err(e) => debug!("Thumbnail {} not ready ({}), attempt {}", url, e, attempt),
            }
            if attempt < THUMBNAIL_ATTEMPTS && !shutdown.sleep(THUMBNAIL_RETRY_DELAY).await {
                return false;
            }
        }
        false
    }
}
