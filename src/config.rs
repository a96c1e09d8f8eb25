use dotenvy::dotenv;
use std::env;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Process-level settings. Tenant settings live in the database, see `guild_config`.
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: Option<String>,
    pub bsky_username: String,
    pub bsky_app_password: String,
    pub youtube_api_key: String,
    pub twitch_client_id: String,
    pub twitch_client_secret: String,
    pub log_level: String,
    pub log_json: bool,
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{} must be set", name))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            database_url: required("DATABASE_URL")?,
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_model: env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_MODEL.to_string()),
            openai_base_url: env::var("OPENAI_BASE_URL").ok().filter(|url| !url.is_empty()),
            bsky_username: required("BSKY_USERNAME")?,
            bsky_app_password: required("BSKY_APP_PASSWORD")?,
            youtube_api_key: required("YOUTUBE_API_KEY")?,
            twitch_client_id: required("TWITCH_CLIENT_ID")?,
            twitch_client_secret: required("TWITCH_CLIENT_SECRET")?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT")
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("openai_api_key", &"[REDACTED]")
            .field("openai_model", &self.openai_model)
            .field("openai_base_url", &self.openai_base_url)
            .field("bsky_username", &self.bsky_username)
            .field("bsky_app_password", &"[REDACTED]")
            .field("youtube_api_key", &"[REDACTED]")
            .field("twitch_client_id", &self.twitch_client_id)
            .field("twitch_client_secret", &"[REDACTED]")
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const REQUIRED: [(&str, &str); 7] = [
        ("DATABASE_URL", ":memory:"),
        ("OPENAI_API_KEY", "sk-secret"),
        ("BSKY_USERNAME", "snoozy.bsky.social"),
        ("BSKY_APP_PASSWORD", "bsky-secret"),
        ("YOUTUBE_API_KEY", "yt-secret"),
        ("TWITCH_CLIENT_ID", "twitch-id"),
        ("TWITCH_CLIENT_SECRET", "twitch-secret"),
    ];

    #[test]
    fn test_config_logic() {
        // 1. Every required secret is fatal when missing
        for (name, _) in REQUIRED {
            env::remove_var(name);
        }
        assert!(Config::build().is_err(), "Should fail when required vars are missing");

        for (name, value) in &REQUIRED[..6] {
            env::set_var(name, value);
        }
        let err = Config::build().unwrap_err();
        assert!(err.to_string().contains("TWITCH_CLIENT_SECRET"));

        // 2. Defaults
        env::set_var(REQUIRED[6].0, REQUIRED[6].1);
        env::remove_var("OPENAI_MODEL");
        env::remove_var("LOG_FORMAT");
        let config = Config::build().unwrap();
        assert_eq!(config.openai_model, DEFAULT_OPENAI_MODEL);
        assert_eq!(config.database_url, ":memory:");
        assert!(!config.log_json);

        // 3. Debug redaction
        let debug_output = format!("{:?}", config);
        for secret in ["sk-secret", "bsky-secret", "yt-secret", "twitch-secret"] {
            assert!(!debug_output.contains(secret));
        }
        assert!(debug_output.contains("[REDACTED]"));

        for (name, _) in REQUIRED {
            env::remove_var(name);
        }
    }
}
