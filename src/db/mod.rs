pub mod models;
pub mod schema;

pub use models::*;

use crate::guild_config::ConfigSource;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const DAY_SECS: i64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(database_url: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(database_url)
            .with_context(|| format!("Failed to open database at {}", database_url))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let db = Self::new(":memory:")?;
        db.execute_init()?;
        Ok(db)
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Runs `f` on the blocking thread pool so async callers do not stall the runtime.
    pub async fn run_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("Database task panicked")?
    }

    // --- Config ---

    pub fn get_config(&self, key: &str, guild_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE config_key = ?1 AND guild_id = ?2",
                (key, guild_id),
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn get_config_all(&self, key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT guild_id, value FROM config WHERE config_key = ?1")?;
        let rows = stmt.query_map([key], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_config(&self, key: &str, guild_id: &str, json: &str) -> anyhow::Result<()> {
        serde_json::from_str::<serde_json::Value>(json)
            .with_context(|| format!("Config {} is not valid JSON", key))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config (config_key, guild_id, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(config_key, guild_id) DO UPDATE SET value = ?3",
            (key, guild_id, json),
        )?;
        Ok(())
    }

    // --- Users ---

    pub fn get_user(&self, user_id: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT user_id, timezone, bedtime_minutes, last_bedtime_notified, suppress_mentions
                 FROM users WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(User {
                        user_id: row.get(0)?,
                        timezone: row.get(1)?,
                        bedtime_minutes: row.get(2)?,
                        last_bedtime_notified: row.get::<_, Option<i64>>(3)?.map(from_unix),
                        suppress_mentions: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn set_timezone(&self, user_id: &str, timezone: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (user_id, timezone) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET timezone = ?2",
            (user_id, timezone),
        )?;
        Ok(())
    }

    pub fn set_bedtime(&self, user_id: &str, minutes: Option<u32>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (user_id, bedtime_minutes) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET bedtime_minutes = ?2",
            (user_id, minutes),
        )?;
        Ok(())
    }

    pub fn set_bedtime_notified(&self, user_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (user_id, last_bedtime_notified) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_bedtime_notified = ?2",
            (user_id, at.timestamp()),
        )?;
        Ok(())
    }

    pub fn set_suppress_mentions(&self, user_id: &str, suppress: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (user_id, suppress_mentions) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET suppress_mentions = ?2",
            (user_id, suppress),
        )?;
        Ok(())
    }

    // --- Scheduled tasks ---

    pub fn create_task(&self, task: &NewTask) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_tasks (guild_id, user_id, task_type, process_after, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                &task.guild_id,
                &task.user_id,
                task.task_type.as_i64(),
                task.process_after.timestamp(),
                &task.payload,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Removes and returns every task due at `now`. A row is handed out at most once.
    pub fn claim_due_tasks(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "DELETE FROM scheduled_tasks WHERE process_after <= ?1
             RETURNING id, guild_id, user_id, task_type, process_after, payload",
        )?;
        let rows = stmt.query_map([now.timestamp()], task_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Up to `limit` tasks of a type in a guild, soonest first, plus the total count.
    pub fn list_tasks(
        &self,
        guild_id: &str,
        task_type: TaskType,
        limit: usize,
    ) -> anyhow::Result<(Vec<ScheduledTask>, usize)> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM scheduled_tasks WHERE guild_id = ?1 AND task_type = ?2",
            (guild_id, task_type.as_i64()),
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, user_id, task_type, process_after, payload
             FROM scheduled_tasks WHERE guild_id = ?1 AND task_type = ?2
             ORDER BY process_after ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map((guild_id, task_type.as_i64(), limit as i64), task_from_row)?;
        Ok((rows.collect::<Result<Vec<_>, _>>()?, total as usize))
    }

    pub fn delete_task(&self, guild_id: &str, task_type: TaskType, id: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM scheduled_tasks WHERE id = ?1 AND guild_id = ?2 AND task_type = ?3",
            (id, guild_id, task_type.as_i64()),
        )?;
        Ok(deleted > 0)
    }

    pub fn delete_user_tasks(
        &self,
        guild_id: &str,
        user_id: &str,
        task_type: Option<TaskType>,
    ) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = match task_type {
            Some(kind) => conn.execute(
                "DELETE FROM scheduled_tasks WHERE guild_id = ?1 AND user_id = ?2 AND task_type = ?3",
                (guild_id, user_id, kind.as_i64()),
            )?,
            None => conn.execute(
                "DELETE FROM scheduled_tasks WHERE guild_id = ?1 AND user_id = ?2",
                (guild_id, user_id),
            )?,
        };
        Ok(deleted)
    }

    // --- Quotes ---

    pub fn add_quote(
        &self,
        guild_id: &str,
        user_id: &str,
        added_by: &str,
        content: &str,
    ) -> anyhow::Result<AddQuote> {
        let digest = quote_digest(content);
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO quotes (guild_id, user_id, added_by, content, content_digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (guild_id, user_id, added_by, content, &digest, Utc::now().timestamp()),
        );
        match result {
            Ok(_) => Ok(AddQuote::Added(conn.last_insert_rowid())),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(AddQuote::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_quote(&self, guild_id: &str, id: i64) -> anyhow::Result<Option<Quote>> {
        let conn = self.conn.lock().unwrap();
        let quote = conn
            .query_row(
                "SELECT id, guild_id, user_id, added_by, content FROM quotes
                 WHERE guild_id = ?1 AND id = ?2",
                (guild_id, id),
                quote_from_row,
            )
            .optional()?;
        Ok(quote)
    }

    pub fn random_quote(&self, guild_id: &str, user_id: &str) -> anyhow::Result<Option<Quote>> {
        let conn = self.conn.lock().unwrap();
        let quote = conn
            .query_row(
                "SELECT id, guild_id, user_id, added_by, content FROM quotes
                 WHERE guild_id = ?1 AND user_id = ?2 ORDER BY RANDOM() LIMIT 1",
                (guild_id, user_id),
                quote_from_row,
            )
            .optional()?;
        Ok(quote)
    }

    pub fn find_quotes(
        &self,
        guild_id: &str,
        text: Option<&str>,
        user_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<Quote>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, user_id, added_by, content FROM quotes
             WHERE guild_id = ?1
               AND (?2 IS NULL OR instr(content, ?2) > 0)
               AND (?3 IS NULL OR user_id = ?3)
             ORDER BY id DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map((guild_id, text, user_id, limit as i64), quote_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_quote(&self, guild_id: &str, id: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM quotes WHERE guild_id = ?1 AND id = ?2",
            (guild_id, id),
        )?;
        Ok(deleted > 0)
    }

    pub fn delete_user_quotes(&self, guild_id: &str, user_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "DELETE FROM quotes WHERE guild_id = ?1 AND user_id = ?2",
            (guild_id, user_id),
        )?)
    }

    // --- Message metrics ---

    /// Counts one message. A new active day is counted when the last one started over a day ago.
    pub fn record_message(&self, guild_id: &str, user_id: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO message_metrics
                 (guild_id, user_id, message_count, distinct_days, last_distinct_day_boundary)
             VALUES (?1, ?2, 1, 1, ?3)
             ON CONFLICT(guild_id, user_id) DO UPDATE SET
                 message_count = message_count + 1,
                 distinct_days = CASE WHEN last_distinct_day_boundary < ?3 - ?4
                     THEN distinct_days + 1 ELSE distinct_days END,
                 last_distinct_day_boundary = CASE WHEN last_distinct_day_boundary < ?3 - ?4
                     THEN ?3 ELSE last_distinct_day_boundary END",
            (guild_id, user_id, now.timestamp(), DAY_SECS),
        )?;
        Ok(())
    }

    pub fn get_metric(&self, guild_id: &str, user_id: &str) -> anyhow::Result<MessageMetric> {
        let conn = self.conn.lock().unwrap();
        let metric = conn
            .query_row(
                "SELECT message_count, distinct_days FROM message_metrics
                 WHERE guild_id = ?1 AND user_id = ?2",
                (guild_id, user_id),
                |row| {
                    Ok(MessageMetric {
                        message_count: row.get::<_, i64>(0)?.max(0) as u64,
                        distinct_days: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(metric.unwrap_or_default())
    }

    pub fn delete_metric(&self, guild_id: &str, user_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM message_metrics WHERE guild_id = ?1 AND user_id = ?2",
            (guild_id, user_id),
        )?;
        Ok(())
    }
}

impl ConfigSource for Database {
    fn config_value(&self, key: &str, guild: &str) -> anyhow::Result<Option<String>> {
        self.get_config(key, guild)
    }

    fn config_values(&self, key: &str) -> anyhow::Result<Vec<(String, String)>> {
        self.get_config_all(key)
    }
}

/// Hash of the alphanumeric characters of a quote, lowercased, so spacing and
/// punctuation variants collide.
pub fn quote_digest(content: &str) -> String {
    let normalized: String = content
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    Sha256::digest(normalized.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        guild_id: row.get(1)?,
        user_id: row.get(2)?,
        task_type: row.get(3)?,
        process_after: from_unix(row.get(4)?),
        payload: row.get(5)?,
    })
}

fn quote_from_row(row: &Row<'_>) -> rusqlite::Result<Quote> {
    Ok(Quote {
        id: row.get(0)?,
        guild_id: row.get(1)?,
        user_id: row.get(2)?,
        added_by: row.get(3)?,
        content: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    fn task(kind: TaskType, user: &str, at: DateTime<Utc>) -> NewTask {
        NewTask {
            guild_id: "1".to_string(),
            user_id: user.to_string(),
            task_type: kind,
            process_after: at,
            payload: "{}".to_string(),
        }
    }

    #[test]
    fn test_claim_due_tasks_once() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let due = db.create_task(&task(TaskType::Reminder, "u", now - Duration::minutes(1))).unwrap();
        let later = db.create_task(&task(TaskType::Reminder, "u", now + Duration::hours(1))).unwrap();

        let claimed = db.claim_due_tasks(now).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due);
        assert_eq!(claimed[0].kind(), Some(TaskType::Reminder));
        assert!(db.claim_due_tasks(now).unwrap().is_empty());

        let (remaining, total) = db.list_tasks("1", TaskType::Reminder, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(remaining[0].id, later);
    }

    #[test]
    fn test_concurrent_claims_never_share_rows() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..50 {
            db.create_task(&task(TaskType::Reminder, &i.to_string(), now - Duration::seconds(i)))
                .unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.claim_due_tasks(now).unwrap())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for claimed in handle.join().unwrap() {
                assert!(seen.insert(claimed.id), "task {} claimed twice", claimed.id);
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn test_user_updates_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_user("9").unwrap().is_none());

        db.set_timezone("9", "Europe/Paris").unwrap();
        db.set_bedtime("9", Some(23 * 60 + 30)).unwrap();
        db.set_suppress_mentions("9", true).unwrap();

        let user = db.get_user("9").unwrap().unwrap();
        assert_eq!(user.timezone.as_deref(), Some("Europe/Paris"));
        assert_eq!(user.bedtime().unwrap().to_string(), "23:30:00");
        assert!(user.suppress_mentions);

        db.set_bedtime("9", None).unwrap();
        assert!(db.get_user("9").unwrap().unwrap().bedtime().is_none());
    }

    #[test]
    fn test_quote_dedupe_and_find() {
        let db = Database::open_in_memory().unwrap();
        let first = db.add_quote("1", "2", "3", "Hello, World!").unwrap();
        let AddQuote::Added(id) = first else {
            panic!("expected insert");
        };
        assert_eq!(db.add_quote("1", "2", "3", "hello world").unwrap(), AddQuote::Duplicate);
        // Same text for a different user is a different quote
        assert!(matches!(db.add_quote("1", "4", "3", "hello world").unwrap(), AddQuote::Added(_)));

        // Text search is case-sensitive
        let found = db.find_quotes("1", Some("World"), None, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "Hello, World!");
        let found = db.find_quotes("1", Some("world"), None, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_id, "4");
        assert_eq!(db.find_quotes("1", None, Some("4"), 10).unwrap().len(), 1);
        assert_eq!(db.find_quotes("1", None, None, 10).unwrap().len(), 2);
        assert_eq!(db.random_quote("1", "2").unwrap().unwrap().id, id);

        assert!(db.delete_quote("1", id).unwrap());
        assert!(!db.delete_quote("1", id).unwrap());
        assert!(db.get_quote("1", id).unwrap().is_none());
    }

    #[test]
    fn test_message_metrics_distinct_days() {
        let db = Database::open_in_memory().unwrap();
        let start = Utc::now();
        db.record_message("1", "2", start).unwrap();
        db.record_message("1", "2", start + Duration::hours(3)).unwrap();
        assert_eq!(
            db.get_metric("1", "2").unwrap(),
            MessageMetric { message_count: 2, distinct_days: 1 }
        );

        db.record_message("1", "2", start + Duration::hours(25)).unwrap();
        db.record_message("1", "2", start + Duration::hours(26)).unwrap();
        assert_eq!(
            db.get_metric("1", "2").unwrap(),
            MessageMetric { message_count: 4, distinct_days: 2 }
        );

        db.delete_metric("1", "2").unwrap();
        assert_eq!(db.get_metric("1", "2").unwrap(), MessageMetric::default());
    }

    #[test]
    fn test_config_rows() {
        let db = Database::open_in_memory().unwrap();
        db.set_config("logs.channel_id", "1", "\"55\"").unwrap();
        db.set_config("logs.channel_id", "2", "66").unwrap();
        assert!(db.set_config("logs.channel_id", "3", "not json").is_err());

        assert_eq!(db.get_config("logs.channel_id", "1").unwrap().as_deref(), Some("\"55\""));
        assert!(db.get_config("logs.channel_id", "3").unwrap().is_none());
        assert_eq!(db.get_config_all("logs.channel_id").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .run_blocking(|db| db.create_task(&task(TaskType::Birthday, "5", Utc::now())))
            .await
            .unwrap();
        assert!(id > 0);
    }
}
