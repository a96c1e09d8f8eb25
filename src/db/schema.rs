pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS config (
        config_key TEXT NOT NULL,
        guild_id TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (config_key, guild_id)
    );

    CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        timezone TEXT,
        bedtime_minutes INTEGER,
        last_bedtime_notified INTEGER,
        suppress_mentions BOOLEAN NOT NULL DEFAULT FALSE
    );

    CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        task_type INTEGER NOT NULL,
        process_after INTEGER NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_process_after ON scheduled_tasks (process_after);
    CREATE INDEX IF NOT EXISTS idx_tasks_guild_user ON scheduled_tasks (guild_id, user_id, task_type);

    CREATE TABLE IF NOT EXISTS quotes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        added_by TEXT NOT NULL,
        content TEXT NOT NULL,
        content_digest TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (guild_id, user_id, content_digest)
    );

    CREATE TABLE IF NOT EXISTS message_metrics (
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        message_count INTEGER NOT NULL,
        distinct_days INTEGER NOT NULL,
        last_distinct_day_boundary INTEGER NOT NULL,
        PRIMARY KEY (guild_id, user_id)
    );
";
