use crate::error::ChatResult;
use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

pub type DbPool = Pool<SqliteConnectionManager>;

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))
}

/// Initialize a single SQLite connection and run migrations.
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Open a pooled database file and run migrations on it.
pub fn open_pool<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path.as_ref())
        .with_init(|c| configure(c));
    let pool = Pool::new(manager)?;
    {
        let conn = pool.get()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
    }
    Ok(pool)
}

/// Run blocking database work on the blocking thread pool.
pub async fn run<T, F>(pool: &DbPool, f: F) -> ChatResult<T>
where
    F: FnOnce(&Connection) -> ChatResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await?
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY,
  username TEXT UNIQUE NOT NULL,
  name TEXT NOT NULL,
  avatar_url TEXT
);

CREATE TABLE IF NOT EXISTS files (
  id TEXT PRIMARY KEY,
  mime TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT UNIQUE NOT NULL,
  sender_id INTEGER NOT NULL REFERENCES users(id),
  receiver_id INTEGER NOT NULL REFERENCES users(id),
  content TEXT,
  audio_url TEXT,
  audio_duration INTEGER,
  audio_file_id TEXT REFERENCES files(id),
  read_at INTEGER,
  created_at INTEGER NOT NULL,
  CHECK (sender_id <> receiver_id),
  CHECK (
    (content IS NOT NULL AND audio_url IS NULL AND audio_duration IS NULL)
    OR (content IS NULL AND audio_url IS NOT NULL AND audio_duration >= 0)
  )
);

CREATE INDEX IF NOT EXISTS messages_pair ON messages(sender_id, receiver_id, created_at);
CREATE INDEX IF NOT EXISTS messages_unread ON messages(receiver_id, read_at);
CREATE INDEX IF NOT EXISTS messages_audio_file ON messages(audio_file_id);
"#;
