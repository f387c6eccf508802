use super::{Change, CounterStore, StoreError, Subscription, TABLE_NAME};
use crate::models::{VoteKey, VoteRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Connection, Row, Sqlite, migrate::MigrateDatabase};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{MissedTickBehavior, interval};

const CHANGE_FEED_CAPACITY: usize = 64;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// SQLite-backed counter store. Writes made through this store are announced
/// to its subscribers directly; writes from other processes sharing the file
/// are picked up by polling `PRAGMA data_version`.
pub struct SqliteCounterStore {
    pool: SqlitePool,
    changes: broadcast::Sender<Change>,
    db_url: String,
    in_memory: bool,
    poll_interval: Duration,
}

impl SqliteCounterStore {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");

        // Create database if it doesn't exist
        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        // Every connection to an in-memory database sees its own database,
        // and closing the last one drops it
        let mut options = SqlitePoolOptions::new().max_connections(max_connections.max(1));
        if in_memory {
            options = options.max_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(db_url).await?;

        Self::init_schema(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            pool,
            changes,
            db_url: db_url.to_string(),
            in_memory,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
                village_number INTEGER NOT NULL,
                ballot_type TEXT NOT NULL,
                candidate_number INTEGER NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (village_number, ballot_type, candidate_number)
            );
            "#
        ))
        .execute(pool)
        .await?;

        Ok(())
    }

    fn notify(&self, change: Change) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }
}

async fn data_version(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("PRAGMA data_version").fetch_one(conn).await
}

// data_version only moves for commits made on other connections, so the
// watcher keeps one connection of its own for the life of the subscription
async fn watch_changes(
    mut conn: SqliteConnection,
    mut seen: i64,
    mut local: broadcast::Receiver<Change>,
    tx: broadcast::Sender<Change>,
    poll_interval: Duration,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let change = tokio::select! {
            received = local.recv() => match received {
                Ok(change) => change,
                Err(RecvError::Lagged(_)) => Change::Unknown,
                Err(RecvError::Closed) => return,
            },
            _ = ticker.tick() => match data_version(&mut conn).await {
                Ok(version) if version != seen => {
                    seen = version;
                    Change::Unknown
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Failed to poll the results file for outside changes: {}", e);
                    continue;
                }
            },
        };

        if tx.send(change).is_err() {
            // Subscriber went away
            return;
        }
    }
}

fn row_from_sqlite(row: &SqliteRow) -> Result<VoteRow, StoreError> {
    let updated_at_str = row.get::<String, _>("updated_at");
    let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
        .map_err(|e| StoreError::InvalidRow(format!("Failed to parse updated_at: {}", e)))?
        .with_timezone(&Utc);

    Ok(VoteRow {
        village_number: row.get::<i32, _>("village_number"),
        ballot_type: row.get::<String, _>("ballot_type"),
        candidate_number: row.get::<i32, _>("candidate_number"),
        votes: row.get::<i64, _>("votes"),
        updated_at,
    })
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn scan_all(&self) -> Result<Vec<VoteRow>, StoreError> {
        sqlx::query(&format!(
            r#"
            SELECT village_number, ballot_type, candidate_number, votes, updated_at
            FROM {TABLE_NAME}
            ORDER BY village_number, ballot_type, candidate_number
            "#
        ))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(row_from_sqlite)
        .collect()
    }

    async fn read_one(&self, key: &VoteKey) -> Result<Option<VoteRow>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT village_number, ballot_type, candidate_number, votes, updated_at
            FROM {TABLE_NAME}
            WHERE village_number = ? AND ballot_type = ? AND candidate_number = ?
            "#
        ))
        .bind(key.village_number)
        .bind(key.ballot_type.as_str())
        .bind(key.candidate_number)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_from_sqlite).transpose()
    }

    async fn upsert(&self, row: &VoteRow) -> Result<VoteRow, StoreError> {
        let committed = sqlx::query(&format!(
            r#"
            INSERT INTO {TABLE_NAME} (village_number, ballot_type, candidate_number, votes, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(village_number, ballot_type, candidate_number)
            DO UPDATE SET votes = excluded.votes, updated_at = excluded.updated_at
            RETURNING village_number, ballot_type, candidate_number, votes, updated_at
            "#
        ))
        .bind(row.village_number)
        .bind(&row.ballot_type)
        .bind(row.candidate_number)
        .bind(row.votes)
        .bind(row.updated_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        let committed = row_from_sqlite(&committed)?;
        self.notify(committed.key().map(Change::Row).unwrap_or(Change::Unknown));
        Ok(committed)
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let local = self.changes.subscribe();
        // Nothing outside this pool can reach an in-memory database
        if self.in_memory {
            return Ok(Subscription::new(local));
        }

        let mut conn = SqliteConnection::connect(&self.db_url)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;
        let seen = data_version(&mut conn)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;

        let (tx, rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let watcher = tokio::spawn(watch_changes(conn, seen, local, tx, self.poll_interval));
        Ok(Subscription::with_listener(rx, watcher))
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("UPDATE {TABLE_NAME} SET votes = 0, updated_at = ?"))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        self.notify(Change::Reset);
        Ok(())
    }
}
