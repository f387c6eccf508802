use super::{Change, CounterStore, StoreError, Subscription};
use crate::models::{VoteKey, VoteRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;

pub const CHANGE_CHANNEL: &str = "election_results_changes";

const CHANGE_FEED_CAPACITY: usize = 64;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(2);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS election_results (
    id BIGSERIAL PRIMARY KEY,
    village_number INTEGER NOT NULL,
    ballot_type TEXT NOT NULL,
    candidate_number INTEGER NOT NULL,
    votes BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (village_number, ballot_type, candidate_number)
);

CREATE OR REPLACE FUNCTION notify_election_results_change() RETURNS trigger AS $$
DECLARE
    changed election_results;
BEGIN
    IF TG_OP = 'DELETE' THEN
        changed := OLD;
    ELSE
        changed := NEW;
    END IF;
    PERFORM pg_notify('election_results_changes', json_build_object(
        'op', TG_OP,
        'village_number', changed.village_number,
        'ballot_type', changed.ballot_type,
        'candidate_number', changed.candidate_number
    )::text);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS election_results_notify ON election_results;
CREATE TRIGGER election_results_notify
    AFTER INSERT OR UPDATE OR DELETE ON election_results
    FOR EACH ROW EXECUTE FUNCTION notify_election_results_change();

CREATE OR REPLACE FUNCTION reset_all_votes() RETURNS void AS $$
    UPDATE election_results SET votes = 0, updated_at = now();
$$ LANGUAGE sql;
"#;

/// Postgres-backed counter store. Changes from every client arrive through
/// LISTEN/NOTIFY on [`CHANGE_CHANNEL`].
pub struct PgCounterStore {
    pool: PgPool,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    village_number: i32,
    ballot_type: String,
    candidate_number: i32,
}

impl PgCounterStore {
    /// Builds the pool without touching the network; connections are made on first use.
    pub fn connect_lazy(url: &str, key: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(url)?.password(key);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy_with(options);
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Counter store schema is in place");
        Ok(())
    }
}

fn row_from_pg(row: &PgRow) -> VoteRow {
    VoteRow {
        village_number: row.get::<i32, _>("village_number"),
        ballot_type: row.get::<String, _>("ballot_type"),
        candidate_number: row.get::<i32, _>("candidate_number"),
        votes: row.get::<i64, _>("votes"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    }
}

fn parse_change(payload: &str) -> Change {
    let Ok(parsed) = serde_json::from_str::<ChangePayload>(payload) else {
        debug!("Unparsable change payload: {}", payload);
        return Change::Unknown;
    };
    let raw_key = format!("{}-{}-{}", parsed.village_number, parsed.ballot_type, parsed.candidate_number);
    raw_key.parse::<VoteKey>().map(Change::Row).unwrap_or(Change::Unknown)
}

// `None` means the connection dropped; whatever was sent in the gap is gone
fn change_for(payload: Option<&str>) -> Change {
    payload.map(parse_change).unwrap_or(Change::Unknown)
}

async fn forward_changes(mut listener: PgListener, tx: broadcast::Sender<Change>) {
    loop {
        let change = match listener.try_recv().await {
            Ok(Some(notification)) => change_for(Some(notification.payload())),
            Ok(None) => {
                // The listener reconnects on the next try_recv
                warn!("Change listener lost its connection; reconnecting");
                change_for(None)
            }
            Err(e) => {
                warn!("Change listener could not reconnect (retrying in {:?}): {}", LISTENER_RETRY_DELAY, e);
                if tx.send(Change::Unknown).is_err() {
                    return;
                }
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                continue;
            }
        };

        if tx.send(change).is_err() {
            // Subscriber went away
            return;
        }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn scan_all(&self) -> Result<Vec<VoteRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT village_number, ballot_type, candidate_number, votes, updated_at
            FROM election_results
            ORDER BY village_number, ballot_type, candidate_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_from_pg).collect())
    }

    async fn read_one(&self, key: &VoteKey) -> Result<Option<VoteRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT village_number, ballot_type, candidate_number, votes, updated_at
            FROM election_results
            WHERE village_number = $1 AND ballot_type = $2 AND candidate_number = $3
            "#,
        )
        .bind(key.village_number)
        .bind(key.ballot_type.as_str())
        .bind(key.candidate_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_from_pg))
    }

    async fn upsert(&self, row: &VoteRow) -> Result<VoteRow, StoreError> {
        let committed = sqlx::query(
            r#"
            INSERT INTO election_results (village_number, ballot_type, candidate_number, votes, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (village_number, ballot_type, candidate_number)
            DO UPDATE SET votes = excluded.votes, updated_at = excluded.updated_at
            RETURNING village_number, ballot_type, candidate_number, votes, updated_at
            "#,
        )
        .bind(row.village_number)
        .bind(&row.ballot_type)
        .bind(row.candidate_number)
        .bind(row.votes)
        .bind(row.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_from_pg(&committed))
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| StoreError::Subscription(format!("LISTEN {}: {}", CHANGE_CHANNEL, e)))?;

        let (tx, rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let forwarder = tokio::spawn(forward_changes(listener, tx));
        Ok(Subscription::with_listener(rx, forwarder))
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT reset_all_votes()").execute(&self.pool).await?;
        Ok(())
    }
}
