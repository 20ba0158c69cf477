use crate::models::{Candidate, Election, ElectionResult, ElectionStatus};
use crate::voting::{validate_ranking, BallotError};
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// How long a writer waits for another connection's write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("candidate already added")]
    DuplicateCandidate,
    #[error(transparent)]
    InvalidBallot(#[from] BallotError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("could not allocate a free active id after {0} attempts")]
    ActiveIdExhausted(usize),
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = if db_url.contains(":memory:") {
            // Every connection to an in-memory database is its own database,
            // so pin the pool to a single connection that never gets recycled.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect(db_url)
                .await?
        } else {
            if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
                info!("Creating database at {}", db_url);
                Sqlite::create_database(db_url).await?;
            }
            // WAL lets the tabulation snapshot read while ballots are written.
            let options = SqliteConnectOptions::from_str(db_url)?
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(BUSY_TIMEOUT);
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?
        };

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS elections (
                id TEXT PRIMARY KEY,
                active_id TEXT NOT NULL,
                status TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                result TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        // A finished election gives its code back.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS elections_open_active_id
            ON elections (active_id)
            WHERE completed_at IS NULL;
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                election_id TEXT NOT NULL,
                business_id TEXT NOT NULL,
                nominator_id TEXT,
                distance REAL,
                PRIMARY KEY (election_id, business_id),
                FOREIGN KEY (election_id) REFERENCES elections(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rankings (
                voter_id TEXT NOT NULL,
                election_id TEXT NOT NULL,
                business_id TEXT NOT NULL,
                rank INTEGER NOT NULL,
                PRIMARY KEY (voter_id, election_id, business_id),
                UNIQUE (voter_id, election_id, rank),
                FOREIGN KEY (election_id, business_id)
                    REFERENCES candidates(election_id, business_id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Inserts a new election. A taken active id surfaces as `Ok(false)` so the
    /// caller can retry with a fresh code.
    pub async fn create_election(&self, election: &Election) -> Result<bool, StoreError> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO elections (id, active_id, status, creator_id, created_at, completed_at, result)
            VALUES (?, ?, ?, ?, ?, NULL, NULL)
            "#,
        )
        .bind(&election.id)
        .bind(&election.active_id)
        .bind(election.status.as_str())
        .bind(&election.creator_id)
        .bind(election.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_election(&self, election_id: &str) -> Result<Election, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, active_id, status, creator_id, created_at, completed_at, result
            FROM elections
            WHERE id = ?
            "#,
        )
        .bind(election_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Election with id {}", election_id)))?;

        election_from_row(&row)
    }

    /// Looks up the not-yet-completed election holding `active_id`.
    pub async fn get_open_election(&self, active_id: &str) -> Result<Election, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, active_id, status, creator_id, created_at, completed_at, result
            FROM elections
            WHERE active_id = ? AND completed_at IS NULL
            "#,
        )
        .bind(active_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Election with active id {}", active_id)))?;

        election_from_row(&row)
    }

    pub async fn get_election_status(&self, election_id: &str) -> Result<ElectionStatus, StoreError> {
        let status: String = sqlx::query_scalar("SELECT status FROM elections WHERE id = ?")
            .bind(election_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Election with id {}", election_id)))?;

        status.parse().map_err(StoreError::Corrupt)
    }

    /// Moves an election from `from` to `to` only if it is still in `from`.
    /// Returns whether a row changed.
    pub async fn update_election_status(
        &self,
        election_id: &str,
        from: ElectionStatus,
        to: ElectionStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE elections
            SET status = ?, completed_at = COALESCE(?, completed_at)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(completed_at.map(|dt| dt.to_rfc3339()))
        .bind(election_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    pub async fn add_candidate(&self, candidate: &Candidate) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO candidates (election_id, business_id, nominator_id, distance)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&candidate.election_id)
        .bind(&candidate.business_id)
        .bind(&candidate.nominator_id)
        .bind(candidate.distance)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateCandidate),
            Err(e) => Err(e.into()),
        }
    }

    /// Candidates in nomination order.
    pub async fn get_candidates(&self, election_id: &str) -> Result<Vec<Candidate>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_candidates(&mut conn, election_id).await
    }

    pub async fn count_candidates(&self, election_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM candidates WHERE election_id = ?")
            .bind(election_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Replaces the voter's whole ranking in one transaction. The ranking is checked
    /// against the candidate set read inside the same transaction.
    pub async fn replace_ballot(
        &self,
        voter_id: &str,
        election_id: &str,
        ranking: &[String],
    ) -> Result<(), StoreError> {
        // Take the write lock up front: a deferred transaction that reads first
        // cannot be upgraded once another connection has committed.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let candidates: Vec<String> = fetch_candidates(&mut tx, election_id)
            .await?
            .into_iter()
            .map(|c| c.business_id)
            .collect();
        validate_ranking(&candidates, ranking)?;

        sqlx::query("DELETE FROM rankings WHERE voter_id = ? AND election_id = ?")
            .bind(voter_id)
            .bind(election_id)
            .execute(&mut *tx)
            .await?;

        for (rank, business_id) in ranking.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO rankings (voter_id, election_id, business_id, rank)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(voter_id)
            .bind(election_id)
            .bind(business_id)
            .bind(rank as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Stored ballot of {} for election {}", voter_id, election_id);
        Ok(())
    }

    /// Every voter's ranking, most preferred first.
    pub async fn get_all_ballots(
        &self,
        election_id: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_ballots(&mut conn, election_id).await
    }

    /// Candidate ids and ballots read from one snapshot, so a concurrent
    /// `replace_ballot` is seen either entirely or not at all.
    pub async fn get_tabulation_input(
        &self,
        election_id: &str,
    ) -> Result<(Vec<String>, Vec<Vec<String>>), StoreError> {
        let mut tx = self.pool.begin().await?;
        let candidates = fetch_candidates(&mut tx, election_id)
            .await?
            .into_iter()
            .map(|c| c.business_id)
            .collect();
        let ballots = fetch_ballots(&mut tx, election_id).await?.into_values().collect();
        tx.commit().await?;
        Ok((candidates, ballots))
    }

    pub async fn store_result(
        &self,
        election_id: &str,
        result: &ElectionResult,
    ) -> Result<(), StoreError> {
        let blob = serde_json::to_string(result).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let updated = sqlx::query("UPDATE elections SET result = ? WHERE id = ?")
            .bind(blob)
            .bind(election_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(StoreError::NotFound(format!("Election with id {}", election_id)));
        }
        Ok(())
    }

    pub async fn get_result(&self, election_id: &str) -> Result<Option<ElectionResult>, StoreError> {
        let blob: Option<Option<String>> = sqlx::query_scalar("SELECT result FROM elections WHERE id = ?")
            .bind(election_id)
            .fetch_optional(&self.pool)
            .await?;

        match blob {
            None => Err(StoreError::NotFound(format!("Election with id {}", election_id))),
            Some(None) => Ok(None),
            Some(Some(text)) => parse_result(&text).map(Some),
        }
    }
}

async fn fetch_candidates(
    conn: &mut SqliteConnection,
    election_id: &str,
) -> Result<Vec<Candidate>, StoreError> {
    let candidates = sqlx::query(
        r#"
        SELECT election_id, business_id, nominator_id, distance
        FROM candidates
        WHERE election_id = ?
        ORDER BY rowid
        "#,
    )
    .bind(election_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|row| {
        Ok(Candidate {
            election_id: row.try_get("election_id")?,
            business_id: row.try_get("business_id")?,
            nominator_id: row.try_get("nominator_id")?,
            distance: row.try_get("distance")?,
        })
    })
    .collect::<Result<Vec<_>, sqlx::Error>>()?;

    Ok(candidates)
}

async fn fetch_ballots(
    conn: &mut SqliteConnection,
    election_id: &str,
) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT voter_id, business_id
        FROM rankings
        WHERE election_id = ?
        ORDER BY voter_id, rank
        "#,
    )
    .bind(election_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut ballots: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        let voter_id: String = row.try_get("voter_id")?;
        let business_id: String = row.try_get("business_id")?;
        ballots.entry(voter_id).or_default().push(business_id);
    }
    Ok(ballots)
}

fn election_from_row(row: &SqliteRow) -> Result<Election, StoreError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let result: Option<String> = row.try_get("result")?;

    Ok(Election {
        id: row.try_get("id")?,
        active_id: row.try_get("active_id")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        creator_id: row.try_get("creator_id")?,
        created_at: parse_timestamp(&created_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        result: result.as_deref().map(parse_result).transpose()?,
    })
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("Failed to parse timestamp {}: {}", text, e)))
}

fn parse_result(text: &str) -> Result<ElectionResult, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt(format!("Failed to parse result: {}", e)))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.is_unique_violation())
}
