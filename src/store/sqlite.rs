//! Durable SQLite session store
//!
//! WAL journal with `synchronous = FULL`: a committed append survives a crash.
//! Each append runs in one transaction that reserves the session's next
//! sequence number and clamps the timestamp to the previous write.

use super::SessionStore;
use crate::error::ResearchError;
use crate::models::{
    HistoryEntry, Message, MessageRole, NewArtifact, ResearchArtifact, Session, SessionStatus,
};
use crate::Result;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteSessionStore {
    pool: SqlitePool,
    /// SQLite allows one writer; serializing here avoids SQLITE_BUSY churn.
    write_lock: Mutex<()>,
}

impl SqliteSessionStore {
    /// Opens (creating if needed) the database at `url`, e.g. `sqlite://research.db`.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ResearchError::Config(format!("invalid database url '{}': {}", url, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ResearchError::persistence("Failed to open session database", e))?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.init_tables().await?;

        info!(url = %url, "session store ready");
        Ok(store)
    }

    async fn init_tables(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS research_sessions (
                id TEXT PRIMARY KEY,
                query TEXT NOT NULL,
                status TEXT NOT NULL,
                next_seq INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS research_messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                timestamp TEXT NOT NULL,
                UNIQUE (session_id, seq),
                FOREIGN KEY (session_id) REFERENCES research_sessions(id)
            )",
            "CREATE TABLE IF NOT EXISTS research_artifacts (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                capability TEXT NOT NULL,
                args TEXT NOT NULL,
                digest TEXT NOT NULL,
                data_payload TEXT NOT NULL,
                source TEXT NOT NULL,
                cost_usd REAL NOT NULL DEFAULT 0,
                from_cache INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                UNIQUE (session_id, seq),
                FOREIGN KEY (session_id) REFERENCES research_sessions(id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_research_sessions_created
                ON research_sessions(created_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| ResearchError::persistence("Failed to create schema", e))?;
        }
        Ok(())
    }

    /// Reserves the next sequence number and a clamped timestamp inside `tx`.
    async fn reserve_slot(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: Uuid,
    ) -> Result<(u64, DateTime<Utc>)> {
        let row = sqlx::query("SELECT next_seq, updated_at FROM research_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| ResearchError::persistence("Failed to read session", e))?
            .ok_or(ResearchError::SessionNotFound(session_id))?;

        let seq: i64 = column(&row, "next_seq")?;
        let previous = parse_time(&column::<String>(&row, "updated_at")?)?;
        let timestamp = clamp(previous);

        sqlx::query("UPDATE research_sessions SET next_seq = ?, updated_at = ? WHERE id = ?")
            .bind(seq + 1)
            .bind(format_time(timestamp))
            .bind(session_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| ResearchError::persistence("Failed to advance session sequence", e))?;

        Ok((seq as u64, timestamp))
    }
}

#[async_trait::async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, query: &str) -> Result<Session> {
        let now = Utc::now().trunc_subsecs(6);
        let session = Session {
            id: Uuid::now_v7(),
            query: query.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO research_sessions (id, query, status, next_seq, created_at, updated_at)
             VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(&session.query)
        .bind(session.status.as_str())
        .bind(format_time(now))
        .bind(format_time(now))
        .execute(&self.pool)
        .await
        .map_err(|e| ResearchError::persistence("Failed to create session", e))?;

        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Session> {
        let row = sqlx::query(
            "SELECT id, query, status, created_at, updated_at FROM research_sessions WHERE id = ?",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ResearchError::persistence("Failed to load session", e))?
        .ok_or(ResearchError::SessionNotFound(session_id))?;

        session_from_row(&row)
    }

    async fn append_message_with_metadata(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<Message> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ResearchError::persistence("Failed to start transaction", e))?;

        let (seq, timestamp) = Self::reserve_slot(&mut tx, session_id).await?;
        let message = Message {
            id: Uuid::now_v7(),
            session_id,
            seq,
            role,
            content: content.to_string(),
            metadata,
            timestamp,
        };

        let metadata_text = match &message.metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO research_messages (id, session_id, seq, role, content, metadata, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(session_id.to_string())
        .bind(seq as i64)
        .bind(role.as_str())
        .bind(&message.content)
        .bind(metadata_text)
        .bind(format_time(timestamp))
        .execute(&mut *tx)
        .await
        .map_err(|e| ResearchError::persistence("Failed to append message", e))?;

        tx.commit()
            .await
            .map_err(|e| ResearchError::persistence("Failed to commit message", e))?;

        Ok(message)
    }

    async fn append_artifact(
        &self,
        session_id: Uuid,
        artifact: NewArtifact,
    ) -> Result<ResearchArtifact> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ResearchError::persistence("Failed to start transaction", e))?;

        let (seq, timestamp) = Self::reserve_slot(&mut tx, session_id).await?;
        let stored = ResearchArtifact {
            id: Uuid::now_v7(),
            session_id,
            seq,
            capability: artifact.capability,
            args: artifact.args,
            digest: artifact.digest,
            payload: artifact.payload,
            source: artifact.source,
            cost_usd: artifact.cost_usd,
            from_cache: artifact.from_cache,
            timestamp,
        };

        sqlx::query(
            "INSERT INTO research_artifacts
                (id, session_id, seq, capability, args, digest, data_payload, source,
                 cost_usd, from_cache, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(stored.id.to_string())
        .bind(session_id.to_string())
        .bind(seq as i64)
        .bind(stored.capability.as_str())
        .bind(serde_json::to_string(&stored.args)?)
        .bind(&stored.digest)
        .bind(serde_json::to_string(&stored.payload)?)
        .bind(&stored.source)
        .bind(stored.cost_usd)
        .bind(stored.from_cache)
        .bind(format_time(timestamp))
        .execute(&mut *tx)
        .await
        .map_err(|e| ResearchError::persistence("Failed to append artifact", e))?;

        tx.commit()
            .await
            .map_err(|e| ResearchError::persistence("Failed to commit artifact", e))?;

        Ok(stored)
    }

    async fn load_history(&self, session_id: Uuid) -> Result<Vec<HistoryEntry>> {
        // Surfaces NotFound for unknown ids instead of an empty history.
        self.get_session(session_id).await?;
        let id = session_id.to_string();

        let message_rows = sqlx::query(
            "SELECT id, seq, role, content, metadata, timestamp
             FROM research_messages WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ResearchError::persistence("Failed to load messages", e))?;

        let artifact_rows = sqlx::query(
            "SELECT id, seq, capability, args, digest, data_payload, source, cost_usd,
                    from_cache, timestamp
             FROM research_artifacts WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ResearchError::persistence("Failed to load artifacts", e))?;

        let mut history = Vec::with_capacity(message_rows.len() + artifact_rows.len());
        for row in &message_rows {
            history.push(HistoryEntry::Message(message_from_row(session_id, row)?));
        }
        for row in &artifact_rows {
            history.push(HistoryEntry::Artifact(artifact_from_row(session_id, row)?));
        }
        history.sort_by_key(HistoryEntry::seq);

        Ok(history)
    }

    async fn update_status(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ResearchError::persistence("Failed to start transaction", e))?;

        let row = sqlx::query("SELECT updated_at FROM research_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ResearchError::persistence("Failed to read session", e))?
            .ok_or(ResearchError::SessionNotFound(session_id))?;
        let updated_at = clamp(parse_time(&column::<String>(&row, "updated_at")?)?);

        sqlx::query("UPDATE research_sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(format_time(updated_at))
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| ResearchError::persistence("Failed to update session status", e))?;

        tx.commit()
            .await
            .map_err(|e| ResearchError::persistence("Failed to commit status", e))?;

        debug!(session_id = %session_id, status = %status, "session status updated");
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT id, query, status, created_at, updated_at FROM research_sessions
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ResearchError::persistence("Failed to list sessions", e))?;

        rows.iter().map(session_from_row).collect()
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

// =============================
// Row mapping
// =============================

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| ResearchError::persistence(&format!("Failed to read column '{}'", name), e))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ResearchError::persistence("Invalid stored id", e))
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ResearchError::persistence("Invalid stored timestamp", e))
}

/// Stored precision is microseconds, so the clamp works at that precision too.
fn clamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    if now < previous {
        previous
    } else {
        now
    }
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| ResearchError::persistence(&format!("Corrupt stored {}", what), e))
}

fn session_from_row(row: &SqliteRow) -> Result<Session> {
    Ok(Session {
        id: parse_uuid(&column::<String>(row, "id")?)?,
        query: column(row, "query")?,
        status: column::<String>(row, "status")?.parse()?,
        created_at: parse_time(&column::<String>(row, "created_at")?)?,
        updated_at: parse_time(&column::<String>(row, "updated_at")?)?,
    })
}

fn message_from_row(session_id: Uuid, row: &SqliteRow) -> Result<Message> {
    let metadata = match column::<Option<String>>(row, "metadata")? {
        Some(raw) => Some(parse_json(&raw, "message metadata")?),
        None => None,
    };

    Ok(Message {
        id: parse_uuid(&column::<String>(row, "id")?)?,
        session_id,
        seq: column::<i64>(row, "seq")? as u64,
        role: column::<String>(row, "role")?.parse()?,
        content: column(row, "content")?,
        metadata,
        timestamp: parse_time(&column::<String>(row, "timestamp")?)?,
    })
}

fn artifact_from_row(session_id: Uuid, row: &SqliteRow) -> Result<ResearchArtifact> {
    let capability = column::<String>(row, "capability")?
        .parse()
        .map_err(ResearchError::Persistence)?;

    Ok(ResearchArtifact {
        id: parse_uuid(&column::<String>(row, "id")?)?,
        session_id,
        seq: column::<i64>(row, "seq")? as u64,
        capability,
        args: parse_json(&column::<String>(row, "args")?, "artifact args")?,
        digest: column(row, "digest")?,
        payload: parse_json(&column::<String>(row, "data_payload")?, "artifact payload")?,
        source: column(row, "source")?,
        cost_usd: column(row, "cost_usd")?,
        from_cache: column(row, "from_cache")?,
        timestamp: parse_time(&column::<String>(row, "timestamp")?)?,
    })
}
