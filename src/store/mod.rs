//! Session persistence layer
//!
//! Append-only record of a session's messages and artifacts. Every write is
//! durable before it returns, which is what makes a session resumable.

pub mod sqlite;

pub use sqlite::SqliteSessionStore;

use crate::error::ResearchError;
use crate::models::{
    HistoryEntry, Message, MessageRole, NewArtifact, ResearchArtifact, Session, SessionStatus,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for session persistence
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, query: &str) -> Result<Session>;

    async fn get_session(&self, session_id: Uuid) -> Result<Session>;

    async fn append_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        self.append_message_with_metadata(session_id, role, content, None)
            .await
    }

    async fn append_message_with_metadata(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<Message>;

    async fn append_artifact(
        &self,
        session_id: Uuid,
        artifact: NewArtifact,
    ) -> Result<ResearchArtifact>;

    /// Messages and artifacts interleaved in write order.
    async fn load_history(&self, session_id: Uuid) -> Result<Vec<HistoryEntry>>;

    async fn update_status(&self, session_id: Uuid, status: SessionStatus) -> Result<()>;

    /// Newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Session>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Never earlier than the previous write of the same session.
pub(crate) fn monotonic_now(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now < previous {
        previous
    } else {
        now
    }
}

// =============================
// In-memory store
// =============================

struct SessionRecord {
    session: Session,
    entries: Vec<HistoryEntry>,
    next_seq: u64,
}

/// In-memory session store for tests and the `memory` database URL
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, SessionRecord>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, query: &str) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::now_v7(),
            query: query.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.id,
            SessionRecord {
                session: session.clone(),
                entries: Vec::new(),
                next_seq: 1,
            },
        );
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session_id)
            .map(|r| r.session.clone())
            .ok_or(ResearchError::SessionNotFound(session_id))
    }

    async fn append_message_with_metadata(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<Message> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(&session_id)
            .ok_or(ResearchError::SessionNotFound(session_id))?;

        let timestamp = monotonic_now(record.session.updated_at);
        let message = Message {
            id: Uuid::now_v7(),
            session_id,
            seq: record.next_seq,
            role,
            content: content.to_string(),
            metadata,
            timestamp,
        };

        record.next_seq += 1;
        record.session.updated_at = timestamp;
        record.entries.push(HistoryEntry::Message(message.clone()));
        Ok(message)
    }

    async fn append_artifact(
        &self,
        session_id: Uuid,
        artifact: NewArtifact,
    ) -> Result<ResearchArtifact> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(&session_id)
            .ok_or(ResearchError::SessionNotFound(session_id))?;

        let timestamp = monotonic_now(record.session.updated_at);
        let stored = ResearchArtifact {
            id: Uuid::now_v7(),
            session_id,
            seq: record.next_seq,
            capability: artifact.capability,
            args: artifact.args,
            digest: artifact.digest,
            payload: artifact.payload,
            source: artifact.source,
            cost_usd: artifact.cost_usd,
            from_cache: artifact.from_cache,
            timestamp,
        };

        record.next_seq += 1;
        record.session.updated_at = timestamp;
        record.entries.push(HistoryEntry::Artifact(stored.clone()));
        Ok(stored)
    }

    async fn load_history(&self, session_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session_id)
            .map(|r| r.entries.clone())
            .ok_or(ResearchError::SessionNotFound(session_id))
    }

    async fn update_status(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(&session_id)
            .ok_or(ResearchError::SessionNotFound(session_id))?;

        record.session.status = status;
        record.session.updated_at = monotonic_now(record.session.updated_at);
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Session> = sessions.values().map(|r| r.session.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.truncate(limit);
        Ok(all)
    }
}

// =============================
// Single-writer leases
// =============================

/// Process-wide registry of sessions that currently have a running loop.
#[derive(Clone, Default)]
pub struct SessionLeases {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl SessionLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, session_id: Uuid) -> Result<LeaseGuard> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(session_id) {
            return Err(ResearchError::SessionBusy(session_id));
        }
        Ok(LeaseGuard {
            session_id,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, session_id: Uuid) -> bool {
        let held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.contains(&session_id)
    }
}

/// Released on drop, so every exit path of a loop frees its session.
pub struct LeaseGuard {
    session_id: Uuid,
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl LeaseGuard {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.session_id);
    }
}
