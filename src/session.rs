//! Sessions: the short-term half of the memory fabric.
//!
//! A [`Session`] is an append-only message log plus a mutable scratchpad,
//! scoped to one conversation. The [`SessionTable`] owns every live session
//! and hands out cheap [`SessionHandle`] clones.
//!
//! # Ordering
//! Each session carries a serialization lock: two `process` calls for the
//! same session run strictly in arrival order (the lock queue is FIFO).
//! Message timestamps are strictly monotonic within a session — an append
//! landing in the same millisecond as its predecessor is bumped forward.
//!
//! # Lifetime
//! Messages are never deleted while a session is active. Closing a session
//! compacts its log to the configured keep-count and removes it from the
//! table; a summary line records how many messages were dropped.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Reserved agent id for messages originating from the user.
pub const USER_AGENT_ID: &str = "user";

// ─── Message ──────────────────────────────────────────────────────────────────

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// What a message payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Code,
    Diff,
    ToolCall,
    ToolResult,
    SystemEvent,
}

/// A single turn in a session's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub session_id: String,
    /// Originating agent, or [`USER_AGENT_ID`].
    pub agent_id: String,
    pub role: MessageRole,
    pub kind: MessageKind,
    pub content: String,
    /// Epoch milliseconds; strictly monotonic within a session.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    /// Set when the producing dispatch was cancelled mid-flight.
    #[serde(default)]
    pub cancelled: bool,
}

// ─── Session ──────────────────────────────────────────────────────────────────

/// A conversation session: append-only log + scratchpad.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub owner: String,
    /// Agent currently attached to the session, if any.
    pub agent_id: Option<String>,
    pub messages: Vec<Message>,
    pub scratchpad: HashMap<String, serde_json::Value>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    /// Summary of messages dropped by close-time compaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_summary: Option<String>,
}

impl Session {
    fn new(owner: &str, agent_id: Option<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            session_id: Uuid::new_v4().to_string(),
            owner: owner.to_owned(),
            agent_id,
            messages: Vec::new(),
            scratchpad: HashMap::new(),
            created_at_ms: now,
            updated_at_ms: now,
            compaction_summary: None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ─── SessionHandle ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionSlot {
    /// FIFO serialization lock; held for the duration of a `process` call.
    serial: Mutex<()>,
    inner: RwLock<Session>,
}

/// Shared handle to a live session. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct SessionHandle(Arc<SessionSlot>);

impl SessionHandle {
    fn new(session: Session) -> Self {
        Self(Arc::new(SessionSlot {
            serial: Mutex::new(()),
            inner: RwLock::new(session),
        }))
    }

    /// Acquire the per-session serialization lock. Callers queue FIFO.
    pub async fn acquire_serial(&self) -> MutexGuard<'_, ()> {
        self.0.serial.lock().await
    }

    pub fn session_id(&self) -> String {
        self.read(|s| s.session_id.clone()).unwrap_or_default()
    }

    /// Append a message; returns the stored copy.
    ///
    /// The timestamp is bumped past the previous message's when two appends
    /// land in the same millisecond, keeping the log strictly monotonic.
    pub fn append(
        &self,
        agent_id: &str,
        role: MessageRole,
        kind: MessageKind,
        content: impl Into<String>,
        parent_message_id: Option<String>,
    ) -> CoreResult<Message> {
        let mut session = self.write()?;
        let now = Utc::now().timestamp_millis();
        let timestamp_ms = match session.messages.last() {
            Some(prev) if prev.timestamp_ms >= now => prev.timestamp_ms + 1,
            _ => now,
        };
        let message = Message {
            message_id: Uuid::new_v4().to_string(),
            session_id: session.session_id.clone(),
            agent_id: agent_id.to_owned(),
            role,
            kind,
            content: content.into(),
            timestamp_ms,
            parent_message_id,
            cancelled: false,
        };
        session.messages.push(message.clone());
        session.updated_at_ms = timestamp_ms;
        Ok(message)
    }

    /// Flag the most recent message as produced by a cancelled dispatch.
    pub fn mark_tail_cancelled(&self) -> CoreResult<()> {
        let mut session = self.write()?;
        if let Some(last) = session.messages.last_mut() {
            last.cancelled = true;
        }
        Ok(())
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> CoreResult<Vec<Message>> {
        let session = self.read_guard()?;
        let skip = session.messages.len().saturating_sub(n);
        Ok(session.messages[skip..].to_vec())
    }

    /// Clone the full session state.
    pub fn snapshot(&self) -> CoreResult<Session> {
        Ok(self.read_guard()?.clone())
    }

    pub fn scratch_set(&self, key: &str, value: serde_json::Value) -> CoreResult<()> {
        self.write()?.scratchpad.insert(key.to_owned(), value);
        Ok(())
    }

    pub fn scratch_get(&self, key: &str) -> CoreResult<Option<serde_json::Value>> {
        Ok(self.read_guard()?.scratchpad.get(key).cloned())
    }

    pub fn set_attached_agent(&self, agent_id: Option<String>) -> CoreResult<()> {
        self.write()?.agent_id = agent_id;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Session) -> T) -> CoreResult<T> {
        let guard = self.read_guard()?;
        Ok(f(&guard))
    }

    fn read_guard(&self) -> CoreResult<std::sync::RwLockReadGuard<'_, Session>> {
        self.0
            .inner
            .read()
            .map_err(|_| CoreError::InternalInvariant("session lock poisoned".into()))
    }

    fn write(&self) -> CoreResult<std::sync::RwLockWriteGuard<'_, Session>> {
        self.0
            .inner
            .write()
            .map_err(|_| CoreError::InternalInvariant("session lock poisoned".into()))
    }
}

// ─── SessionTable ─────────────────────────────────────────────────────────────

/// Owner of every live session.
pub struct SessionTable {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session and return its id.
    pub fn create(&self, owner: &str, initial_agent_id: Option<String>) -> CoreResult<String> {
        let session = Session::new(owner, initial_agent_id);
        let id = session.session_id.clone();
        self.map_write()?.insert(id.clone(), SessionHandle::new(session));
        log::debug!("[session] created session_id={id} owner={owner}");
        Ok(id)
    }

    /// Look up a live session.
    pub fn get(&self, session_id: &str) -> CoreResult<SessionHandle> {
        self.map_read()?
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("unknown session '{session_id}'")))
    }

    /// Close a session: wait for in-flight work, compact the log, remove it
    /// from the table, and return the final state.
    pub async fn close(&self, session_id: &str, keep_messages: usize) -> CoreResult<Session> {
        let handle = self.get(session_id)?;
        let _serial = handle.acquire_serial().await;

        {
            let mut session = handle.write()?;
            if session.messages.len() > keep_messages {
                let dropped = session.messages.len() - keep_messages;
                session.messages.drain(0..dropped);
                session.compaction_summary =
                    Some(format!("{dropped} earlier messages dropped at close"));
            }
        }

        self.map_write()?.remove(session_id);
        log::debug!("[session] closed session_id={session_id}");
        handle.snapshot()
    }

    pub fn len(&self) -> usize {
        self.map_read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map_read(&self) -> CoreResult<std::sync::RwLockReadGuard<'_, HashMap<String, SessionHandle>>> {
        self.sessions
            .read()
            .map_err(|_| CoreError::InternalInvariant("session table lock poisoned".into()))
    }

    fn map_write(
        &self,
    ) -> CoreResult<std::sync::RwLockWriteGuard<'_, HashMap<String, SessionHandle>>> {
        self.sessions
            .write()
            .map_err(|_| CoreError::InternalInvariant("session table lock poisoned".into()))
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
