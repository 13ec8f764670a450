//! Tutoring sessions and the store that owns them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::SessionError;

/// Where a channel is in the quiz → explain-it-back flow.
///
/// Progresses linearly: McqPending → FeynmanPending → (session deleted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Quiz posted, waiting for multiple-choice answers.
    McqPending,
    /// Challenge posted, waiting for the user's explanation.
    FeynmanPending { challenge: String },
}

impl Phase {
    pub fn is_mcq(&self) -> bool {
        matches!(self, Self::McqPending)
    }

    pub fn is_feynman(&self) -> bool {
        matches!(self, Self::FeynmanPending { .. })
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::McqPending => "mcq_pending",
            Self::FeynmanPending { .. } => "feynman_pending",
        };
        write!(f, "{s}")
    }
}

/// One channel's tutoring session.
#[derive(Debug, Clone)]
pub struct Session {
    pub channel_id: String,
    /// Source material for every generation in this session.
    pub transcript: String,
    pub quiz_questions: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh session waiting for quiz answers.
    pub fn new(
        channel_id: impl Into<String>,
        transcript: impl Into<String>,
        quiz_questions: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            channel_id: channel_id.into(),
            transcript: transcript.into(),
            quiz_questions: quiz_questions.into(),
            phase: Phase::McqPending,
            created_at: now,
            updated_at: now,
        }
    }

    /// The challenge text, once the session reached the Feynman phase.
    pub fn feynman_challenge(&self) -> Option<&str> {
        match &self.phase {
            Phase::FeynmanPending { challenge } => Some(challenge),
            Phase::McqPending => None,
        }
    }

    /// Move from `McqPending` to `FeynmanPending`, storing the challenge.
    pub fn begin_feynman(&mut self, challenge: impl Into<String>) -> Result<(), SessionError> {
        if !self.phase.is_mcq() {
            return Err(SessionError::InvalidTransition {
                channel_id: self.channel_id.clone(),
                from: self.phase.to_string(),
                to: "feynman_pending".to_string(),
            });
        }
        self.phase = Phase::FeynmanPending {
            challenge: challenge.into(),
        };
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Channel id → session. The single source of truth for phase.
///
/// Callers serialize access per channel; the store only guarantees that each
/// individual operation is atomic.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// A copy of the channel's session, if one is active.
    async fn get(&self, channel_id: &str) -> Option<Session>;

    /// Insert or overwrite the channel's session.
    async fn put(&self, channel_id: &str, session: Session);

    /// Remove the channel's session, returning it if there was one.
    async fn delete(&self, channel_id: &str) -> Option<Session>;

    /// Number of active sessions.
    async fn len(&self) -> usize;
}

/// Process-lifetime store behind a single lock.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, channel_id: &str) -> Option<Session> {
        self.sessions.read().await.get(channel_id).cloned()
    }

    async fn put(&self, channel_id: &str, session: Session) {
        let replaced = self
            .sessions
            .write()
            .await
            .insert(channel_id.to_string(), session);
        if let Some(old) = replaced {
            tracing::debug!(channel = channel_id, phase = %old.phase, "Replaced existing session");
        }
    }

    async fn delete(&self, channel_id: &str) -> Option<Session> {
        self.sessions.write().await.remove(channel_id)
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
