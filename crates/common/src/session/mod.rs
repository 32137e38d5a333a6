//! Session model and store
//!
//! A session is created on login and destroyed on logout, idle expiry, or
//! after the disconnect grace period. It owns the conversation memory and
//! the user facts inferred from earlier turns.

mod store;

pub use store::{FinishOutcome, QueryTicket, SessionLimits, SessionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One completed question/answer exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub query_text: String,
    pub answer_text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(query_text: impl Into<String>, answer_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            answer_text: answer_text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Render as a memory snippet
    pub fn as_context(&self) -> String {
        format!("Q: {}\nA: {}", self.query_text, self.answer_text)
    }
}

/// A short-lived key/value annotation about the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFact {
    pub key: String,
    pub value: String,
}

impl UserFact {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Whether a client connection currently holds the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Authenticated,
    /// The owning connection dropped; the session survives until the grace period ends
    Detached { since: Instant },
}

/// The in-flight query of a session
#[derive(Debug, Clone)]
pub(crate) struct ActiveQuery {
    pub query_id: Uuid,
    pub cancel: CancellationToken,
}

/// Per-user session state
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub conversation_memory: VecDeque<Turn>,
    pub user_facts: Vec<UserFact>,
    pub auth_state: AuthState,
    pub(crate) active_query: Option<ActiveQuery>,
    pub(crate) last_seen: Instant,
}

impl Session {
    pub(crate) fn new(user_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().simple().to_string(),
            user_id,
            created_at: now,
            last_active_at: now,
            conversation_memory: VecDeque::new(),
            user_facts: Vec::new(),
            auth_state: AuthState::Authenticated,
            active_query: None,
            last_seen: Instant::now(),
        }
    }

    pub fn has_query_in_flight(&self) -> bool {
        self.active_query.is_some()
    }

    pub(crate) fn touch(&mut self) {
        self.last_active_at = Utc::now();
        self.last_seen = Instant::now();
    }

    /// Append a turn, dropping the oldest beyond `max_turns`
    pub(crate) fn push_turn(&mut self, turn: Turn, max_turns: usize) {
        self.conversation_memory.push_back(turn);
        while self.conversation_memory.len() > max_turns {
            self.conversation_memory.pop_front();
        }
    }

    /// Merge facts; a newer value replaces an older one for the same key
    pub(crate) fn merge_facts(&mut self, facts: Vec<UserFact>, max_facts: usize) {
        for fact in facts {
            self.user_facts.retain(|f| f.key != fact.key);
            self.user_facts.push(fact);
        }
        if self.user_facts.len() > max_facts {
            let excess = self.user_facts.len() - max_facts;
            self.user_facts.drain(..excess);
        }
    }

    /// Last `n` turns in chronological order
    pub fn recent_turns(&self, n: usize) -> Vec<Turn> {
        let skip = self.conversation_memory.len().saturating_sub(n);
        self.conversation_memory.iter().skip(skip).cloned().collect()
    }
}
