//! Concurrent session store
//!
//! Sessions live in a sharded `DashMap`; every operation locks only the
//! shard holding its key, so work on different sessions never contends on a
//! single lock. The busy check and the in-flight registration happen under
//! the same entry lock.

use super::{ActiveQuery, AuthState, Session, Turn, UserFact};
use crate::config::SessionConfig;
use crate::errors::{AppError, Result};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Bounds applied by the store
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_turns: usize,
    pub max_facts: usize,
    pub idle_timeout: Duration,
    pub disconnect_grace: Duration,
}

impl From<&SessionConfig> for SessionLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_turns: config.max_turns.max(1),
            max_facts: config.max_facts,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            disconnect_grace: Duration::from_secs(config.disconnect_grace_secs),
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// Proof that a query was admitted for a session
#[derive(Debug, Clone)]
pub struct QueryTicket {
    pub session_id: String,
    pub user_id: String,
    pub query_id: Uuid,
    pub cancel: CancellationToken,
    /// Facts known at admission time
    pub user_facts: Vec<UserFact>,
}

/// What happened when a query was retired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The turn was appended to conversation memory
    Recorded,
    /// The query retired without a turn
    Discarded,
    /// The session no longer exists (logout or expiry)
    SessionGone,
    /// Another query id is registered; nothing was changed
    Stale,
}

pub struct SessionStore {
    sessions: DashMap<String, Session>,
    limits: SessionLimits,
}

impl SessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Create a session for an authenticated user
    pub fn create(&self, user_id: &str) -> Session {
        let session = Session::new(user_id.to_string());
        self.sessions.insert(session.session_id.clone(), session.clone());
        info!(session_id = %session.session_id, user_id, "Session created");
        session
    }

    /// Snapshot of a session
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Admit a query, rejecting it when one is already in flight
    pub fn begin_query(&self, session_id: &str) -> Result<QueryTicket> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::UnknownSession {
                id: session_id.to_string(),
            })?;

        if session.active_query.is_some() {
            return Err(AppError::Busy {
                session_id: session_id.to_string(),
            });
        }

        let query_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        session.active_query = Some(ActiveQuery {
            query_id,
            cancel: cancel.clone(),
        });
        session.auth_state = AuthState::Authenticated;
        session.touch();

        debug!(session_id, %query_id, "Query admitted");
        Ok(QueryTicket {
            session_id: session_id.to_string(),
            user_id: session.user_id.clone(),
            query_id,
            cancel,
            user_facts: session.user_facts.clone(),
        })
    }

    /// Retire a query; the turn is appended only when given and only once
    pub fn finish_query(
        &self,
        session_id: &str,
        query_id: Uuid,
        turn: Option<Turn>,
        facts: Vec<UserFact>,
    ) -> FinishOutcome {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return FinishOutcome::SessionGone;
        };

        match &session.active_query {
            Some(active) if active.query_id == query_id => {}
            _ => return FinishOutcome::Stale,
        }

        session.active_query = None;
        session.touch();

        match turn {
            Some(turn) => {
                let (max_turns, max_facts) = (self.limits.max_turns, self.limits.max_facts);
                session.push_turn(turn, max_turns);
                session.merge_facts(facts, max_facts);
                FinishOutcome::Recorded
            }
            None => FinishOutcome::Discarded,
        }
    }

    /// Cancel the in-flight query of a session, if any
    pub fn cancel_query(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => match &session.active_query {
                Some(active) => {
                    active.cancel.cancel();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Destroy a session, cancelling its in-flight query
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let (_, session) = self.sessions.remove(session_id)?;
        if let Some(active) = &session.active_query {
            active.cancel.cancel();
        }
        info!(session_id, "Session destroyed");
        Some(session)
    }

    /// Mark a session as orphaned by its connection
    ///
    /// The in-flight query is cancelled at once; the session itself is
    /// destroyed by [`SessionStore::reap`] once the grace period passes.
    pub fn detach(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            if let Some(active) = &session.active_query {
                active.cancel.cancel();
            }
            session.auth_state = AuthState::Detached {
                since: Instant::now(),
            };
            debug!(session_id, "Session detached");
        }
    }

    /// Refresh activity and bind the session to a live connection again
    pub fn attach(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.auth_state = AuthState::Authenticated;
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Last `n` turns of a session in chronological order
    pub fn recent_turns(&self, session_id: &str, n: usize) -> Option<Vec<Turn>> {
        self.sessions.get(session_id).map(|s| s.recent_turns(n))
    }

    /// Destroy idle and orphaned sessions; returns the removed ids
    pub fn reap(&self, now: Instant) -> Vec<String> {
        let mut removed = Vec::new();
        let limits = &self.limits;

        self.sessions.retain(|id, session| {
            let expired = match session.auth_state {
                AuthState::Detached { since } => {
                    now.saturating_duration_since(since) >= limits.disconnect_grace
                }
                AuthState::Authenticated => {
                    session.active_query.is_none()
                        && now.saturating_duration_since(session.last_seen) >= limits.idle_timeout
                }
            };
            if expired {
                if let Some(active) = &session.active_query {
                    active.cancel.cancel();
                }
                removed.push(id.clone());
            }
            !expired
        });

        if !removed.is_empty() {
            info!(count = removed.len(), "Reaped expired sessions");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn store() -> SessionStore {
        SessionStore::new(SessionLimits::default())
    }

    #[test]
    fn test_begin_query_rejects_second_query() {
        let store = store();
        let session = store.create("alice");

        let ticket = store.begin_query(&session.session_id).unwrap();
        let err = store.begin_query(&session.session_id).unwrap_err();
        assert!(matches!(err, AppError::Busy { .. }));

        // The first query is unaffected
        assert!(!ticket.cancel.is_cancelled());
        assert!(store.get(&session.session_id).unwrap().has_query_in_flight());
    }

    #[test]
    fn test_unknown_session() {
        let err = store().begin_query("nope").unwrap_err();
        assert!(matches!(err, AppError::UnknownSession { .. }));
    }

    #[test]
    fn test_finish_appends_turn_once() {
        let store = store();
        let id = store.create("alice").session_id;
        let ticket = store.begin_query(&id).unwrap();

        let outcome = store.finish_query(
            &id,
            ticket.query_id,
            Some(Turn::new("q", "a")),
            vec![UserFact::new("likes", "rust")],
        );
        assert_eq!(outcome, FinishOutcome::Recorded);

        // Retiring the same query again changes nothing
        let again = store.finish_query(&id, ticket.query_id, Some(Turn::new("q", "a")), vec![]);
        assert_eq!(again, FinishOutcome::Stale);

        let session = store.get(&id).unwrap();
        assert_eq!(session.conversation_memory.len(), 1);
        assert_eq!(session.user_facts.len(), 1);
        assert!(!session.has_query_in_flight());
    }

    #[test]
    fn test_failed_query_discards_turn() {
        let store = store();
        let id = store.create("alice").session_id;
        let ticket = store.begin_query(&id).unwrap();
        assert_eq!(
            store.finish_query(&id, ticket.query_id, None, vec![]),
            FinishOutcome::Discarded
        );
        assert!(store.get(&id).unwrap().conversation_memory.is_empty());
        // Session is usable again
        assert!(store.begin_query(&id).is_ok());
    }

    #[test]
    fn test_remove_cancels_in_flight_query() {
        let store = store();
        let id = store.create("alice").session_id;
        let ticket = store.begin_query(&id).unwrap();

        assert!(store.remove(&id).is_some());
        assert!(ticket.cancel.is_cancelled());
        assert_eq!(
            store.finish_query(&id, ticket.query_id, Some(Turn::new("q", "a")), vec![]),
            FinishOutcome::SessionGone
        );
        assert!(store.remove(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_detached_after_grace() {
        let store = SessionStore::new(SessionLimits {
            disconnect_grace: Duration::from_secs(30),
            ..SessionLimits::default()
        });
        let id = store.create("alice").session_id;
        let ticket = store.begin_query(&id).unwrap();

        store.detach(&id);
        assert!(ticket.cancel.is_cancelled());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.reap(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(store.reap(Instant::now()), vec![id.clone()]);
        assert!(!store.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_rescues_detached_session() {
        let store = store();
        let id = store.create("alice").session_id;
        store.detach(&id);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.attach(&id));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(store.reap(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle_sessions() {
        let store = SessionStore::new(SessionLimits {
            idle_timeout: Duration::from_secs(60),
            ..SessionLimits::default()
        });
        let idle = store.create("alice").session_id;
        let busy = store.create("bob").session_id;
        let _ticket = store.begin_query(&busy).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let removed = store.reap(Instant::now());
        assert_eq!(removed, vec![idle]);
        assert!(store.contains(&busy));
    }

    #[test]
    fn test_concurrent_admission_accepts_exactly_one() {
        let store = Arc::new(store());
        let id = store.create("alice").session_id;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                std::thread::spawn(move || store.begin_query(&id).is_ok())
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
    }

    proptest! {
        #[test]
        fn prop_at_most_one_query_in_flight(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let store = store();
            let id = store.create("alice").session_id;
            let mut in_flight: Option<Uuid> = None;

            for op in ops {
                match op {
                    0 => {
                        let result = store.begin_query(&id);
                        if in_flight.is_some() {
                            let busy = matches!(result, Err(AppError::Busy { .. }));
                            prop_assert!(busy, "second query admitted while one is in flight");
                        } else {
                            in_flight = Some(result.unwrap().query_id);
                        }
                    }
                    1 => {
                        if let Some(query_id) = in_flight.take() {
                            store.finish_query(&id, query_id, Some(Turn::new("q", "a")), vec![]);
                        }
                    }
                    _ => {
                        if let Some(query_id) = in_flight.take() {
                            store.finish_query(&id, query_id, None, vec![]);
                        }
                    }
                }
                prop_assert_eq!(store.get(&id).unwrap().has_query_in_flight(), in_flight.is_some());
            }
        }
    }
}
