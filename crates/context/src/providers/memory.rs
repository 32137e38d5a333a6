//! Conversation memory read from the session store

use super::MemoryReader;
use async_trait::async_trait;
use hal_common::errors::{AppError, Result};
use hal_common::{SessionStore, Turn};
use std::sync::Arc;

pub struct SessionMemory {
    store: Arc<SessionStore>,
}

impl SessionMemory {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MemoryReader for SessionMemory {
    async fn recent_turns(&self, session_id: &str, n: usize) -> Result<Vec<Turn>> {
        self.store
            .recent_turns(session_id, n)
            .ok_or_else(|| AppError::UnknownSession {
                id: session_id.to_string(),
            })
    }
}
