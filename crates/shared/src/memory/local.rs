use std::collections::VecDeque;
use std::sync::Mutex;

use super::{ConversationMemory, MemoryError, MemoryFuture};
use crate::models::Interaction;

/// In-process history with size eviction only. Lost on restart.
pub struct LocalConversationMemory {
    session_id: String,
    max_history: usize,
    history: Mutex<VecDeque<Interaction>>,
}

impl LocalConversationMemory {
    pub fn new(session_id: &str, max_history: usize) -> Result<Self, MemoryError> {
        if max_history == 0 {
            return Err(MemoryError::InvalidMaxHistory);
        }

        Ok(Self::bounded(session_id, max_history))
    }

    pub(crate) fn bounded(session_id: &str, max_history: usize) -> Self {
        let max_history = max_history.max(1);
        Self {
            session_id: session_id.to_string(),
            max_history,
            history: Mutex::new(VecDeque::with_capacity(max_history)),
        }
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<Interaction>> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ConversationMemory for LocalConversationMemory {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn add_interaction<'a>(&'a self, question: &'a str, answer: &'a str) -> MemoryFuture<'a, ()> {
        Box::pin(async move {
            let mut history = self.lock_history();
            history.push_back(Interaction::now(question, answer));
            while history.len() > self.max_history {
                history.pop_front();
            }
        })
    }

    fn history<'a>(&'a self) -> MemoryFuture<'a, Vec<Interaction>> {
        Box::pin(async move { self.lock_history().iter().cloned().collect() })
    }

    fn clear<'a>(&'a self) -> MemoryFuture<'a, ()> {
        Box::pin(async move { self.lock_history().clear() })
    }
}
