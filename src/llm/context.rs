//! Bounded dialogue memory
//!
//! Holds the most recent N turns, oldest first. N is fixed when the memory is
//! created; pushing into a full memory evicts the oldest turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// One completed user/assistant exchange. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub user_text: String,
    pub assistant_text: String,
    pub timestamp: DateTime<Utc>,
    /// Backend round trip in milliseconds
    pub latency_ms: u64,
}

impl Turn {
    pub fn new(user_text: impl Into<String>, assistant_text: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            timestamp: Utc::now(),
            latency_ms,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConversationMemory {
    turns: VecDeque<Turn>,
    capacity: usize,
}

impl ConversationMemory {
    /// Memory holding at most `capacity` turns (0 keeps no context at all)
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a turn, evicting the oldest if the window is full.
    /// Returns the evicted turn.
    pub fn push(&mut self, turn: Turn) -> Option<Turn> {
        if self.capacity == 0 {
            return Some(turn);
        }
        let evicted = if self.turns.len() == self.capacity {
            self.turns.pop_front()
        } else {
            None
        };
        self.turns.push_back(turn);
        evicted
    }

    /// Turns oldest-first
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// A memory with a different window, keeping the most recent turns
    pub fn resized(&self, capacity: usize) -> Self {
        let mut memory = Self::new(capacity);
        let skip = self.turns.len().saturating_sub(capacity);
        for turn in self.turns.iter().skip(skip) {
            memory.push(turn.clone());
        }
        memory
    }
}
