//! Per-conversation turn history. Bounded per conversation and aged out
//! by inactivity, so abandoned sessions do not accumulate.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::MemoryConfig;

#[derive(Debug, Clone)]
pub struct Turn {
    pub question: String,
    pub answer: String,
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Conversation {
    turns: VecDeque<Turn>,
    last_activity: DateTime<Utc>,
}

pub struct ConversationMemory {
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    max_turns: usize,
    ttl: Duration,
}

impl ConversationMemory {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_turns: config.max_turns_per_conversation.max(1),
            ttl: Duration::seconds(config.ttl_secs as i64),
        }
    }

    /// Record one question/answer exchange, evicting the oldest turn once
    /// the conversation is at capacity.
    pub fn record(&self, conversation_id: Uuid, question: &str, answer: &str) {
        let now = Utc::now();
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .entry(conversation_id)
            .or_insert_with(|| Conversation {
                turns: VecDeque::new(),
                last_activity: now,
            });

        if conversation.turns.len() >= self.max_turns {
            conversation.turns.pop_front();
        }
        conversation.turns.push_back(Turn {
            question: question.to_string(),
            answer: answer.to_string(),
            asked_at: now,
        });
        conversation.last_activity = now;
    }

    /// Oldest-first turn history; empty for unknown or expired conversations.
    pub fn history(&self, conversation_id: Uuid) -> Vec<Turn> {
        let conversations = self.conversations.read();
        match conversations.get(&conversation_id) {
            Some(c) if Utc::now() - c.last_activity < self.ttl => {
                c.turns.iter().cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// History rendered for prompt injection, most recent turns last.
    pub fn recent_context(&self, conversation_id: Uuid) -> Option<String> {
        let turns = self.history(conversation_id);
        if turns.is_empty() {
            return None;
        }
        let rendered = turns
            .iter()
            .map(|t| format!("Domanda: {}\nRisposta: {}", t.question, t.answer))
            .collect::<Vec<_>>()
            .join("\n\n");
        Some(rendered)
    }

    /// Drop conversations inactive beyond the TTL. Called opportunistically
    /// by the host, not on a timer.
    pub fn prune_expired(&self) {
        let cutoff = Utc::now() - self.ttl;
        let mut conversations = self.conversations.write();
        let before = conversations.len();
        conversations.retain(|_, c| c.last_activity > cutoff);
        let removed = before - conversations.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Pruned expired conversations");
        }
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.read().len()
    }
}
