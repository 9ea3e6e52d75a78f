//! Message persistence collaborator.
//!
//! The gateway never persists anything: the HTTP send path appends here
//! first, then pushes the stored envelope to the receiver's live connections.
//! This in-process store stands in for the external durable database in dev
//! and tests; the interface is the contract.

use tokio::sync::RwLock;

use crate::events::ChatMessage;

pub struct InMemoryMessageStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Append one envelope. The write is visible to readers on return, so a
    /// push issued afterwards can never race ahead of durability.
    pub async fn append(&self, msg: ChatMessage) {
        self.messages.write().await.push(msg);
    }

    /// Conversation between two users, oldest first, capped at `limit`
    /// (keeping the most recent messages).
    pub async fn conversation(&self, a: &str, b: &str, limit: usize) -> Vec<ChatMessage> {
        let messages = self.messages.read().await;
        let mut out: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| {
                (m.sender_id == a && m.receiver_id == b)
                    || (m.sender_id == b && m.receiver_id == a)
            })
            .cloned()
            .collect();
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        out
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn msg(from: &str, to: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            text: text.to_string(),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn conversation_is_bidirectional_and_isolated() {
        let store = InMemoryMessageStore::new();
        store.append(msg("a", "b", "hi")).await;
        store.append(msg("b", "a", "hey")).await;
        store.append(msg("a", "c", "other")).await;

        let conv = store.conversation("a", "b", 100).await;
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].text, "hi");
        assert_eq!(conv[1].text, "hey");

        assert!(store.conversation("b", "c", 100).await.is_empty());
    }

    #[tokio::test]
    async fn conversation_cap_keeps_most_recent() {
        let store = InMemoryMessageStore::new();
        for i in 0..5 {
            store.append(msg("a", "b", &i.to_string())).await;
        }
        let conv = store.conversation("a", "b", 2).await;
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].text, "3");
        assert_eq!(conv[1].text, "4");
    }
}
