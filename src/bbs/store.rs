//! BBS message store (C6, store half): the shared, persisted message base
//! that every connected-mode session reads and writes through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::persistence::{keys, MemStore, PersistenceError, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    P, // personal
    B, // bulletin
    T, // traffic
    E, // emergency
    A, // announcement
}

impl Category {
    pub fn default_expiry(self) -> chrono::Duration {
        match self {
            Category::P => chrono::Duration::days(30),
            Category::B => chrono::Duration::days(60),
            Category::T => chrono::Duration::days(30),
            Category::E => chrono::Duration::days(7),
            Category::A => chrono::Duration::days(90),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    H,
    N,
    L,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BbsMessage {
    pub message_number: u64,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub content: String,
    pub category: Category,
    pub priority: Priority,
    pub tags: HashSet<String>,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub read: bool,
    pub read_by: HashSet<String>,
    pub size: usize,
    pub reply_to: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub content: String,
    pub category: Category,
    pub priority: Priority,
    pub tags: HashSet<String>,
    pub reply_to: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

struct Inner {
    messages: HashMap<u64, BbsMessage>,
    next_number: u64,
}

/// Shared, single-writer message store. `P` is the persistence
/// collaborator; defaults to an in-memory store for tests and for nodes
/// run without a configured data directory.
pub struct BbsStore<P: Store = MemStore> {
    inner: Mutex<Inner>,
    persistence: Option<Arc<P>>,
    added_tx: broadcast::Sender<u64>,
}

impl<P: Store> BbsStore<P> {
    pub fn new() -> Self {
        let (added_tx, _) = broadcast::channel(256);
        BbsStore {
            inner: Mutex::new(Inner {
                messages: HashMap::new(),
                next_number: 1,
            }),
            persistence: None,
            added_tx,
        }
    }

    pub fn with_persistence(persistence: Arc<P>) -> Self {
        let loaded = persistence
            .load::<Vec<BbsMessage>>(keys::BBS)
            .ok()
            .flatten()
            .unwrap_or_default();
        let mut next_number = 1;
        let mut messages = HashMap::new();
        for m in loaded {
            next_number = next_number.max(m.message_number + 1);
            messages.insert(m.message_number, m);
        }
        let (added_tx, _) = broadcast::channel(256);
        BbsStore {
            inner: Mutex::new(Inner { messages, next_number }),
            persistence: Some(persistence),
            added_tx,
        }
    }

    /// Subscribe to be notified every time a message is added, keyed by its
    /// `messageNumber` -- the Message Alerter (C7) uses this to fire an
    /// immediate alert for the named recipient.
    pub fn subscribe_added(&self) -> broadcast::Receiver<u64> {
        self.added_tx.subscribe()
    }

    async fn schedule_save(&self) -> Result<(), PersistenceError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let snapshot: Vec<BbsMessage> = self.inner.lock().await.messages.values().cloned().collect();
        persistence.save(keys::BBS, &snapshot)
    }

    /// Assigns a monotonically increasing `messageNumber` and an expiry
    /// derived from `category` unless `expires_at` was supplied explicitly.
    pub async fn add_message(&self, new: NewMessage) -> u64 {
        let now = Utc::now();
        let expires_at = new.expires_at.unwrap_or(now + new.category.default_expiry());
        let number = {
            let mut inner = self.inner.lock().await;
            let number = inner.next_number;
            inner.next_number += 1;
            let message = BbsMessage {
                message_number: number,
                sender: new.sender,
                recipient: new.recipient,
                subject: new.subject,
                content: new.content.clone(),
                category: new.category,
                priority: new.priority,
                tags: new.tags,
                timestamp: now,
                expires_at,
                read: false,
                read_by: HashSet::new(),
                size: new.content.len(),
                reply_to: new.reply_to,
            };
            inner.messages.insert(number, message);
            number
        };
        self.gc_expired().await;
        let _ = self.schedule_save().await;
        let _ = self.added_tx.send(number);
        number
    }

    pub async fn get(&self, message_number: u64) -> Option<BbsMessage> {
        self.inner.lock().await.messages.get(&message_number).cloned()
    }

    /// Marks `message_number` read by `reader_base`; invariant enforced:
    /// `read == true` implies `readBy` is non-empty.
    pub async fn mark_as_read(&self, message_number: u64, reader_base: &str) -> bool {
        let found = {
            let mut inner = self.inner.lock().await;
            match inner.messages.get_mut(&message_number) {
                Some(m) => {
                    m.read = true;
                    m.read_by.insert(reader_base.to_ascii_uppercase());
                    true
                }
                None => false,
            }
        };
        if found {
            let _ = self.schedule_save().await;
        }
        found
    }

    pub async fn delete(&self, message_number: u64) -> bool {
        let removed = self.inner.lock().await.messages.remove(&message_number).is_some();
        if removed {
            let _ = self.schedule_save().await;
        }
        removed
    }

    /// Personal messages addressed to any SSID of `recipient_base`,
    /// newest first.
    pub async fn list_personal(&self, recipient_base: &str) -> Vec<BbsMessage> {
        let recipient_base = recipient_base.to_ascii_uppercase();
        let mut out: Vec<BbsMessage> = self
            .inner
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.category == Category::P && recipient_base_matches(&m.recipient, &recipient_base))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    pub async fn unread_personal_count(&self, recipient_base: &str) -> usize {
        self.list_personal(recipient_base)
            .await
            .iter()
            .filter(|m| !m.read)
            .count()
    }

    /// Most recent bulletins, newest first, capped at `limit`.
    pub async fn list_bulletins(&self, limit: usize) -> Vec<BbsMessage> {
        let mut out: Vec<BbsMessage> = self
            .inner
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.category == Category::B)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        out
    }

    /// Drops expired messages. Invoked at startup and after every `add`.
    pub async fn gc_expired(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.messages.retain(|_, m| m.expires_at > now);
    }
}

impl<P: Store> Default for BbsStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

fn recipient_base_matches(recipient: &str, base: &str) -> bool {
    recipient
        .split_once('-')
        .map(|(b, _)| b)
        .unwrap_or(recipient)
        .eq_ignore_ascii_case(base)
}

pub const GC_INTERVAL: Duration = Duration::from_secs(3600);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemStore;

    fn msg(sender: &str, recipient: &str, category: Category) -> NewMessage {
        NewMessage {
            sender: sender.into(),
            recipient: recipient.into(),
            subject: "Hi".into(),
            content: "hello".into(),
            category,
            priority: Priority::N,
            tags: HashSet::new(),
            reply_to: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn message_numbers_strictly_increase() {
        let store: BbsStore<MemStore> = BbsStore::new();
        let a = store.add_message(msg("N0CALL", "ALL", Category::B)).await;
        let b = store.add_message(msg("N0CALL", "ALL", Category::B)).await;
        assert!(b > a);
    }

    #[tokio::test]
    async fn mark_as_read_sets_read_by() {
        let store: BbsStore<MemStore> = BbsStore::new();
        let n = store.add_message(msg("N0CALL", "NA4WX-7", Category::P)).await;
        assert!(store.mark_as_read(n, "NA4WX").await);
        let m = store.get(n).await.unwrap();
        assert!(m.read);
        assert!(m.read_by.contains("NA4WX"));
    }

    #[tokio::test]
    async fn personal_lookup_ignores_ssid() {
        let store: BbsStore<MemStore> = BbsStore::new();
        store.add_message(msg("N0CALL", "NA4WX-7", Category::P)).await;
        let found = store.list_personal("NA4WX").await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn gc_drops_expired_messages() {
        let store: BbsStore<MemStore> = BbsStore::new();
        let mut new = msg("N0CALL", "ALL", Category::B);
        new.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.add_message(new).await;
        assert_eq!(store.list_bulletins(10).await.len(), 0);
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let persistence = Arc::new(MemStore::new());
        {
            let store = BbsStore::with_persistence(persistence.clone());
            store.add_message(msg("N0CALL", "ALL", Category::B)).await;
        }
        let reloaded = BbsStore::with_persistence(persistence);
        assert_eq!(reloaded.list_bulletins(10).await.len(), 1);
    }
}
