//! Chat Manager (C8): rooms, membership, rate-limiting, and a bounded
//! history ring per room.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::callsign::Callsign;

pub const DEFAULT_MAX_HISTORY: usize = 100;
pub const DEFAULT_RATE_LIMIT: u32 = 10;
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: u64,
    pub room: String,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    RoomExists,
    RoomNotFound,
    PersistentRoom,
    WrongPassword,
    Banned,
    RoomFull,
    NotModerator,
    Muted,
    RateLimited,
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChatError::RoomExists => "room already exists",
            ChatError::RoomNotFound => "room not found",
            ChatError::PersistentRoom => "cannot delete a persistent room",
            ChatError::WrongPassword => "wrong room password",
            ChatError::Banned => "callsign is banned from this room",
            ChatError::RoomFull => "room is at capacity",
            ChatError::NotModerator => "caller is not a moderator or creator",
            ChatError::Muted => "callsign is muted in this room",
            ChatError::RateLimited => "sliding-window rate limit exceeded",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for ChatError {}

pub struct Room {
    pub name: String,
    pub description: String,
    pub users: HashSet<String>,
    pub moderators: HashSet<String>,
    pub banned: HashSet<String>,
    pub muted: HashSet<String>,
    pub messages: VecDeque<ChatMessage>,
    pub topic: String,
    pub password: Option<String>,
    pub max_users: usize,
    pub persistent: bool,
    pub public: bool,
    pub creator: String,
    max_history: usize,
}

impl Room {
    fn push_message(&mut self, message: ChatMessage) {
        if self.messages.len() >= self.max_history {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    RoomCreated { room: String },
    RoomDeleted { room: String },
    UserJoined { room: String, callsign: String },
    UserLeft { room: String, callsign: String },
    MessageSent { room: String, message: ChatMessage },
    PrivateMessageSent { from: String, to: String, text: String },
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub room_count: usize,
    pub total_users: usize,
    pub total_messages: u64,
}

struct RateState {
    sent_at: VecDeque<Instant>,
}

struct Inner {
    rooms: HashMap<String, Room>,
    current_room: HashMap<String, String>,
    rate: HashMap<String, RateState>,
    next_message_id: u64,
    total_messages: u64,
}

pub struct ChatManager {
    inner: Mutex<Inner>,
    events_tx: broadcast::Sender<ChatEvent>,
}

impl ChatManager {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(ChatManager {
            inner: Mutex::new(Inner {
                rooms: HashMap::new(),
                current_room: HashMap::new(),
                rate: HashMap::new(),
                next_message_id: 1,
                total_messages: 0,
            }),
            events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events_tx.send(event);
    }

    pub async fn create_room(
        &self,
        name: &str,
        creator: &Callsign,
        description: &str,
        persistent: bool,
        public: bool,
        password: Option<String>,
        max_users: usize,
    ) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        if inner.rooms.contains_key(name) {
            return Err(ChatError::RoomExists);
        }
        let creator_base = creator.base().to_string();
        let mut moderators = HashSet::new();
        moderators.insert(creator_base.clone());
        inner.rooms.insert(
            name.to_string(),
            Room {
                name: name.to_string(),
                description: description.to_string(),
                users: HashSet::new(),
                moderators,
                banned: HashSet::new(),
                muted: HashSet::new(),
                messages: VecDeque::new(),
                topic: String::new(),
                password,
                max_users,
                persistent,
                public,
                creator: creator_base,
                max_history: DEFAULT_MAX_HISTORY,
            },
        );
        drop(inner);
        self.emit(ChatEvent::RoomCreated { room: name.to_string() });
        Ok(())
    }

    pub async fn delete_room(&self, name: &str, caller: &Callsign) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        let room = inner.rooms.get(name).ok_or(ChatError::RoomNotFound)?;
        if room.persistent {
            return Err(ChatError::PersistentRoom);
        }
        if room.creator != caller.base() {
            return Err(ChatError::NotModerator);
        }
        inner.rooms.remove(name);
        inner.current_room.retain(|_, r| r != name);
        drop(inner);
        self.emit(ChatEvent::RoomDeleted { room: name.to_string() });
        Ok(())
    }

    pub async fn join_room(&self, name: &str, callsign: &Callsign, password: Option<&str>) -> Result<(), ChatError> {
        let base = callsign.base().to_string();
        let mut inner = self.inner.lock().await;
        let previous = inner.current_room.get(&base).cloned();
        {
            let room = inner.rooms.get(name).ok_or(ChatError::RoomNotFound)?;
            if room.banned.contains(&base) {
                return Err(ChatError::Banned);
            }
            if let Some(expected) = &room.password {
                if password != Some(expected.as_str()) {
                    return Err(ChatError::WrongPassword);
                }
            }
            if room.users.len() >= room.max_users && !room.users.contains(&base) {
                return Err(ChatError::RoomFull);
            }
        }
        if let Some(prev) = previous {
            if prev != name {
                self.leave_room_locked(&mut inner, &prev, &base);
            }
        }
        inner.rooms.get_mut(name).unwrap().users.insert(base.clone());
        inner.current_room.insert(base.clone(), name.to_string());
        drop(inner);
        self.emit(ChatEvent::UserJoined {
            room: name.to_string(),
            callsign: base,
        });
        Ok(())
    }

    fn leave_room_locked(&self, inner: &mut Inner, name: &str, base: &str) {
        let mut delete_after = false;
        if let Some(room) = inner.rooms.get_mut(name) {
            room.users.remove(base);
            delete_after = !room.persistent && room.users.is_empty();
        }
        if delete_after {
            inner.rooms.remove(name);
        }
    }

    pub async fn leave_room(&self, callsign: &Callsign) -> Option<String> {
        let base = callsign.base().to_string();
        let mut inner = self.inner.lock().await;
        let Some(name) = inner.current_room.remove(&base) else {
            return None;
        };
        let room_deleted = {
            let room = inner.rooms.get_mut(&name)?;
            room.users.remove(&base);
            !room.persistent && room.users.is_empty()
        };
        if room_deleted {
            inner.rooms.remove(&name);
        }
        drop(inner);
        self.emit(ChatEvent::UserLeft {
            room: name.clone(),
            callsign: base,
        });
        if room_deleted {
            self.emit(ChatEvent::RoomDeleted { room: name.clone() });
        }
        Some(name)
    }

    fn check_rate_limit(inner: &mut Inner, base: &str) -> bool {
        let now = Instant::now();
        let state = inner.rate.entry(base.to_string()).or_insert_with(|| RateState {
            sent_at: VecDeque::new(),
        });
        while let Some(front) = state.sent_at.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                state.sent_at.pop_front();
            } else {
                break;
            }
        }
        if state.sent_at.len() as u32 >= DEFAULT_RATE_LIMIT {
            return false;
        }
        state.sent_at.push_back(now);
        true
    }

    pub async fn send_message(&self, room: &str, sender: &Callsign, text: &str) -> Result<ChatMessage, ChatError> {
        let base = sender.base().to_string();
        let mut inner = self.inner.lock().await;
        {
            let r = inner.rooms.get(room).ok_or(ChatError::RoomNotFound)?;
            if r.muted.contains(&base) {
                return Err(ChatError::Muted);
            }
        }
        if !Self::check_rate_limit(&mut inner, &base) {
            return Err(ChatError::RateLimited);
        }
        let id = inner.next_message_id;
        inner.next_message_id += 1;
        inner.total_messages += 1;
        let message = ChatMessage {
            message_id: id,
            room: room.to_string(),
            sender: base,
            text: text.to_string(),
            timestamp: Utc::now(),
            synced: false,
        };
        inner.rooms.get_mut(room).unwrap().push_message(message.clone());
        drop(inner);
        self.emit(ChatEvent::MessageSent {
            room: room.to_string(),
            message: message.clone(),
        });
        Ok(message)
    }

    /// Used by Chat Sync to append an already-validated remote message
    /// without re-running rate limiting or emitting `message-sent`.
    pub async fn append_synced(&self, room: &str, message: ChatMessage) {
        let mut inner = self.inner.lock().await;
        if let Some(r) = inner.rooms.get_mut(room) {
            r.push_message(message);
        }
    }

    pub async fn send_private(&self, from: &Callsign, to: &Callsign, text: &str) -> Result<(), ChatError> {
        self.emit(ChatEvent::PrivateMessageSent {
            from: from.base().to_string(),
            to: to.base().to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    pub async fn set_topic(&self, room: &str, caller: &Callsign, topic: Option<&str>) -> Result<(), ChatError> {
        let base = caller.base().to_string();
        let mut inner = self.inner.lock().await;
        let r = inner.rooms.get_mut(room).ok_or(ChatError::RoomNotFound)?;
        if r.creator != base && !r.moderators.contains(&base) {
            return Err(ChatError::NotModerator);
        }
        r.topic = topic.unwrap_or("").to_string();
        Ok(())
    }

    pub async fn add_moderator(&self, room: &str, caller: &Callsign, target: &Callsign) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        let r = inner.rooms.get_mut(room).ok_or(ChatError::RoomNotFound)?;
        if r.creator != caller.base() {
            return Err(ChatError::NotModerator);
        }
        r.moderators.insert(target.base().to_string());
        Ok(())
    }

    pub async fn remove_moderator(&self, room: &str, caller: &Callsign, target: &Callsign) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        let r = inner.rooms.get_mut(room).ok_or(ChatError::RoomNotFound)?;
        if r.creator != caller.base() {
            return Err(ChatError::NotModerator);
        }
        r.moderators.remove(target.base());
        Ok(())
    }

    pub async fn ban(&self, room: &str, caller: &Callsign, target: &Callsign) -> Result<(), ChatError> {
        let base = caller.base().to_string();
        let mut inner = self.inner.lock().await;
        let r = inner.rooms.get_mut(room).ok_or(ChatError::RoomNotFound)?;
        if r.creator != base && !r.moderators.contains(&base) {
            return Err(ChatError::NotModerator);
        }
        r.users.remove(target.base());
        r.banned.insert(target.base().to_string());
        Ok(())
    }

    pub async fn mute(&self, room: &str, caller: &Callsign, target: &Callsign) -> Result<(), ChatError> {
        let base = caller.base().to_string();
        let mut inner = self.inner.lock().await;
        let r = inner.rooms.get_mut(room).ok_or(ChatError::RoomNotFound)?;
        if r.creator != base && !r.moderators.contains(&base) {
            return Err(ChatError::NotModerator);
        }
        r.muted.insert(target.base().to_string());
        Ok(())
    }

    pub async fn unmute(&self, room: &str, caller: &Callsign, target: &Callsign) -> Result<(), ChatError> {
        let base = caller.base().to_string();
        let mut inner = self.inner.lock().await;
        let r = inner.rooms.get_mut(room).ok_or(ChatError::RoomNotFound)?;
        if r.creator != base && !r.moderators.contains(&base) {
            return Err(ChatError::NotModerator);
        }
        r.muted.remove(target.base());
        Ok(())
    }

    pub async fn list_rooms(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner.rooms.values().filter(|r| r.public).map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    pub async fn get_room_history(&self, room: &str, limit: usize) -> Vec<ChatMessage> {
        let inner = self.inner.lock().await;
        let Some(r) = inner.rooms.get(room) else {
            return Vec::new();
        };
        let take = limit.min(r.max_history);
        r.messages.iter().rev().take(take).rev().cloned().collect()
    }

    pub async fn messages_since(&self, room: &str, since: DateTime<Utc>, limit: usize) -> Vec<ChatMessage> {
        let inner = self.inner.lock().await;
        let Some(r) = inner.rooms.get(room) else {
            return Vec::new();
        };
        r.messages
            .iter()
            .filter(|m| m.timestamp > since)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.inner.lock().await.rooms.keys().cloned().collect()
    }

    pub async fn get_stats(&self) -> Stats {
        let inner = self.inner.lock().await;
        Stats {
            room_count: inner.rooms.len(),
            total_users: inner.current_room.len(),
            total_messages: inner.total_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn create_join_send_and_history() {
        let mgr = ChatManager::new();
        mgr.create_room("LOBBY", &cs("N0CALL"), "general chat", true, true, None, 50)
            .await
            .unwrap();
        mgr.join_room("LOBBY", &cs("N0CALL"), None).await.unwrap();
        mgr.send_message("LOBBY", &cs("N0CALL"), "hi").await.unwrap();
        let history = mgr.get_room_history("LOBBY", 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "hi");
    }

    #[tokio::test]
    async fn non_persistent_room_auto_deletes_when_empty() {
        let mgr = ChatManager::new();
        mgr.create_room("TEMP", &cs("N0CALL"), "", false, true, None, 5)
            .await
            .unwrap();
        mgr.join_room("TEMP", &cs("N0CALL"), None).await.unwrap();
        mgr.leave_room(&cs("N0CALL")).await;
        assert!(!mgr.room_names().await.contains(&"TEMP".to_string()));
    }

    #[tokio::test]
    async fn banned_user_cannot_rejoin() {
        let mgr = ChatManager::new();
        mgr.create_room("LOBBY", &cs("N0CALL"), "", true, true, None, 5)
            .await
            .unwrap();
        mgr.join_room("LOBBY", &cs("K1ABC"), None).await.unwrap();
        mgr.ban("LOBBY", &cs("N0CALL"), &cs("K1ABC")).await.unwrap();
        let err = mgr.join_room("LOBBY", &cs("K1ABC"), None).await.unwrap_err();
        assert_eq!(err, ChatError::Banned);
    }

    #[tokio::test]
    async fn rate_limit_blocks_after_default_burst() {
        let mgr = ChatManager::new();
        mgr.create_room("LOBBY", &cs("N0CALL"), "", true, true, None, 5)
            .await
            .unwrap();
        mgr.join_room("LOBBY", &cs("N0CALL"), None).await.unwrap();
        for _ in 0..DEFAULT_RATE_LIMIT {
            mgr.send_message("LOBBY", &cs("N0CALL"), "hi").await.unwrap();
        }
        let err = mgr.send_message("LOBBY", &cs("N0CALL"), "hi").await.unwrap_err();
        assert_eq!(err, ChatError::RateLimited);
    }
}
