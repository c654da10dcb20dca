//! Chat Sync (C9): vector-clock admission and hash-dedup distribution of
//! chat messages over the mesh transport (C10).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::chat::manager::{ChatEvent, ChatManager, ChatMessage};
use crate::chat::transport::{MeshPacket, MeshTransport, Priority, TransportEvent};

const SYNC_INTERVAL: Duration = Duration::from_secs(30);
const SEEN_TTL: Duration = Duration::from_secs(3600);
const RETRY_SPACING: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const PERIODIC_BATCH_TTL: u8 = 7;
const OUTBOUND_TTL: u8 = 5;
const PERIODIC_BATCH_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncPacket {
    kind: String,
    room_id: String,
    messages: Vec<ChatMessage>,
    hash: u64,
    source_node: String,
    vector_clock: HashMap<String, u64>,
}

struct SeenEntry {
    seen_at: Instant,
}

struct Inner {
    seen_messages: HashMap<u64, SeenEntry>,
    vector_clocks: HashMap<String, HashMap<String, u64>>,
    last_sync: HashMap<String, chrono::DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
pub struct SyncMetrics {
    pub messages_deduplicated: u64,
    pub messages_broadcast: u64,
    pub messages_received: u64,
    pub broadcast_retries: u64,
}

pub struct ChatSync {
    node_id: String,
    chat: Arc<ChatManager>,
    transport: Arc<dyn MeshTransport>,
    inner: Mutex<Inner>,
    metrics: Mutex<SyncMetrics>,
}

fn hash_message(message: &ChatMessage, source_node: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    message.message_id.hash(&mut hasher);
    source_node.hash(&mut hasher);
    message.sender.hash(&mut hasher);
    message.text.hash(&mut hasher);
    message.timestamp.timestamp_millis().hash(&mut hasher);
    hasher.finish()
}

/// Admits `remote` against `local` per the "not strictly dominated" rule:
/// accept unless every remote entry is `<=` the corresponding local entry.
fn remote_is_admissible(local: &HashMap<String, u64>, remote: &HashMap<String, u64>) -> bool {
    remote.iter().any(|(node, &count)| count > *local.get(node).unwrap_or(&0))
}

fn merge_clock(local: &mut HashMap<String, u64>, remote: &HashMap<String, u64>) {
    for (node, &count) in remote {
        let entry = local.entry(node.clone()).or_insert(0);
        if count > *entry {
            *entry = count;
        }
    }
}

impl ChatSync {
    pub fn new(node_id: String, chat: Arc<ChatManager>, transport: Arc<dyn MeshTransport>) -> Arc<Self> {
        Arc::new(ChatSync {
            node_id,
            chat,
            transport,
            inner: Mutex::new(Inner {
                seen_messages: HashMap::new(),
                vector_clocks: HashMap::new(),
                last_sync: HashMap::new(),
            }),
            metrics: Mutex::new(SyncMetrics::default()),
        })
    }

    pub async fn metrics(&self) -> SyncMetrics {
        self.metrics.lock().await.clone()
    }

    /// Spawn the outbound (on local `message-sent`), inbound (mesh `data`),
    /// and periodic-sync loops.
    pub fn spawn(self: &Arc<Self>) {
        let sync = self.clone();
        let mut chat_events = self.chat.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = chat_events.recv().await {
                if let ChatEvent::MessageSent { room, message } = event {
                    sync.on_local_message(&room, message).await;
                }
            }
        });

        let sync = self.clone();
        let mut transport_events = self.transport.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = transport_events.recv().await {
                if let TransportEvent::Data(packet) = event {
                    sync.on_inbound_packet(packet).await;
                }
            }
        });

        let sync = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(SYNC_INTERVAL).await;
                sync.periodic_sync().await;
                sync.purge_seen().await;
            }
        });
    }

    async fn on_local_message(&self, room: &str, message: ChatMessage) {
        let hash = hash_message(&message, &self.node_id);
        let vector_clock = {
            let mut inner = self.inner.lock().await;
            let clock = inner.vector_clocks.entry(room.to_string()).or_default();
            *clock.entry(self.node_id.clone()).or_insert(0) += 1;
            inner.seen_messages.insert(hash, SeenEntry { seen_at: Instant::now() });
            inner.vector_clocks[room].clone()
        };
        let packet = SyncPacket {
            kind: "chat-message".into(),
            room_id: room.to_string(),
            messages: vec![message],
            hash,
            source_node: self.node_id.clone(),
            vector_clock,
        };
        self.broadcast_with_retry(packet).await;
    }

    async fn broadcast_with_retry(&self, packet: SyncPacket) {
        let Ok(data) = serde_json::to_vec(&packet) else {
            return;
        };
        let mesh_packet = MeshPacket {
            kind: packet.kind.clone(),
            data,
            priority: Priority::High,
            ttl: OUTBOUND_TTL,
        };
        for attempt in 0..=MAX_RETRIES {
            match self.transport.broadcast(mesh_packet.clone()).await {
                Ok(()) => {
                    self.metrics.lock().await.messages_broadcast += 1;
                    return;
                }
                Err(err) => {
                    warn!("chat sync broadcast attempt {attempt} failed: {err}");
                    self.metrics.lock().await.broadcast_retries += 1;
                    if attempt < MAX_RETRIES {
                        sleep(RETRY_SPACING).await;
                    }
                }
            }
        }
    }

    async fn on_inbound_packet(&self, packet: MeshPacket) {
        if packet.kind != "chat-message" && packet.kind != "chat-sync" {
            return;
        }
        let Ok(sync_packet) = serde_json::from_slice::<SyncPacket>(&packet.data) else {
            return;
        };
        if sync_packet.source_node == self.node_id {
            return;
        }
        {
            let mut inner = self.inner.lock().await;
            if inner.seen_messages.contains_key(&sync_packet.hash) {
                self.metrics.lock().await.messages_deduplicated += 1;
                return;
            }
            let local_clock = inner.vector_clocks.entry(sync_packet.room_id.clone()).or_default();
            if !remote_is_admissible(local_clock, &sync_packet.vector_clock) {
                debug!("dropping dominated clock for room {}", sync_packet.room_id);
                return;
            }
            merge_clock(local_clock, &sync_packet.vector_clock);
            inner.seen_messages.insert(
                sync_packet.hash,
                SeenEntry {
                    seen_at: Instant::now(),
                },
            );
        }
        self.metrics.lock().await.messages_received += 1;
        for mut message in sync_packet.messages {
            message.synced = true;
            self.chat.append_synced(&sync_packet.room_id, message).await;
        }
    }

    async fn periodic_sync(&self) {
        for room in self.chat.room_names().await {
            let since = {
                let inner = self.inner.lock().await;
                inner
                    .last_sync
                    .get(&room)
                    .copied()
                    .unwrap_or_else(|| Utc::now() - chrono::Duration::days(1))
            };
            let messages = self.chat.messages_since(&room, since, PERIODIC_BATCH_LIMIT).await;
            if messages.is_empty() {
                continue;
            }
            let hash = {
                let mut hasher = DefaultHasher::new();
                for m in &messages {
                    hash_message(m, &self.node_id).hash(&mut hasher);
                }
                hasher.finish()
            };
            let vector_clock = {
                let mut inner = self.inner.lock().await;
                inner.last_sync.insert(room.clone(), Utc::now());
                inner.vector_clocks.entry(room.clone()).or_default().clone()
            };
            let packet = SyncPacket {
                kind: "chat-sync".into(),
                room_id: room,
                messages,
                hash,
                source_node: self.node_id.clone(),
                vector_clock,
            };
            let Ok(data) = serde_json::to_vec(&packet) else {
                continue;
            };
            let _ = self
                .transport
                .broadcast(MeshPacket {
                    kind: packet.kind,
                    data,
                    priority: Priority::Normal,
                    ttl: PERIODIC_BATCH_TTL,
                })
                .await;
        }
    }

    async fn purge_seen(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.seen_messages.retain(|_, entry| now.duration_since(entry.seen_at) < SEEN_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callsign::Callsign;
    use crate::chat::transport::LoopbackTransport;

    fn cs(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn local_message_is_hashed_and_seen() {
        let chat = ChatManager::new();
        chat.create_room("LOBBY", &cs("N0CALL"), "", true, true, None, 10)
            .await
            .unwrap();
        chat.join_room("LOBBY", &cs("N0CALL"), None).await.unwrap();
        let transport: Arc<dyn MeshTransport> = Arc::new(LoopbackTransport::new());
        let sync = ChatSync::new("N1".into(), chat.clone(), transport);
        let message = chat.send_message("LOBBY", &cs("N0CALL"), "hi").await.unwrap();
        sync.on_local_message("LOBBY", message).await;
        assert_eq!(sync.metrics().await.messages_broadcast, 1);
    }

    #[tokio::test]
    async fn duplicate_inbound_hash_is_deduped() {
        let chat = ChatManager::new();
        chat.create_room("LOBBY", &cs("N0CALL"), "", true, true, None, 10)
            .await
            .unwrap();
        let transport: Arc<dyn MeshTransport> = Arc::new(LoopbackTransport::new());
        let sync = ChatSync::new("N1".into(), chat, transport);
        let message = ChatMessage {
            message_id: 1,
            room: "LOBBY".into(),
            sender: "K1ABC".into(),
            text: "hi".into(),
            timestamp: Utc::now(),
            synced: false,
        };
        let hash = hash_message(&message, "N2");
        let mut clock = HashMap::new();
        clock.insert("N2".to_string(), 1u64);
        let packet = SyncPacket {
            kind: "chat-message".into(),
            room_id: "LOBBY".into(),
            messages: vec![message],
            hash,
            source_node: "N2".into(),
            vector_clock: clock,
        };
        let mesh_packet = MeshPacket {
            kind: packet.kind.clone(),
            data: serde_json::to_vec(&packet).unwrap(),
            priority: Priority::High,
            ttl: 5,
        };
        sync.on_inbound_packet(mesh_packet.clone()).await;
        sync.on_inbound_packet(mesh_packet).await;
        assert_eq!(sync.metrics().await.messages_deduplicated, 1);
    }

    #[tokio::test]
    async fn own_source_node_is_ignored() {
        let chat = ChatManager::new();
        let transport: Arc<dyn MeshTransport> = Arc::new(LoopbackTransport::new());
        let sync = ChatSync::new("N1".into(), chat, transport);
        let message = ChatMessage {
            message_id: 1,
            room: "LOBBY".into(),
            sender: "N0CALL".into(),
            text: "hi".into(),
            timestamp: Utc::now(),
            synced: false,
        };
        let packet = SyncPacket {
            kind: "chat-message".into(),
            room_id: "LOBBY".into(),
            messages: vec![message.clone()],
            hash: hash_message(&message, "N1"),
            source_node: "N1".into(),
            vector_clock: HashMap::new(),
        };
        let mesh_packet = MeshPacket {
            kind: packet.kind.clone(),
            data: serde_json::to_vec(&packet).unwrap(),
            priority: Priority::High,
            ttl: 5,
        };
        sync.on_inbound_packet(mesh_packet).await;
        assert_eq!(sync.metrics().await.messages_received, 0);
    }
}
