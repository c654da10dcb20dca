//! BBS session FSM (C6, FSM half): greeting, profile capture, command
//! grammar, layered on top of the AX.25 Session Layer's delivered payloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bbs::store::{BbsStore, Category, NewMessage, Priority};
use crate::bbs::users::BbsUsers;
use crate::callsign::Callsign;
use crate::persistence::{MemStore, Store};
use crate::session::{SessionEvent, SessionKey, SessionManager};

const PROMPT_DEBOUNCE: Duration = Duration::from_secs(2);
const MAIN_PROMPT: &str = "Cmd (H=help): ";

#[derive(Debug, Clone)]
enum FsmState {
    AwaitingName,
    AwaitingQth { name: String },
    Idle,
    Composing {
        recipient: String,
        subject: String,
        buffer: Vec<String>,
        reply_to: Option<u64>,
    },
    PostRead {
        message_number: u64,
    },
}

struct SessionFsm {
    state: FsmState,
    last_prompt_at: Option<Instant>,
}

/// Owns per-session FSM state and drives replies through the session layer.
pub struct BbsFsm<P: Store = MemStore> {
    own_callsign: Callsign,
    sessions: SessionManager,
    store: Arc<BbsStore<P>>,
    users: Arc<BbsUsers<P>>,
    fsm_state: Mutex<HashMap<SessionKey, SessionFsm>>,
}

impl<P: Store + 'static> BbsFsm<P> {
    pub fn new(own_callsign: Callsign, sessions: SessionManager, store: Arc<BbsStore<P>>, users: Arc<BbsUsers<P>>) -> Arc<Self> {
        Arc::new(BbsFsm {
            own_callsign,
            sessions,
            store,
            users,
            fsm_state: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn a task forwarding `SessionEvent`s from the session layer into
    /// this FSM. Call once per running node.
    pub fn spawn(self: &Arc<Self>) {
        let fsm = self.clone();
        let mut events = self.sessions.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                fsm.handle_event(event).await;
            }
        });
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { key } => self.on_connected(key).await,
            SessionEvent::Disconnected { key } => {
                self.fsm_state.lock().await.remove(&key);
            }
            SessionEvent::Payload { key, bytes } => {
                let line = String::from_utf8_lossy(&bytes).trim_end_matches(['\r', '\n']).to_string();
                self.on_line(key, line).await;
            }
        }
    }

    async fn reply(&self, key: &SessionKey, text: &str) {
        let mut payload = text.as_bytes().to_vec();
        payload.extend_from_slice(b"\r\n");
        self.sessions.send_payload(key, payload).await;
    }

    async fn on_connected(&self, key: SessionKey) {
        let profile = self.users.get(&key.remote_base).await;
        let mut states = self.fsm_state.lock().await;
        match profile {
            Some(p) => {
                states.insert(
                    key.clone(),
                    SessionFsm {
                        state: FsmState::Idle,
                        last_prompt_at: None,
                    },
                );
                drop(states);
                self.reply(&key, &format!("Welcome back, {}!", p.name)).await;
                self.reply(&key, MAIN_PROMPT).await;
            }
            None => {
                states.insert(
                    key.clone(),
                    SessionFsm {
                        state: FsmState::AwaitingName,
                        last_prompt_at: Some(Instant::now()),
                    },
                );
                drop(states);
                self.reply(&key, &format!("{} Packet BBS", self.own_callsign)).await;
                self.reply(&key, "Enter your Name:").await;
            }
        }
    }

    async fn on_line(&self, key: SessionKey, line: String) {
        let current_state = {
            let states = self.fsm_state.lock().await;
            states.get(&key).map(|s| s.state.clone())
        };
        let Some(state) = current_state else {
            return; // no active FSM entry (session connected before we saw it)
        };

        match state {
            FsmState::AwaitingName => self.on_name(key, line).await,
            FsmState::AwaitingQth { name } => self.on_qth(key, name, line).await,
            FsmState::Idle => self.on_command(key, line).await,
            FsmState::Composing {
                recipient,
                subject,
                buffer,
                reply_to,
            } => self.on_compose_line(key, recipient, subject, buffer, reply_to, line).await,
            FsmState::PostRead { message_number } => self.on_post_read(key, message_number, line).await,
        }
    }

    async fn debounced(&self, key: &SessionKey) -> bool {
        let mut states = self.fsm_state.lock().await;
        if let Some(fsm) = states.get_mut(key) {
            if let Some(last) = fsm.last_prompt_at {
                if last.elapsed() < PROMPT_DEBOUNCE {
                    return true;
                }
            }
            fsm.last_prompt_at = Some(Instant::now());
        }
        false
    }

    async fn on_name(&self, key: SessionKey, line: String) {
        if line.trim().is_empty() {
            if self.debounced(&key).await {
                return;
            }
            self.reply(&key, "Enter your Name:").await;
            return;
        }
        let name = line.trim().to_string();
        {
            let mut states = self.fsm_state.lock().await;
            states.insert(
                key.clone(),
                SessionFsm {
                    state: FsmState::AwaitingQth { name: name.clone() },
                    last_prompt_at: None,
                },
            );
        }
        self.reply(&key, &format!("Thanks, {name}.")).await;
        self.reply(&key, "Enter your QTH (City, ST): ").await;
    }

    async fn on_qth(&self, key: SessionKey, name: String, line: String) {
        if line.trim().is_empty() {
            if self.debounced(&key).await {
                return;
            }
            self.reply(&key, "Enter your QTH (City, ST): ").await;
            return;
        }
        let qth = line.trim().to_string();
        self.users.upsert(&key.remote_base, name, qth).await;
        {
            let mut states = self.fsm_state.lock().await;
            states.insert(
                key.clone(),
                SessionFsm {
                    state: FsmState::Idle,
                    last_prompt_at: None,
                },
            );
        }
        self.reply(&key, MAIN_PROMPT).await;
    }

    async fn on_command(&self, key: SessionKey, line: String) {
        let trimmed = line.trim();
        let mut parts = trimmed.splitn(2, ' ');
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let rest = parts.next().unwrap_or("").trim();

        match verb.as_str() {
            "H" | "HELP" | "?" => {
                self.reply(&key, "H)elp L)ist P)ersonal R)ead# S)end M)essage B)ye").await;
            }
            "L" | "LIST" => {
                let bulletins = self.store.list_bulletins(10).await;
                if bulletins.is_empty() {
                    self.reply(&key, "No bulletins.").await;
                } else {
                    for m in &bulletins {
                        self.reply(&key, &format!("{:>4} {} {}", m.message_number, m.sender, m.subject)).await;
                    }
                }
            }
            "P" | "PERSONAL" => {
                let personal = self.store.list_personal(&key.remote_base).await;
                if personal.is_empty() {
                    self.reply(&key, "No personal messages.").await;
                } else {
                    for m in &personal {
                        let tag = if m.read { "READ" } else { "NEW" };
                        self.reply(&key, &format!("{:>4} {} {} [{tag}]", m.message_number, m.sender, m.subject))
                            .await;
                    }
                }
            }
            "R" => match rest.parse::<u64>() {
                Ok(n) => self.on_read(key, n).await,
                Err(_) => self.reply(&key, "Usage: R <number>").await,
            },
            "S" => {
                let mut sp = rest.splitn(2, ' ');
                let to = sp.next().unwrap_or("").to_string();
                let text = sp.next().unwrap_or("").to_string();
                if to.is_empty() || text.is_empty() {
                    self.reply(&key, "Usage: S CALL text").await;
                    return;
                }
                self.post_message(&key, &to, "Message", &text, Category::P, None).await;
                self.reply(&key, "Sent.").await;
            }
            "M" => {
                if rest.is_empty() {
                    self.reply(&key, "Usage: M CALL").await;
                    return;
                }
                let mut states = self.fsm_state.lock().await;
                states.insert(
                    key.clone(),
                    SessionFsm {
                        state: FsmState::Composing {
                            recipient: rest.to_string(),
                            subject: "Message".to_string(),
                            buffer: Vec::new(),
                            reply_to: None,
                        },
                        last_prompt_at: None,
                    },
                );
                drop(states);
                self.reply(&key, "Enter message, end with . on its own line:").await;
            }
            "B" | "BYE" => {
                self.reply(&key, "73").await;
                self.fsm_state.lock().await.remove(&key);
                self.sessions.disconnect(&key).await;
            }
            _ => {
                self.post_message(&key, "ALL", "Bulletin", trimmed, Category::B, None).await;
                self.reply(&key, "Posted.").await;
            }
        }
    }

    async fn on_read(&self, key: SessionKey, message_number: u64) {
        match self.store.get(message_number).await {
            Some(m) => {
                self.store.mark_as_read(message_number, &key.remote_base).await;
                self.reply(&key, &format!("From: {}  Subj: {}", m.sender, m.subject)).await;
                self.reply(&key, &m.content).await;
                self.reply(&key, "(Y)eply (D)elete or anything to continue").await;
                let mut states = self.fsm_state.lock().await;
                states.insert(
                    key,
                    SessionFsm {
                        state: FsmState::PostRead { message_number },
                        last_prompt_at: None,
                    },
                );
            }
            None => self.reply(&key, "No such message.").await,
        }
    }

    async fn on_post_read(&self, key: SessionKey, message_number: u64, line: String) {
        let upper = line.trim().to_ascii_uppercase();
        match upper.as_str() {
            "Y" => {
                let original = self.store.get(message_number).await;
                let (recipient, subject) = match &original {
                    Some(m) => (m.sender.clone(), format!("Re: {}", m.subject)),
                    None => (String::new(), "Re:".to_string()),
                };
                let mut states = self.fsm_state.lock().await;
                states.insert(
                    key.clone(),
                    SessionFsm {
                        state: FsmState::Composing {
                            recipient,
                            subject,
                            buffer: Vec::new(),
                            reply_to: Some(message_number),
                        },
                        last_prompt_at: None,
                    },
                );
                drop(states);
                self.reply(&key, "Enter message, end with . on its own line:").await;
            }
            "D" => {
                self.store.delete(message_number).await;
                self.set_idle(&key).await;
                self.reply(&key, "Deleted.").await;
                self.reply(&key, MAIN_PROMPT).await;
            }
            _ => {
                self.set_idle(&key).await;
                self.reply(&key, MAIN_PROMPT).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_compose_line(
        &self,
        key: SessionKey,
        recipient: String,
        subject: String,
        mut buffer: Vec<String>,
        reply_to: Option<u64>,
        line: String,
    ) {
        if line.trim() == "." {
            if !buffer.is_empty() {
                let content = buffer.join("\r\n");
                let category = if recipient.eq_ignore_ascii_case("ALL") { Category::B } else { Category::P };
                self.post_message(&key, &recipient, &subject, &content, category, reply_to).await;
                self.set_idle(&key).await;
                self.reply(&key, "Posted.").await;
            } else {
                self.set_idle(&key).await;
                self.reply(&key, "Cancelled.").await;
            }
            self.reply(&key, MAIN_PROMPT).await;
            return;
        }
        buffer.push(line);
        let mut states = self.fsm_state.lock().await;
        states.insert(
            key,
            SessionFsm {
                state: FsmState::Composing {
                    recipient,
                    subject,
                    buffer,
                    reply_to,
                },
                last_prompt_at: None,
            },
        );
    }

    async fn set_idle(&self, key: &SessionKey) {
        self.fsm_state.lock().await.insert(
            key.clone(),
            SessionFsm {
                state: FsmState::Idle,
                last_prompt_at: None,
            },
        );
    }

    async fn post_message(
        &self,
        key: &SessionKey,
        recipient: &str,
        subject: &str,
        content: &str,
        category: Category,
        reply_to: Option<u64>,
    ) {
        self.store
            .add_message(NewMessage {
                sender: key.remote_base.clone(),
                recipient: recipient.to_ascii_uppercase(),
                subject: subject.to_string(),
                content: content.to_string(),
                category,
                priority: Priority::N,
                tags: Default::default(),
                reply_to,
                expires_at: None,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::adapter::MockAdapter;
    use crate::channel::manager::{Channel, ChannelManager};

    async fn setup() -> (Arc<BbsFsm<MemStore>>, SessionManager, Callsign) {
        let cm = ChannelManager::new();
        let own: Callsign = "NA4WX-7".parse().unwrap();
        cm.add_channel(Channel::new(1, "A", own.clone()), Box::new(MockAdapter::new()))
            .await;
        let sessions = SessionManager::new(cm);
        let store = Arc::new(BbsStore::new());
        let users = Arc::new(BbsUsers::new());
        let fsm = BbsFsm::new(own.clone(), sessions.clone(), store, users);
        fsm.spawn();
        (fsm, sessions, own)
    }

    #[tokio::test]
    async fn first_connect_prompts_for_name() {
        let (fsm, _sessions, _own) = setup().await;
        let key = SessionKey::new(1, "N0CALL");

        // Directly invoke the event handler to avoid depending on SABM plumbing.
        fsm.handle_event(SessionEvent::Connected { key: key.clone() }).await;
        let states = fsm.fsm_state.lock().await;
        assert!(matches!(states.get(&key).unwrap().state, FsmState::AwaitingName));
    }

    #[tokio::test]
    async fn name_then_qth_reaches_idle_and_saves_profile() {
        let (fsm, _sessions, _own) = setup().await;
        let key = SessionKey::new(1, "N0CALL");
        fsm.handle_event(SessionEvent::Connected { key: key.clone() }).await;
        fsm.handle_event(SessionEvent::Payload {
            key: key.clone(),
            bytes: b"Alice\r".to_vec(),
        })
        .await;
        fsm.handle_event(SessionEvent::Payload {
            key: key.clone(),
            bytes: b"Anytown, ST\r".to_vec(),
        })
        .await;
        let states = fsm.fsm_state.lock().await;
        assert!(matches!(states.get(&key).unwrap().state, FsmState::Idle));
        drop(states);
        assert!(fsm.users.get("N0CALL").await.is_some());
    }

    #[tokio::test]
    async fn bulletin_post_then_list_roundtrip() {
        let (fsm, _sessions, _own) = setup().await;
        let key = SessionKey::new(1, "N0CALL");
        fsm.handle_event(SessionEvent::Connected { key: key.clone() }).await;
        fsm.handle_event(SessionEvent::Payload {
            key: key.clone(),
            bytes: b"Alice\r".to_vec(),
        })
        .await;
        fsm.handle_event(SessionEvent::Payload {
            key: key.clone(),
            bytes: b"Anytown, ST\r".to_vec(),
        })
        .await;
        fsm.handle_event(SessionEvent::Payload {
            key: key.clone(),
            bytes: b"Hello everyone\r".to_vec(),
        })
        .await;
        assert_eq!(fsm.store.list_bulletins(10).await.len(), 1);
    }
}
