//! Message Alerter (C7): unread-message APRS reminders with cool-down and a
//! burst ceiling, plus an immediate alert when a personal message arrives.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use tokio::sync::Mutex;

use crate::bbs::store::{BbsStore, Category};
use crate::callsign::Callsign;
use crate::channel::manager::{ChannelManager, FrameEvent};
use crate::persistence::{MemStore, Store};

const COOLDOWN: chrono::Duration = chrono::Duration::hours(4);
const MAX_BURST: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertReason {
    NewMessage,
    Reminder,
    Retrieved,
}

#[derive(Debug, Clone)]
struct AlertState {
    last_at: DateTime<Utc>,
    count: u32,
    reason: AlertReason,
}

pub struct Alerter<P: Store = MemStore> {
    channel_manager: ChannelManager,
    store: Arc<BbsStore<P>>,
    own_callsign: Callsign,
    default_channel: Option<u32>,
    state: Mutex<HashMap<String, AlertState>>,
}

impl<P: Store + 'static> Alerter<P> {
    pub fn new(
        channel_manager: ChannelManager,
        store: Arc<BbsStore<P>>,
        own_callsign: Callsign,
        default_channel: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Alerter {
            channel_manager,
            store,
            own_callsign,
            default_channel,
            state: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the two subscriptions this component listens on: inbound frames
    /// (to notice "a station with pending mail just transmitted") and the
    /// store's added-message feed (for the immediate new-message alert).
    pub fn spawn(self: &Arc<Self>) {
        let alerter = self.clone();
        let mut frames = self.channel_manager.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = frames.recv().await {
                if let FrameEvent::Frame { channel, parsed, .. } = event {
                    let base = parsed.src().callsign.base().to_string();
                    alerter.maybe_remind(channel, &base).await;
                }
            }
        });

        let alerter = self.clone();
        let mut added = self.store.subscribe_added();
        tokio::spawn(async move {
            while let Ok(message_number) = added.recv().await {
                alerter.on_message_added(message_number).await;
            }
        });
    }

    async fn maybe_remind(&self, channel: u32, callsign_base: &str) {
        let unread = self.store.unread_personal_count(callsign_base).await;
        if unread == 0 {
            return;
        }
        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.get(callsign_base) {
                if entry.count >= MAX_BURST {
                    return;
                }
                if now - entry.last_at < COOLDOWN {
                    return;
                }
            }
            state.insert(
                callsign_base.to_string(),
                AlertState {
                    last_at: now,
                    count: state.get(callsign_base).map(|e| e.count + 1).unwrap_or(1),
                    reason: AlertReason::Reminder,
                },
            );
        }
        self.send_alert(channel, callsign_base, unread).await;
    }

    async fn on_message_added(&self, message_number: u64) {
        let Some(message) = self.store.get(message_number).await else {
            return;
        };
        if message.category != Category::P {
            return;
        }
        let Some(channel) = self.default_channel else {
            return;
        };
        let recipient_base = message
            .recipient
            .split_once('-')
            .map(|(b, _)| b)
            .unwrap_or(&message.recipient)
            .to_string();
        let unread = self.store.unread_personal_count(&recipient_base).await;
        {
            let mut state = self.state.lock().await;
            let count = state.get(&recipient_base).map(|e| e.count + 1).unwrap_or(1);
            state.insert(
                recipient_base.clone(),
                AlertState {
                    last_at: Utc::now(),
                    count,
                    reason: AlertReason::NewMessage,
                },
            );
        }
        self.send_alert(channel, &recipient_base, unread).await;
    }

    async fn send_alert(&self, channel: u32, callsign_base: &str, unread: usize) {
        let Ok(addressee) = callsign_base.parse::<Callsign>() else {
            return;
        };
        let text = format!("You have {unread} unread message(s).");
        let payload = crate::aprs::format_message(&addressee, &text, None);
        self.channel_manager
            .send_aprs_message(channel, &self.own_callsign, &addressee, &payload, &[])
            .await;
    }

    /// Periodic housekeeping (C12): drop cool-down entries that are old
    /// enough that the next inbound frame would pass the cool-down check
    /// anyway, keeping the map from growing unbounded.
    pub async fn housekeeping(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.retain(|_, entry| now - entry.last_at < chrono::Duration::hours(16));
    }

    /// Called when the callsign retrieves (reads) their personal messages,
    /// resetting cool-down/burst tracking.
    pub async fn mark_messages_retrieved(&self, callsign_base: &str) {
        let mut state = self.state.lock().await;
        state.insert(
            callsign_base.to_ascii_uppercase(),
            AlertState {
                last_at: Utc::now(),
                count: 0,
                reason: AlertReason::Retrieved,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbs::store::{NewMessage, Priority};
    use crate::channel::adapter::MockAdapter;
    use crate::channel::manager::Channel;

    async fn setup() -> (Arc<Alerter<MemStore>>, Arc<BbsStore<MemStore>>) {
        let cm = ChannelManager::new();
        let own: Callsign = "NA4WX-7".parse().unwrap();
        cm.add_channel(Channel::new(1, "A", own.clone()), Box::new(MockAdapter::new()))
            .await;
        let store = Arc::new(BbsStore::new());
        let alerter = Alerter::new(cm, store.clone(), own, Some(1));
        (alerter, store)
    }

    #[tokio::test]
    async fn immediate_alert_on_new_personal_message() {
        let (alerter, store) = setup().await;
        let n = store
            .add_message(NewMessage {
                sender: "N0CALL".into(),
                recipient: "NA4WX".into(),
                subject: "Hi".into(),
                content: "hello".into(),
                category: Category::P,
                priority: Priority::N,
                tags: Default::default(),
                reply_to: None,
                expires_at: None,
            })
            .await;
        alerter.on_message_added(n).await;
        let state = alerter.state.lock().await;
        assert_eq!(state.get("NA4WX").unwrap().reason, AlertReason::NewMessage);
    }

    #[tokio::test]
    async fn retrieval_resets_burst_count() {
        let (alerter, _store) = setup().await;
        alerter.mark_messages_retrieved("NA4WX").await;
        let state = alerter.state.lock().await;
        assert_eq!(state.get("NA4WX").unwrap().count, 0);
    }
}
