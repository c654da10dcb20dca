//! AX.25 connected-mode Session Layer (C5): the SABM/UA/DISC/DM handshake
//! and modulo-8 I/S-frame sequencing, sitting directly on top of the
//! Channel Manager's `FrameEvent` stream.
//!
//! Each session is a single-owner task keyed by `(channel, remote base
//! callsign)`, per §9's "keyed single-owner sessions" design note: `vS`/`vR`
//! live entirely inside that task and need no lock. The manager here is
//! just a routing table from key to the task's mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

use crate::ax25::{self, Address, Control, Direction, Frame, UnnumberedKind};
use crate::callsign::Callsign;
use crate::channel::manager::ChannelManager;

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);
const DEFERRED_ACK_DELAY: Duration = Duration::from_secs(5);
const PID_NO_LAYER3: u8 = 0xF0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub channel_id: u32,
    pub remote_base: String,
}

impl SessionKey {
    pub fn new(channel_id: u32, remote_base: impl Into<String>) -> Self {
        SessionKey {
            channel_id,
            remote_base: remote_base.into().to_ascii_uppercase(),
        }
    }
}

/// Events delivered to higher layers (the BBS FSM, or an APRS-only consumer).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected { key: SessionKey },
    Disconnected { key: SessionKey },
    Payload { key: SessionKey, bytes: Vec<u8> },
}

enum SessionCommand {
    Inbound(Frame),
    SendPayload(Vec<u8>),
    Shutdown,
}

struct SessionTask {
    key: SessionKey,
    channel_manager: ChannelManager,
    events_tx: broadcast::Sender<SessionEvent>,
    own_callsign: Callsign,
    remote_addr: Address,
    path: Vec<Address>,
    inactivity_timeout: Duration,
    response_delay: Duration,

    v_s: u8,
    v_r: u8,
    remote_nr: u8,
    needs_ack: bool,
    last_unacked: Option<(u8, Vec<u8>)>, // (N(S) it was sent with, payload)
}

impl SessionTask {
    fn build_frame(&self, control: Control, payload: Vec<u8>) -> Vec<u8> {
        let mut addresses = vec![self.remote_addr.clone(), Address::new(self.own_callsign.clone(), false)];
        addresses.extend(self.path.iter().cloned());
        let pid = matches!(control, Control::Info { .. }).then_some(PID_NO_LAYER3);
        let frame = Frame {
            addresses,
            direction: Direction::Response,
            control,
            pid,
            payload,
        };
        ax25::build(&frame)
    }

    async fn send_control(&self, control: Control) {
        let bytes = self.build_frame(control, Vec::new());
        self.channel_manager.send_frame(self.key.channel_id, bytes).await;
    }

    async fn send_ua(&self, poll_final: bool) {
        self.send_control(Control::Unnumbered {
            kind: UnnumberedKind::UA,
            poll_final,
        })
        .await;
    }

    async fn send_dm(&self) {
        self.send_control(Control::Unnumbered {
            kind: UnnumberedKind::DM,
            poll_final: false,
        })
        .await;
    }

    async fn send_rr(&self, poll_final: bool) {
        self.send_control(Control::Supervisory {
            kind: crate::ax25::SupervisoryKind::RR,
            nr: self.v_r,
            poll_final,
        })
        .await;
    }

    async fn send_rej(&self) {
        self.send_control(Control::Supervisory {
            kind: crate::ax25::SupervisoryKind::REJ,
            nr: self.v_r,
            poll_final: false,
        })
        .await;
    }

    /// Build and send an I-frame for `payload`, advancing `vS`. Honors an
    /// optional inter-frame delay for slow TNCs (`bbsDelayMs`).
    async fn send_i_frame(&mut self, payload: Vec<u8>) {
        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }
        let ns = self.v_s;
        let bytes = self.build_frame(
            Control::Info {
                ns,
                nr: self.v_r,
                poll_final: false,
            },
            payload.clone(),
        );
        self.channel_manager.send_frame(self.key.channel_id, bytes).await;
        self.last_unacked = Some((ns, payload));
        self.v_s = (self.v_s + 1) % 8;
    }

    async fn resend_last_unacked(&mut self) {
        if let Some((_, payload)) = self.last_unacked.clone() {
            let ns = self.v_s;
            let bytes = self.build_frame(
                Control::Info {
                    ns,
                    nr: self.v_r,
                    poll_final: false,
                },
                payload.clone(),
            );
            self.channel_manager.send_frame(self.key.channel_id, bytes).await;
            self.last_unacked = Some((ns, payload));
            self.v_s = (self.v_s + 1) % 8;
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn handle_inbound(&mut self, frame: Frame) {
        match frame.control {
            Control::Unnumbered {
                kind: UnnumberedKind::SABM,
                poll_final,
            } => {
                self.v_s = 0;
                self.v_r = 0;
                self.last_unacked = None;
                self.send_ua(poll_final).await;
                self.emit(SessionEvent::Connected { key: self.key.clone() });
            }
            Control::Unnumbered {
                kind: UnnumberedKind::DISC,
                ..
            } => {
                self.send_dm().await;
                self.emit(SessionEvent::Disconnected { key: self.key.clone() });
            }
            Control::Info { ns, nr, poll_final } => {
                self.remote_nr = nr;
                if ns == self.v_r {
                    self.v_r = (self.v_r + 1) % 8;
                    self.emit(SessionEvent::Payload {
                        key: self.key.clone(),
                        bytes: frame.payload,
                    });
                    if poll_final {
                        self.send_rr(true).await;
                        self.needs_ack = false;
                    } else {
                        self.needs_ack = true;
                    }
                } else {
                    log::debug!(
                        "session {:?}: out-of-sequence I-frame N(S)={ns} expected {}",
                        self.key,
                        self.v_r
                    );
                    self.send_rej().await;
                }
            }
            Control::Supervisory {
                kind: crate::ax25::SupervisoryKind::RR,
                nr,
                ..
            } => {
                self.remote_nr = nr;
            }
            Control::Supervisory {
                kind: crate::ax25::SupervisoryKind::REJ,
                nr,
                ..
            } => {
                self.v_s = nr;
                self.resend_last_unacked().await;
            }
            _ => {
                log::debug!("session {:?}: ignoring unhandled control {:?}", self.key, frame.control);
            }
        }
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<SessionCommand>) {
        let mut inactivity_deadline = Instant::now() + self.inactivity_timeout;
        loop {
            let ack_sleep = tokio::time::sleep(DEFERRED_ACK_DELAY);
            tokio::pin!(ack_sleep);

            tokio::select! {
                cmd = mailbox.recv() => {
                    match cmd {
                        Some(SessionCommand::Inbound(frame)) => {
                            self.handle_inbound(frame).await;
                            inactivity_deadline = Instant::now() + self.inactivity_timeout;
                        }
                        Some(SessionCommand::SendPayload(bytes)) => {
                            self.send_i_frame(bytes).await;
                            inactivity_deadline = Instant::now() + self.inactivity_timeout;
                        }
                        Some(SessionCommand::Shutdown) | None => {
                            self.emit(SessionEvent::Disconnected { key: self.key.clone() });
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(inactivity_deadline) => {
                    log::debug!("session {:?}: inactivity timeout", self.key);
                    self.send_dm().await;
                    self.emit(SessionEvent::Disconnected { key: self.key.clone() });
                    return;
                }
                _ = &mut ack_sleep, if self.needs_ack => {
                    self.send_rr(false).await;
                    self.needs_ack = false;
                }
            }
        }
    }
}

struct ManagerInner {
    sessions: HashMap<SessionKey, mpsc::Sender<SessionCommand>>,
    channel_delays: HashMap<u32, Duration>,
}

/// Cloneable handle managing the live session tasks.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<ManagerInner>>,
    channel_manager: ChannelManager,
    events_tx: broadcast::Sender<SessionEvent>,
    inactivity_timeout: Duration,
}

impl SessionManager {
    pub fn new(channel_manager: ChannelManager) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        SessionManager {
            inner: Arc::new(Mutex::new(ManagerInner {
                sessions: HashMap::new(),
                channel_delays: HashMap::new(),
            })),
            channel_manager,
            events_tx,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }

    /// As [`SessionManager::new`], but with a caller-supplied inactivity
    /// timeout in place of [`DEFAULT_INACTIVITY_TIMEOUT`] (spec §5: "300 s
    /// (tunable)").
    pub fn with_inactivity_timeout(channel_manager: ChannelManager, inactivity_timeout: Duration) -> Self {
        let mut manager = Self::new(channel_manager);
        manager.inactivity_timeout = inactivity_timeout;
        manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub async fn set_channel_delay(&self, channel_id: u32, delay: Duration) {
        self.inner.lock().await.channel_delays.insert(channel_id, delay);
    }

    pub async fn active_sessions(&self) -> Vec<SessionKey> {
        self.inner.lock().await.sessions.keys().cloned().collect()
    }

    /// Route a received frame addressed to `own_callsign` into its session's
    /// mailbox, spawning a new session task on SABM.
    pub async fn handle_frame(&self, channel_id: u32, own_callsign: &Callsign, frame: Frame) {
        let remote_base = frame.src().callsign.base().to_string();
        let key = SessionKey::new(channel_id, &remote_base);

        let existing = {
            let inner = self.inner.lock().await;
            inner.sessions.get(&key).cloned()
        };

        if let Some(tx) = existing {
            if tx.send(SessionCommand::Inbound(frame)).await.is_err() {
                self.inner.lock().await.sessions.remove(&key);
            }
            return;
        }

        // No session yet: only SABM creates one. DISC with no session gets a
        // bare DM so the peer stops retrying; everything else is ignored,
        // mirroring the "none" row of the session state table.
        match &frame.control {
            Control::Unnumbered {
                kind: UnnumberedKind::SABM,
                ..
            } => {
                let delay = {
                    let inner = self.inner.lock().await;
                    inner.channel_delays.get(&channel_id).copied().unwrap_or_default()
                };
                let remote_addr = frame.src().clone();
                let path = frame.digis().to_vec();
                let (tx, rx) = mpsc::channel(32);
                let task = SessionTask {
                    key: key.clone(),
                    channel_manager: self.channel_manager.clone(),
                    events_tx: self.events_tx.clone(),
                    own_callsign: own_callsign.clone(),
                    remote_addr,
                    path,
                    inactivity_timeout: self.inactivity_timeout,
                    response_delay: delay,
                    v_s: 0,
                    v_r: 0,
                    remote_nr: 0,
                    needs_ack: false,
                    last_unacked: None,
                };
                self.inner.lock().await.sessions.insert(key.clone(), tx.clone());
                let _ = tx.send(SessionCommand::Inbound(frame)).await;
                let sessions = self.inner.clone();
                tokio::spawn(async move {
                    task.run(rx).await;
                    sessions.lock().await.sessions.remove(&key);
                });
            }
            Control::Unnumbered {
                kind: UnnumberedKind::DISC,
                ..
            } => {
                let remote_addr = frame.src().clone();
                let path = frame.digis().to_vec();
                let bare = Frame {
                    addresses: vec![remote_addr, Address::new(own_callsign.clone(), false)]
                        .into_iter()
                        .chain(path)
                        .collect(),
                    direction: Direction::Response,
                    control: Control::Unnumbered {
                        kind: UnnumberedKind::DM,
                        poll_final: false,
                    },
                    pid: None,
                    payload: Vec::new(),
                };
                self.channel_manager
                    .send_frame(channel_id, ax25::build(&bare))
                    .await;
            }
            _ => {}
        }
    }

    /// Send a payload as an I-frame on an existing session; `false` if the
    /// session is not connected (§7's UnknownResource).
    pub async fn send_payload(&self, key: &SessionKey, bytes: Vec<u8>) -> bool {
        let tx = {
            let inner = self.inner.lock().await;
            inner.sessions.get(key).cloned()
        };
        match tx {
            Some(tx) => tx.send(SessionCommand::SendPayload(bytes)).await.is_ok(),
            None => false,
        }
    }

    pub async fn disconnect(&self, key: &SessionKey) {
        let tx = {
            let mut inner = self.inner.lock().await;
            inner.sessions.remove(key)
        };
        if let Some(tx) = tx {
            let _ = tx.send(SessionCommand::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::adapter::MockAdapter;
    use crate::channel::manager::{Channel, ChannelManager};

    fn cs(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    fn sabm(dest: &str, src: &str) -> Frame {
        Frame {
            addresses: vec![Address::new(cs(dest), true), Address::new(cs(src), false)],
            direction: Direction::Command,
            control: Control::Unnumbered {
                kind: UnnumberedKind::SABM,
                poll_final: true,
            },
            pid: None,
            payload: Vec::new(),
        }
    }

    fn i_frame(dest: &str, src: &str, ns: u8, nr: u8, pf: bool, payload: &[u8]) -> Frame {
        Frame {
            addresses: vec![Address::new(cs(dest), true), Address::new(cs(src), false)],
            direction: Direction::Command,
            control: Control::Info { ns, nr, poll_final: pf },
            pid: Some(PID_NO_LAYER3),
            payload: payload.to_vec(),
        }
    }

    async fn setup() -> (ChannelManager, SessionManager, Callsign) {
        let cm = ChannelManager::new();
        let own = cs("NA4WX-7");
        let channel = Channel::new(1, "A", own.clone());
        cm.add_channel(channel, Box::new(MockAdapter::new())).await;
        let sm = SessionManager::new(cm.clone());
        (cm, sm, own)
    }

    #[tokio::test]
    async fn sabm_creates_session_and_sends_ua() {
        let (_cm, sm, own) = setup().await;
        let mut events = sm.subscribe();
        sm.handle_frame(1, &own, sabm("NA4WX-7", "N0CALL")).await;

        let evt = tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(evt, SessionEvent::Connected { .. }));
        assert_eq!(sm.active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn in_order_i_frame_advances_vr_and_delivers_payload() {
        let (_cm, sm, own) = setup().await;
        sm.handle_frame(1, &own, sabm("NA4WX-7", "N0CALL")).await;
        let mut events = sm.subscribe();

        sm.handle_frame(1, &own, i_frame("NA4WX-7", "N0CALL", 0, 0, false, b"Alice\r"))
            .await;

        let evt = tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .unwrap()
            .unwrap();
        match evt {
            SessionEvent::Payload { bytes, .. } => assert_eq!(bytes, b"Alice\r"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disc_with_no_session_gets_bare_dm() {
        let (cm, sm, own) = setup().await;
        let disc = Frame {
            addresses: vec![Address::new(cs("NA4WX-7"), true), Address::new(cs("N0CALL"), false)],
            direction: Direction::Command,
            control: Control::Unnumbered {
                kind: UnnumberedKind::DISC,
                poll_final: false,
            },
            pid: None,
            payload: Vec::new(),
        };
        sm.handle_frame(1, &own, disc).await;
        let metrics = cm.get_metrics().await;
        assert_eq!(metrics.tx, 1);
    }

    #[tokio::test]
    async fn send_payload_on_unknown_session_returns_false() {
        let (_cm, sm, _own) = setup().await;
        let key = SessionKey::new(1, "N0CALL");
        assert!(!sm.send_payload(&key, b"hi".to_vec()).await);
    }
}
