//! Channel Manager (C4): owns channels, the dedup cache, path servicing and
//! route fan-out. The center of the frame plane.
//!
//! Concurrency follows §5: state mutation is serialized behind a single
//! async mutex (the "single ingress queue"), but the lock is never held
//! across an `.await` on adapter I/O -- callers snapshot what they need,
//! drop the lock, then hand bytes to a channel's dedicated outbound queue
//! (itself a single-consumer task, which gives FIFO per-channel ordering
//! while other channels proceed independently).

use std::collections::{hash_map::DefaultHasher, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::ax25::{self, Address, Direction, Frame, UnnumberedKind};
use crate::callsign::Callsign;
use crate::channel::adapter::{AdapterEvent, ChannelAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    FillIn,
    Wide,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelStatus {
    pub connected: bool,
    pub last_error: Option<String>,
}

/// Static configuration + runtime status for one channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub role: Role,
    pub max_wide_n: u8,
    pub append_digi_callsign: bool,
    pub id_on_repeat: bool,
    pub enabled: bool,
    pub own_callsign: Callsign,
    pub explicit_digis: Vec<Callsign>,
    pub status: ChannelStatus,
}

impl Channel {
    pub fn new(id: u32, name: impl Into<String>, own_callsign: Callsign) -> Self {
        Channel {
            id,
            name: name.into(),
            role: Role::Wide,
            max_wide_n: 2,
            append_digi_callsign: false,
            id_on_repeat: false,
            enabled: true,
            own_callsign,
            explicit_digis: Vec::new(),
            status: ChannelStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    Channel(u32),
    IGate,
}

/// Events the manager fans out to local consumers (BBS, alerter, weather
/// repeater, chat sync, ...) via a broadcast channel -- the "explicit
/// multicast queue" called for by the redesign note in spec §9.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// A frame was received and accepted (not a duplicate).
    Frame {
        channel: u32,
        raw: Vec<u8>,
        parsed: Arc<Frame>,
    },
    /// A frame was sent out on a channel (direct send or digipeat fan-out).
    Tx { channel: u32, raw: Vec<u8> },
    /// A frame was forwarded to the external IGate collaborator.
    Igate { raw: Vec<u8> },
    /// A frame failed to parse; kept for diagnostics only.
    Raw { channel: u32, raw: Vec<u8> },
    /// An adapter reported a transport error.
    AdapterError { channel: u32, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub rx: u64,
    pub tx: u64,
    pub dedup_drop: u64,
    pub serviced_wide_blocked: u64,
    pub max_wide_blocked: u64,
    pub fill_in_blocked: u64,
    pub digipeats: u64,
    pub unique_stations: u64,
}

const RECENT_FRAMES_CAPACITY: usize = 200;
const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_SEEN_ENTRIES: usize = 10_000;

struct DedupEntry {
    expires_at: Instant,
    source: Callsign,
}

struct DedupCache {
    entries: HashMap<u64, DedupEntry>,
    insertion_order: VecDeque<u64>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    fn new() -> Self {
        DedupCache {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            ttl: DEFAULT_SEEN_TTL,
            max_entries: DEFAULT_MAX_SEEN_ENTRIES,
        }
    }

    fn fingerprint(src: &Callsign, dest: &Callsign, payload: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        src.to_string().hash(&mut hasher);
        dest.to_string().hash(&mut hasher);
        payload.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns `true` if this fingerprint is a live duplicate (caller should
    /// drop the frame); otherwise records it and returns `false`.
    fn check_and_insert(&mut self, fingerprint: u64, source: Callsign, now: Instant) -> bool {
        if let Some(entry) = self.entries.get(&fingerprint) {
            if entry.expires_at > now {
                return true;
            }
        }
        self.entries.insert(
            fingerprint,
            DedupEntry {
                expires_at: now + self.ttl,
                source,
            },
        );
        self.insertion_order.push_back(fingerprint);
        self.evict_if_needed(now);
        false
    }

    fn evict_if_needed(&mut self, now: Instant) {
        self.sweep_expired(now);
        while self.entries.len() > self.max_entries {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn sweep_expired(&mut self, now: Instant) {
        self.entries.retain(|_, v| v.expires_at > now);
        self.insertion_order
            .retain(|fp| self.entries.contains_key(fp));
    }

    fn unique_stations(&self) -> u64 {
        self.entries
            .values()
            .map(|e| &e.source)
            .collect::<HashSet<_>>()
            .len() as u64
    }
}

struct ChannelEntry {
    config: Channel,
    outbound_tx: mpsc::Sender<Vec<u8>>,
}

pub struct ManagerInner {
    channels: HashMap<u32, ChannelEntry>,
    routes: HashSet<(u32, RouteTarget)>,
    dedup: DedupCache,
    recent_frames: VecDeque<(u32, Vec<u8>)>,
    metrics: Metrics,
}

/// Cloneable handle to a running Channel Manager. All mutation goes through
/// `&self` methods that lock the shared inner state only for the duration of
/// the computation, never across adapter I/O.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Mutex<ManagerInner>>,
    events_tx: broadcast::Sender<FrameEvent>,
}

impl ChannelManager {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        ChannelManager {
            inner: Arc::new(Mutex::new(ManagerInner {
                channels: HashMap::new(),
                routes: HashSet::new(),
                dedup: DedupCache::new(),
                recent_frames: VecDeque::with_capacity(RECENT_FRAMES_CAPACITY),
                metrics: Metrics::default(),
            })),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: FrameEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Register a channel and spawn its adapter's reader/writer tasks. The
    /// adapter is expected to already be constructed (so callers can pick the
    /// concrete variant); `open()` is called here.
    pub async fn add_channel(&self, config: Channel, mut adapter: Box<dyn ChannelAdapter>) {
        let id = config.id;
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);

        {
            let mut inner = self.inner.lock().await;
            inner.channels.insert(id, ChannelEntry { config, outbound_tx });
        }

        if let Err(e) = adapter.open().await {
            log::warn!("channel {id}: open failed: {e}");
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.channels.get_mut(&id) {
                entry.config.status.last_error = Some(e.to_string());
            }
        } else {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.channels.get_mut(&id) {
                entry.config.status.connected = true;
            }
        }

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = adapter.recv() => {
                        manager.handle_adapter_event(id, event).await;
                    }
                    Some(bytes) = outbound_rx.recv() => {
                        if let Err(e) = adapter.send(&bytes).await {
                            log::warn!("channel {id}: send failed: {e}");
                            manager.note_adapter_error(id, e.to_string()).await;
                        }
                    }
                    else => break,
                }
            }
        });
    }

    pub async fn remove_channel(&self, channel_id: u32) -> bool {
        let mut inner = self.inner.lock().await;
        inner.routes.retain(|(from, to)| {
            *from != channel_id && *to != RouteTarget::Channel(channel_id)
        });
        inner.channels.remove(&channel_id).is_some()
    }

    pub async fn add_route(&self, from: u32, to: RouteTarget) {
        if to == RouteTarget::Channel(from) {
            return; // from != to invariant
        }
        let mut inner = self.inner.lock().await;
        inner.routes.insert((from, to));
    }

    pub async fn remove_route(&self, from: u32, to: RouteTarget) {
        let mut inner = self.inner.lock().await;
        inner.routes.remove(&(from, to));
    }

    pub async fn list_channels(&self) -> Vec<Channel> {
        let inner = self.inner.lock().await;
        inner.channels.values().map(|c| c.config.clone()).collect()
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.inner.lock().await.metrics.clone()
    }

    pub async fn recent_frames(&self) -> Vec<(u32, Vec<u8>)> {
        self.inner.lock().await.recent_frames.iter().cloned().collect()
    }

    pub async fn set_seen_ttl(&self, ttl: Duration) {
        self.inner.lock().await.dedup.ttl = ttl;
    }

    pub async fn set_max_seen_entries(&self, max: usize) {
        self.inner.lock().await.dedup.max_entries = max;
    }

    pub async fn cleanup_seen(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.dedup.sweep_expired(now);
        inner.metrics.unique_stations = inner.dedup.unique_stations();
    }

    /// Send a pre-built AX.25 frame's bytes on a channel. Returns `false`
    /// (never throws) if the channel is unknown, per §7's UnknownResource.
    /// The adapter owns any wire-level (KISS/AGW) framing; this queues raw
    /// AX.25 bytes onto the channel's outbound FIFO.
    pub async fn send_frame(&self, channel_id: u32, raw: Vec<u8>) -> bool {
        let tx = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.channels.get(&channel_id) else {
                return false;
            };
            let tx = entry.outbound_tx.clone();
            inner.metrics.tx += 1;
            tx
        };
        let _ = tx.send(raw.clone()).await;
        self.emit(FrameEvent::Tx {
            channel: channel_id,
            raw,
        });
        true
    }

    /// Compose and send a UI frame carrying an APRS message/bulletin payload.
    pub async fn send_aprs_message(
        &self,
        channel_id: u32,
        from: &Callsign,
        to_dest: &Callsign,
        payload: &str,
        path: &[Callsign],
    ) -> bool {
        let mut addresses = vec![
            Address::new(to_dest.clone(), false),
            Address::new(from.clone(), false),
        ];
        for p in path {
            addresses.push(Address::new(p.clone(), false));
        }
        let frame = Frame {
            addresses,
            direction: Direction::Command,
            control: ax25::Control::Unnumbered {
                kind: UnnumberedKind::UI,
                poll_final: false,
            },
            pid: Some(0xF0),
            payload: payload.as_bytes().to_vec(),
        };
        self.send_frame(channel_id, ax25::build(&frame)).await
    }

    async fn note_adapter_error(&self, channel_id: u32, message: String) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.channels.get_mut(&channel_id) {
            entry.config.status.last_error = Some(message.clone());
            entry.config.status.connected = false;
        }
        drop(inner);
        self.emit(FrameEvent::AdapterError {
            channel: channel_id,
            message,
        });
    }

    async fn handle_adapter_event(&self, channel_id: u32, event: AdapterEvent) {
        match event {
            AdapterEvent::Open => {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.channels.get_mut(&channel_id) {
                    entry.config.status.connected = true;
                    entry.config.status.last_error = None;
                }
            }
            AdapterEvent::Close => {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.channels.get_mut(&channel_id) {
                    entry.config.status.connected = false;
                }
            }
            AdapterEvent::Error(msg) => {
                self.note_adapter_error(channel_id, msg).await;
            }
            AdapterEvent::Data(bytes) => {
                // The adapter already applied whatever wire framing (KISS,
                // AGW) it speaks; `bytes` is a single raw AX.25 frame.
                self.process_inbound(channel_id, bytes).await;
            }
        }
    }

    async fn process_inbound(&self, channel_id: u32, raw: Vec<u8>) {
        let frame = match ax25::parse(&raw) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("channel {channel_id}: malformed AX.25 frame: {e}");
                self.emit(FrameEvent::Raw {
                    channel: channel_id,
                    raw,
                });
                return;
            }
        };

        let now = Instant::now();
        let fingerprint =
            DedupCache::fingerprint(&frame.src().callsign, &frame.dest().callsign, &frame.payload);
        let is_duplicate = {
            let mut inner = self.inner.lock().await;
            inner.metrics.rx += 1;
            let dup = inner
                .dedup
                .check_and_insert(fingerprint, frame.src().callsign.clone(), now);
            if dup {
                inner.metrics.dedup_drop += 1;
            } else {
                inner.metrics.unique_stations = inner.dedup.unique_stations();
                if inner.recent_frames.len() >= RECENT_FRAMES_CAPACITY {
                    inner.recent_frames.pop_front();
                }
                inner.recent_frames.push_back((channel_id, raw.clone()));
            }
            dup
        };
        if is_duplicate {
            return;
        }

        let parsed = Arc::new(frame);
        self.emit(FrameEvent::Frame {
            channel: channel_id,
            raw: raw.clone(),
            parsed: parsed.clone(),
        });

        self.forward(channel_id, &parsed).await;
    }

    async fn forward(&self, from_channel: u32, frame: &Frame) {
        let targets: Vec<RouteTarget> = {
            let inner = self.inner.lock().await;
            inner
                .routes
                .iter()
                .filter(|(f, _)| *f == from_channel)
                .map(|(_, t)| *t)
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        for target in targets {
            match target {
                RouteTarget::IGate => {
                    let mut serviced = frame.clone();
                    let source_matcher = {
                        let inner = self.inner.lock().await;
                        inner
                            .channels
                            .get(&from_channel)
                            .map(|c| c.config.explicit_digis.clone())
                    };
                    if let Some(explicit) = source_matcher {
                        let matcher = ax25::DigiMatcher {
                            explicit: &explicit,
                            accept_wide: false,
                        };
                        let _ = ax25::service_address_in_buffer(&mut serviced, &matcher);
                    }
                    self.emit(FrameEvent::Igate {
                        raw: ax25::build(&serviced),
                    });
                }
                RouteTarget::Channel(to_channel) => {
                    self.forward_to_channel(from_channel, to_channel, frame).await;
                }
            }
        }
    }

    async fn forward_to_channel(&self, from_channel: u32, to_channel: u32, frame: &Frame) {
        if frame.fully_repeated() {
            let mut inner = self.inner.lock().await;
            inner.metrics.serviced_wide_blocked += 1;
            return;
        }

        let target_config = {
            let inner = self.inner.lock().await;
            inner.channels.get(&to_channel).map(|c| c.config.clone())
        };
        let Some(target_config) = target_config else {
            return;
        };

        let mut serviced = frame.clone();
        let explicit_matcher = ax25::DigiMatcher {
            explicit: &target_config.explicit_digis,
            accept_wide: false,
        };
        let mut outcome = ax25::service_address_in_buffer(&mut serviced, &explicit_matcher);
        let mut via_explicit = outcome.is_some();

        if outcome.is_none() {
            if let Some((_, n, _)) = ax25::first_unrepeated_wide(&serviced) {
                if target_config.role == Role::FillIn && n >= 2 {
                    let mut inner = self.inner.lock().await;
                    inner.metrics.fill_in_blocked += 1;
                    log::debug!(
                        "channel {to_channel}: dropped by fill-in policy (WIDE{n} from {from_channel})"
                    );
                    return;
                }
                if n > target_config.max_wide_n {
                    let mut inner = self.inner.lock().await;
                    inner.metrics.max_wide_blocked += 1;
                    return;
                }
                let wide_matcher = ax25::DigiMatcher {
                    explicit: &[],
                    accept_wide: true,
                };
                outcome = ax25::service_address_in_buffer(&mut serviced, &wide_matcher);
                via_explicit = false;
            }
        }

        let Some(outcome) = outcome else {
            return; // nothing in the path identifies this channel
        };

        // Append-own-callsign only applies when an explicit digi slot was
        // serviced, not an ordinary WIDEn-N hop (§4.4).
        if target_config.append_digi_callsign && via_explicit && outcome.fully_repeated {
            let insert_at = 2 + outcome.slot;
            if serviced.addresses.len() < 10 {
                serviced.addresses.insert(
                    insert_at,
                    Address::new(target_config.own_callsign.clone(), true),
                );
            } else {
                log::warn!("channel {to_channel}: cannot append digi callsign, address list full");
            }
        }

        let wire = ax25::build(&serviced);
        let outbound_tx = {
            let mut inner = self.inner.lock().await;
            inner.metrics.tx += 1;
            inner.metrics.digipeats += 1;
            inner.channels.get(&to_channel).map(|c| c.outbound_tx.clone())
        };
        if let Some(tx) = outbound_tx {
            let _ = tx.send(wire.clone()).await;
            self.emit(FrameEvent::Tx {
                channel: to_channel,
                raw: wire,
            });
        }
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::{Control, UnnumberedKind};
    use crate::channel::adapter::MockAdapter;

    fn cs(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    fn ui_bytes(dest: &str, src: &str, digis: &[&str], payload: &[u8]) -> Vec<u8> {
        let mut addresses = vec![Address::new(cs(dest), false), Address::new(cs(src), false)];
        for d in digis {
            addresses.push(Address::new(cs(d), false));
        }
        let frame = Frame {
            addresses,
            direction: Direction::Command,
            control: Control::Unnumbered {
                kind: UnnumberedKind::UI,
                poll_final: false,
            },
            pid: Some(0xF0),
            payload: payload.to_vec(),
        };
        ax25::build(&frame)
    }

    #[tokio::test]
    async fn duplicate_frame_is_deduped() {
        let manager = ChannelManager::new();
        let channel = Channel::new(1, "A", cs("DIGI1"));
        manager.add_channel(channel, Box::new(MockAdapter::new())).await;

        let mut rx = manager.subscribe();
        let raw = ui_bytes("DEST", "SRC", &[], b"Hello");

        // Feed the same bytes twice directly through the internal pipeline via
        // process_inbound to avoid depending on adapter wiring timing in tests.
        manager.process_inbound(1, raw.clone()).await;
        manager.process_inbound(1, raw.clone()).await;

        let evt = rx.try_recv().unwrap();
        match evt {
            FrameEvent::Frame { parsed, .. } => {
                assert_eq!(parsed.addresses[0].callsign.base(), "DEST");
                assert_eq!(parsed.addresses[1].callsign.base(), "SRC");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "second identical frame must be deduped");

        let metrics = manager.get_metrics().await;
        assert_eq!(metrics.dedup_drop, 1);
    }

    #[tokio::test]
    async fn wide2_2_digipeat_decrements_and_blocks_third_hop() {
        let manager = ChannelManager::new();
        let a = Channel::new(1, "A", cs("DIGI1"));
        let mut b = Channel::new(2, "B", cs("DIGI2"));
        b.role = Role::Wide;
        b.max_wide_n = 2;

        manager.add_channel(a, Box::new(MockAdapter::new())).await;
        manager.add_channel(b, Box::new(MockAdapter::new())).await;
        manager.add_route(1, RouteTarget::Channel(2)).await;

        let raw = ui_bytes("APRS", "N0CALL", &["WIDE2-2"], b"hi");
        manager.process_inbound(1, raw).await;

        let metrics = manager.get_metrics().await;
        assert_eq!(metrics.tx, 1);
        assert_eq!(metrics.digipeats, 1);
        assert_eq!(metrics.max_wide_blocked, 0);
    }

    #[tokio::test]
    async fn append_digi_callsign_not_applied_for_wide_fallback() {
        let manager = ChannelManager::new();
        let a = Channel::new(1, "A", cs("DIGI1"));
        let mut b = Channel::new(2, "B", cs("DIGI2"));
        b.role = Role::Wide;
        b.max_wide_n = 2;
        b.append_digi_callsign = true;

        manager.add_channel(a, Box::new(MockAdapter::new())).await;
        manager.add_channel(b, Box::new(MockAdapter::new())).await;
        manager.add_route(1, RouteTarget::Channel(2)).await;

        let mut rx = manager.subscribe();
        let raw = ui_bytes("APRS", "N0CALL", &["WIDE2-2"], b"hi");
        manager.process_inbound(1, raw).await;

        let _frame_evt = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            FrameEvent::Tx { raw, .. } => {
                let parsed = ax25::parse(&raw).unwrap();
                assert_eq!(parsed.addresses.len(), 3, "no digi should be appended for a WIDE fallback hop");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_digi_callsign_applied_for_explicit_digi() {
        let manager = ChannelManager::new();
        let a = Channel::new(1, "A", cs("DIGI1"));
        let mut b = Channel::new(2, "B", cs("DIGI2"));
        b.explicit_digis = vec![cs("W1AW-1")];
        b.append_digi_callsign = true;

        manager.add_channel(a, Box::new(MockAdapter::new())).await;
        manager.add_channel(b, Box::new(MockAdapter::new())).await;
        manager.add_route(1, RouteTarget::Channel(2)).await;

        let mut rx = manager.subscribe();
        let raw = ui_bytes("APRS", "N0CALL", &["W1AW-1"], b"hi");
        manager.process_inbound(1, raw).await;

        let _frame_evt = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            FrameEvent::Tx { raw, .. } => {
                let parsed = ax25::parse(&raw).unwrap();
                assert_eq!(parsed.addresses.len(), 4, "own callsign should be appended after an explicit-digi hop");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fill_in_channel_blocks_wide2_2() {
        let manager = ChannelManager::new();
        let a = Channel::new(1, "A", cs("DIGI1"));
        let mut b = Channel::new(2, "B", cs("DIGI2"));
        b.role = Role::FillIn;

        manager.add_channel(a, Box::new(MockAdapter::new())).await;
        manager.add_channel(b, Box::new(MockAdapter::new())).await;
        manager.add_route(1, RouteTarget::Channel(2)).await;

        let raw = ui_bytes("APRS", "N0CALL", &["WIDE2-2"], b"hi");
        manager.process_inbound(1, raw).await;

        let metrics = manager.get_metrics().await;
        assert_eq!(metrics.tx, 0);
        assert_eq!(metrics.fill_in_blocked, 1);
    }

    #[tokio::test]
    async fn unknown_channel_send_returns_false() {
        let manager = ChannelManager::new();
        assert!(!manager.send_frame(999, vec![1, 2, 3]).await);
    }

    #[tokio::test]
    async fn routes_require_distinct_endpoints() {
        let manager = ChannelManager::new();
        manager.add_route(1, RouteTarget::Channel(1)).await;
        let inner = manager.inner.lock().await;
        assert!(inner.routes.is_empty());
    }
}
