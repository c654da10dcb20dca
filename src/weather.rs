//! Weather Alert Repeater (C11): turns a structured alert into one or more
//! APRS bulletin frames, and suppresses loops when echoing external
//! `SAME:` bulletins back out configured digipeat channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::aprs;
use crate::callsign::Callsign;
use crate::channel::manager::{ChannelManager, FrameEvent};

const PAYLOAD_BUDGET: usize = 67;
const ECHO_SUPPRESS_TTL: Duration = Duration::from_secs(3600);
const ALLWX: &str = "ALLWX";

#[derive(Debug, Clone)]
pub struct Alert {
    pub event: String,
    pub area: String,
    pub same_codes: Vec<String>,
    pub effective: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub description: String,
    pub instruction: String,
}

/// Keyword/SAME-code to bulletin tag lookup, per §4.11.
fn select_tag(alert: &Alert) -> &'static str {
    let event = alert.event.to_ascii_lowercase();
    if event.contains("tornado") {
        "BLN2TOR"
    } else if event.contains("severe thunderstorm") || event.contains("severe") {
        "BLN3SVR"
    } else if event.contains("flood") {
        "BLN4FLD"
    } else if event.contains("emergency") || alert.same_codes.iter().any(|c| c.starts_with('9')) {
        "BLN9EMR"
    } else {
        "BLN1WX"
    }
}

/// Word-wrap `text` into chunks no longer than `budget`; hard-wraps any
/// single word that alone exceeds the budget.
fn chunk_text(text: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if word.len() > budget {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let mut rest = word;
            while rest.len() > budget {
                let (head, tail) = rest.split_at(budget);
                chunks.push(head.to_string());
                rest = tail;
            }
            current = rest.to_string();
            continue;
        }
        let candidate_len = if current.is_empty() { word.len() } else { current.len() + 1 + word.len() };
        if candidate_len > budget {
            chunks.push(std::mem::take(&mut current));
            current = word.to_string();
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

struct EchoState {
    suppressed_until: HashMap<u64, Instant>,
}

pub struct WeatherRepeater {
    channel_manager: ChannelManager,
    own_callsign: Callsign,
    digipeat_channels: Vec<u32>,
    configured_same_codes: Vec<String>,
    echo: Mutex<EchoState>,
}

impl WeatherRepeater {
    pub fn new(channel_manager: ChannelManager, own_callsign: Callsign, digipeat_channels: Vec<u32>, configured_same_codes: Vec<String>) -> Arc<Self> {
        Arc::new(WeatherRepeater {
            channel_manager,
            own_callsign,
            digipeat_channels,
            configured_same_codes,
            echo: Mutex::new(EchoState {
                suppressed_until: HashMap::new(),
            }),
        })
    }

    /// Render `alert` into the APRS bulletin frame bodies that `repeat`
    /// would broadcast: the chunked description/instruction text plus,
    /// when no chunk already carries SAME codes, a trailing `SAME:` frame.
    pub fn render(&self, alert: &Alert) -> Vec<String> {
        let tag = select_tag(alert);
        let body = format!("{} {} {}", alert.event, alert.area, alert.description).trim().to_string();
        let body = if alert.instruction.is_empty() {
            body
        } else {
            format!("{body} {}", alert.instruction)
        };
        // Reserve the `:TAG     :` envelope (9-char padded addressee plus
        // two colons) from the 67-char default APRS payload budget.
        let content_budget = PAYLOAD_BUDGET.saturating_sub(9 + 2);
        let chunks = chunk_text(&body, content_budget);
        let mut frames: Vec<String> = chunks.iter().map(|c| aprs::format_bulletin(tag, c)).collect();
        let has_same = chunks.iter().any(|c| c.contains("SAME:"));
        if !has_same && !alert.same_codes.is_empty() {
            frames.push(aprs::format_bulletin(tag, &format!("SAME:{}", alert.same_codes.join(","))));
        }
        frames
    }

    pub async fn repeat(&self, channel_id: u32, alert: &Alert) {
        for frame in self.render(alert) {
            self.channel_manager
                .send_aprs_message(channel_id, &self.own_callsign, &ALLWX.parse().unwrap(), &frame, &[])
                .await;
        }
    }

    fn extract_same_codes(payload: &str) -> Vec<String> {
        let Some(pos) = payload.find("SAME:") else {
            return Vec::new();
        };
        payload[pos + "SAME:".len()..]
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    fn hash_payload(payload: &str) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        hasher.finish()
    }

    /// Inspect an inbound frame's payload; if it carries a `SAME:` block
    /// that intersects our configured codes, re-broadcast once across the
    /// configured digipeat channels, suppressing further echoes for 1 h.
    async fn maybe_echo(&self, payload: &str) {
        let codes = Self::extract_same_codes(payload);
        if codes.is_empty() {
            return;
        }
        if !codes.iter().any(|c| self.configured_same_codes.contains(c)) {
            return;
        }
        let hash = Self::hash_payload(payload);
        {
            let mut echo = self.echo.lock().await;
            let now = Instant::now();
            echo.suppressed_until.retain(|_, until| *until > now);
            if echo.suppressed_until.contains_key(&hash) {
                return;
            }
            echo.suppressed_until.insert(hash, now + ECHO_SUPPRESS_TTL);
        }
        for &channel_id in &self.digipeat_channels {
            self.channel_manager
                .send_aprs_message(channel_id, &self.own_callsign, &ALLWX.parse().unwrap(), payload, &[])
                .await;
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        let repeater = self.clone();
        let mut frames = self.channel_manager.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = frames.recv().await {
                if let FrameEvent::Frame { parsed, .. } = event {
                    if let Ok(text) = std::str::from_utf8(&parsed.payload) {
                        repeater.maybe_echo(text).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> Alert {
        Alert {
            event: "Tornado Warning".into(),
            area: "Central County".into(),
            same_codes: vec!["012345".into(), "067890".into()],
            effective: Utc::now(),
            expires: Utc::now() + chrono::Duration::hours(1),
            description: "A tornado has been spotted near the county line moving northeast at 35 mph.".into(),
            instruction: "Take shelter immediately in a basement or interior room.".into(),
        }
    }

    fn repeater() -> Arc<WeatherRepeater> {
        WeatherRepeater::new(ChannelManager::new(), "NA4WX-7".parse().unwrap(), vec![1], vec!["012345".into()])
    }

    #[test]
    fn selects_tornado_tag() {
        let frames = repeater().render(&alert());
        assert!(frames[0].contains("BLN2TOR"));
    }

    #[test]
    fn chunks_respect_payload_budget() {
        let frames = repeater().render(&alert());
        for f in &frames {
            assert!(f.len() <= PAYLOAD_BUDGET, "frame too long: {f} ({})", f.len());
        }
    }

    #[test]
    fn appends_same_frame_when_absent_from_chunks() {
        let frames = repeater().render(&alert());
        assert!(frames.last().unwrap().contains("SAME:012345,067890"));
    }

    #[test]
    fn hard_wraps_oversize_word() {
        let long_word = "x".repeat(100);
        let chunks = chunk_text(&long_word, 67);
        assert!(chunks.iter().all(|c| c.len() <= 67));
        assert_eq!(chunks.concat().len(), 100);
    }

    #[tokio::test]
    async fn echo_suppressed_after_first_rebroadcast() {
        let r = repeater();
        let payload = "WX bulletin SAME:012345";
        r.maybe_echo(payload).await;
        let hash = WeatherRepeater::hash_payload(payload);
        assert!(r.echo.lock().await.suppressed_until.contains_key(&hash));
    }
}
