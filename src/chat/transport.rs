//! Mesh Transport contract (C10): the interface Chat Sync talks to. The
//! actual multi-transport (AX.25 + IP) implementation lives outside this
//! crate; this module only pins down the shape the CORE depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::callsign::Callsign;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshPacket {
    pub kind: String,
    pub data: Vec<u8>,
    pub priority: Priority,
    pub ttl: u8,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Data(MeshPacket),
    NeighborUpdate { callsign: Callsign, info: String },
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Unavailable,
    BroadcastFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Unavailable => write!(f, "mesh transport unavailable"),
            TransportError::BroadcastFailed(reason) => write!(f, "mesh broadcast failed: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Opaque service the CORE consumes. Implementations are external to this
/// crate; a loopback stand-in is provided for tests.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn broadcast(&self, packet: MeshPacket) -> Result<(), TransportError>;
    async fn send(&self, destination: &Callsign, bytes: Vec<u8>, priority: Priority) -> Result<(), TransportError>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Loopback transport for tests and single-node deployments: everything
/// broadcast is immediately delivered back as a `Data` event.
pub struct LoopbackTransport {
    events_tx: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        LoopbackTransport { events_tx }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshTransport for LoopbackTransport {
    async fn broadcast(&self, packet: MeshPacket) -> Result<(), TransportError> {
        let _ = self.events_tx.send(TransportEvent::Data(packet));
        Ok(())
    }

    async fn send(&self, _destination: &Callsign, bytes: Vec<u8>, priority: Priority) -> Result<(), TransportError> {
        let _ = self.events_tx.send(TransportEvent::Data(MeshPacket {
            kind: "unicast".into(),
            data: bytes,
            priority,
            ttl: 1,
        }));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_delivers_broadcast_as_data_event() {
        let transport = LoopbackTransport::new();
        let mut rx = transport.subscribe();
        transport
            .broadcast(MeshPacket {
                kind: "chat-message".into(),
                data: b"hi".to_vec(),
                priority: Priority::High,
                ttl: 5,
            })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Data(p) => assert_eq!(p.kind, "chat-message"),
            _ => panic!("expected data event"),
        }
    }
}
