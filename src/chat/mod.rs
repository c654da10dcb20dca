//! Chat subsystem: rooms and rate-limiting (C8), mesh synchronization
//! (C9), and the transport contract it runs over (C10).

pub mod manager;
pub mod sync;
pub mod transport;

pub use manager::{ChatError, ChatEvent, ChatManager, ChatMessage, Room, Stats};
pub use sync::{ChatSync, SyncMetrics};
pub use transport::{LoopbackTransport, MeshPacket, MeshTransport, Priority, TransportError, TransportEvent};
