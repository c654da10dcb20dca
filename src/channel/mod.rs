//! Frame plane: channel adapters (C3) and the Channel Manager (C4).

pub mod adapter;
pub mod manager;

pub use adapter::{AdapterError, AdapterEvent, AgwAdapter, ChannelAdapter, KissTcpAdapter, MockAdapter, SerialAdapter};
pub use manager::{Channel, ChannelManager, ChannelStatus, FrameEvent, Metrics, Role, RouteTarget};
