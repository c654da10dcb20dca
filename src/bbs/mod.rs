//! BBS FSM and Store (C6): profile capture, command grammar, and the
//! persisted message base layered on the AX.25 Session Layer.

pub mod fsm;
pub mod store;
pub mod users;

pub use fsm::BbsFsm;
pub use store::{BbsMessage, BbsStore, Category, NewMessage, Priority};
pub use users::{BbsUsers, UserProfile};
