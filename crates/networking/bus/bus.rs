//! The quarry broadcast bus.
//!
//! One datagram carries one JSON [`Envelope`] on the `auto_mine/2` protocol.
//! Everything is broadcast; directed messages set [`Envelope::to`] and rely
//! on receivers filtering. The medium guarantees sender-FIFO ordering, and
//! the receive path hardens that with per-sender sequence dedupe.
//!
//! Two engines share the API: UDP broadcast for real fleets, and an
//! in-process hub for tests and simulated fleets.

pub mod codec;
pub mod error;
pub mod membership;
pub mod message;
pub mod net;

pub use codec::BusCodec;
pub use error::BusError;
pub use membership::{Membership, PeerRecord};
pub use message::{Envelope, Message, PROTOCOL};
pub use net::{Bus, BusHub, RESTART_SEQ_SKIP, SeqFilter};
