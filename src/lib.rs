//! sesstrans: the session layer of a multiplexed reliable transport.
//!
//! A [`Session`] is a logical, bidirectional, ordered byte stream carried
//! over a shared pool of underlying connections. The session layer imposes
//! in-order, exactly-once delivery on top of a lossy, reordering packet
//! substrate, coordinates half-close and abort symmetrically across both
//! peers, and exchanges liveness and throughput telemetry through a periodic
//! INFO packet.
//!
//! The connection pool that physically ships bytes is an external
//! collaborator: it hands a [`PoolHandle`] to [`Session::new`] and delivers
//! inbound packet bodies through [`Session::incoming_sender`]. The
//! application consumer reads ordered [`Message`] values from
//! [`Session::messages`] until the final [`StateCode::Stop`].

// Core types
pub mod config;
pub mod error;
pub mod message;
pub mod packet;
pub mod pool;
pub mod state;

// Session internals
pub mod session;

pub(crate) mod delivery;
pub(crate) mod reorder;

/// Identifier of one session within the pool.
pub type SessionId = u64;
/// Monotonic packet counter within one direction of one session.
pub type Serial = u32;

pub use config::SessionConfig;
pub use error::SessionError;
pub use message::Message;
pub use packet::{InfoPayload, Packet, PacketError};
pub use pool::{PoolHandle, SendTag, ToSend};
pub use session::{Session, SessionStats};
pub use state::{StateCode, StreamState};

pub type Result<T> = std::result::Result<T, SessionError>;
