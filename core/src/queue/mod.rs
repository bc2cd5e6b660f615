//! Producer/consumer decoupling.
//!
//! A [`DecouplingQueue`] lets a hot producer path (packet or PDU handlers) hand work off to one
//! dedicated dispatcher thread without blocking. The ring buffer underneath is abstracted by
//! [`BoundedRingBuffer`].

mod decoupling;
mod ring;

pub use decoupling::{
    DecouplingQueue, DecouplingQueueBuilder, PushError, QueueError, QueueStats,
    QueueStatsSnapshot,
};
pub use ring::{BoundedRingBuffer, Ring};
