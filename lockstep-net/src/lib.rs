//! A point-to-point networking layer for round-synchronized MPC.
//!
//! Every party holds one connection pair to every other party and exchanges
//! length-prefixed byte frames over them. Messages from one sender arrive in
//! order; there is no ordering across different senders. The evaluation
//! engine built on top relies on [`Network::flush`] as its only
//! synchronization point: once `flush` returns, everything queued with
//! [`Network::send`] is on the wire.
#![warn(missing_docs)]

use std::{collections::BTreeMap, fmt, time::Duration};

pub mod config;
pub mod local;
pub mod tcp;

mod error;

pub use error::NetworkError;

/// Default total timeout for connection setup and blocking receives.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Default max length (in bytes) of a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1_000_000_000;

/// Framed, party-addressed message delivery between the parties of a
/// computation.
///
/// Party ids are dense `1..=num_parties`. Sending to one's own id is a local
/// enqueue and never touches the wire.
pub trait Network: Send + Sync {
    /// The id of this party.
    fn id(&self) -> usize;

    /// The number of parties in the network, including this one.
    fn num_parties(&self) -> usize;

    /// Queue `data` for delivery to party `to` and return immediately.
    ///
    /// A write failure surfaces on a later [`Network::flush`] or
    /// [`Network::recv`], not here.
    fn send(&self, to: usize, data: &[u8]) -> Result<(), NetworkError>;

    /// Dequeue the next message from party `from`, blocking until one
    /// arrives, the receive timeout elapses or the network is closed.
    fn recv(&self, from: usize) -> Result<Vec<u8>, NetworkError>;

    /// Block until every payload previously accepted by [`Network::send`]
    /// has been written out.
    fn flush(&self) -> Result<(), NetworkError>;

    /// Shut the network down. Queued sends get a bounded grace period to
    /// drain, then all channels are closed and blocked receivers are woken.
    /// Safe to call more than once.
    fn close(&self);

    /// Returns the per-party sent/received byte counters.
    fn connection_stats(&self) -> ConnectionStats;
}

/// Sent/received bytes per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// The id of the party the stats belong to.
    pub my_id: usize,
    /// Maps party id to (sent, received) bytes.
    pub stats: BTreeMap<usize, (usize, usize)>,
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, (sent, recv)) in &self.stats {
            writeln!(
                f,
                "party {} <-> party {id}: sent {sent} bytes, received {recv} bytes",
                self.my_id
            )?;
        }
        Ok(())
    }
}
