use std::{io, net::SocketAddr};

use thiserror::Error;

/// Errors raised by network construction and steady-state IO.
///
/// Construction-time failures ([`NetworkError::Bind`],
/// [`NetworkError::ConnectTimeout`], [`NetworkError::Handshake`]) abort
/// startup and release everything opened so far. Steady-state failures abort
/// the in-progress computation; the transport never retries on its own.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Could not bind the listening socket.
    #[error("binding listener on {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Could not resolve a party's address.
    #[error("could not resolve address {0}")]
    Resolve(String),

    /// Outbound connection attempts to a party were exhausted.
    #[error("connecting to party {party} at {addr}: no success after {attempts} attempt(s)")]
    ConnectTimeout {
        /// The party we tried to reach.
        party: usize,
        /// The address we tried to reach it at.
        addr: SocketAddr,
        /// How many attempts were made.
        attempts: usize,
    },

    /// The inbound side of the identity handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// IO failure on an established channel.
    #[error("io failure on channel with party {party}: {source}")]
    Io {
        /// The party the channel belongs to.
        party: usize,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The network was closed while the operation was in flight.
    #[error("network is closed")]
    Closed,

    /// No data arrived within the receive timeout.
    #[error("timed out waiting for data from party {0}")]
    RecvTimeout(usize),

    /// A party id outside the configured network.
    #[error("unknown party id {0}")]
    UnknownParty(usize),

    /// A frame larger than the configured limit.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge {
        /// The offending frame length.
        len: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The network configuration is inconsistent.
    #[error("invalid network config: {0}")]
    InvalidConfig(String),
}
