//! The atomic multi-round unit of secure computation.

use std::sync::Arc;

use lockstep_net::{Network, NetworkError};
use parking_lot::Mutex;

use crate::ResourcePool;

/// Progress report of one evaluation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStatus {
    /// The protocol wants to be evaluated again at the next round, after the
    /// network has been flushed.
    HasMoreRounds,
    /// The protocol is complete. Evaluating it again is a caller error.
    IsDone,
}

/// Errors raised while evaluating protocols.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// A protocol was evaluated again after reporting
    /// [`EvaluationStatus::IsDone`]. Always a programmer error in the
    /// composition or strategy layer, never ignored.
    #[error("protocol evaluated at round {round} after reporting completion")]
    AlreadyDone {
        /// The round of the offending call.
        round: usize,
    },
    /// The transport failed underneath the protocol.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// A protocol-suite level failure, e.g. a malformed message from a peer.
    #[error("protocol failure: {0}")]
    Protocol(String),
}

/// A resumable multi-round state machine evaluated against the resource pool
/// and the network.
///
/// `evaluate` is called with `round = 0, 1, 2, …` in order. A protocol that
/// returns [`EvaluationStatus::HasMoreRounds`] is called again with the next
/// round number once the network has been flushed. The asynchronous
/// [`Network::send`] gives no completion signal other than that flush, so a
/// protocol must issue its sends in one round and consume the matching
/// [`Network::recv`] results in a later round; receiving in the same round
/// would deadlock against a peer whose send has not been transmitted yet.
///
/// Implementations keep all intermediate state as instance data, ideally as
/// an explicit state enum, since there is no implicit continuation between
/// calls.
pub trait NativeProtocol<N: Network>: Send {
    /// Evaluate one round.
    fn evaluate(
        &mut self,
        round: usize,
        pool: &mut ResourcePool,
        net: &N,
    ) -> Result<EvaluationStatus, EvalError>;
}

/// A handle on a protocol's result that stays with the caller after the
/// protocol itself moves into the evaluator.
pub struct SharedOutput<T>(Arc<Mutex<Option<T>>>);

impl<T> SharedOutput<T> {
    /// Create an empty output cell.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// Store the result, replacing any previous value.
    pub fn set(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    /// Take the result out of the cell, if the protocol has produced it.
    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }
}

impl<T: Clone> SharedOutput<T> {
    /// Return a copy of the result, if the protocol has produced it.
    pub fn get(&self) -> Option<T> {
        self.0.lock().clone()
    }
}

impl<T> Clone for SharedOutput<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for SharedOutput<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SharedOutput<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedOutput").finish_non_exhaustive()
    }
}
