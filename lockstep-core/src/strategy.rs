//! Batch evaluation strategies.
//!
//! A strategy drives one batch of native protocols through successive rounds
//! and flushes the network at the synchronization points. The flush is the
//! correctness-critical step: every send queued for the current round must
//! be on the wire before any protocol in the batch attempts the matching
//! receive.

use lockstep_net::Network;

use crate::{
    ResourcePool,
    producer::{BoxedProtocol, ProtocolCollection},
    protocol::{EvalError, EvaluationStatus},
};

/// Drives one batch of native protocols to completion.
pub trait BatchEvaluationStrategy<N: Network> {
    /// Evaluate every protocol in `batch` through all of its rounds. The
    /// batch is fully done when this returns.
    fn process_batch(
        &self,
        batch: ProtocolCollection<N>,
        pool: &mut ResourcePool,
        net: &N,
    ) -> Result<(), EvalError>;
}

/// Evaluates the protocols of a batch one at a time, flushing the network
/// after every single round. Simple and easy to follow in a log, but pays
/// one network round-trip per protocol round.
pub struct SequentialStrategy;

impl<N: Network> BatchEvaluationStrategy<N> for SequentialStrategy {
    fn process_batch(
        &self,
        batch: ProtocolCollection<N>,
        pool: &mut ResourcePool,
        net: &N,
    ) -> Result<(), EvalError> {
        for mut protocol in batch.into_protocols() {
            let mut round = 0;
            loop {
                let status = protocol.evaluate(round, pool, net)?;
                net.flush()?;
                if status == EvaluationStatus::IsDone {
                    break;
                }
                round += 1;
            }
        }
        Ok(())
    }
}

/// Evaluates every live protocol of the batch once per round and flushes
/// once per round, amortizing the synchronization cost over the whole batch.
///
/// This shares one flush point across the batch, so it relies on every
/// protocol honoring the "send this round, receive in a later round"
/// discipline uniformly.
pub struct BatchedStrategy;

impl<N: Network> BatchEvaluationStrategy<N> for BatchedStrategy {
    fn process_batch(
        &self,
        batch: ProtocolCollection<N>,
        pool: &mut ResourcePool,
        net: &N,
    ) -> Result<(), EvalError> {
        let mut live = batch.into_protocols();
        let mut round = 0;
        while !live.is_empty() {
            live = advance_round(live, round, pool, net)?;
            net.flush()?;
            round += 1;
        }
        tracing::trace!("batch done after {round} round(s)");
        Ok(())
    }
}

/// Runs two independent batches in lock-step against one network, e.g. the
/// same logical schedule over two different moduli with their own resource
/// pools. Both halves advance by one round per iteration and share a single
/// flush, and the call returns only once both are exhausted, so callers can
/// combine each pair's outputs afterwards.
pub struct DualBatchedStrategy;

impl DualBatchedStrategy {
    /// Evaluate `first` and `second` in lock-step until both are done.
    pub fn process_batches<N: Network>(
        &self,
        first: ProtocolCollection<N>,
        first_pool: &mut ResourcePool,
        second: ProtocolCollection<N>,
        second_pool: &mut ResourcePool,
        net: &N,
    ) -> Result<(), EvalError> {
        let mut live_first = first.into_protocols();
        let mut live_second = second.into_protocols();
        let mut round = 0;
        while !(live_first.is_empty() && live_second.is_empty()) {
            live_first = advance_round(live_first, round, first_pool, net)?;
            live_second = advance_round(live_second, round, second_pool, net)?;
            net.flush()?;
            round += 1;
        }
        tracing::trace!("dual batch done after {round} round(s)");
        Ok(())
    }
}

/// Evaluate every protocol once at `round` and return the ones that want
/// more rounds.
fn advance_round<N: Network>(
    protocols: Vec<BoxedProtocol<N>>,
    round: usize,
    pool: &mut ResourcePool,
    net: &N,
) -> Result<Vec<BoxedProtocol<N>>, EvalError> {
    let mut live = Vec::with_capacity(protocols.len());
    for mut protocol in protocols {
        match protocol.evaluate(round, pool, net)? {
            EvaluationStatus::HasMoreRounds => live.push(protocol),
            EvaluationStatus::IsDone => {}
        }
    }
    Ok(live)
}
