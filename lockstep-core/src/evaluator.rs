//! The driver loop that walks a composition tree batch by batch.

use lockstep_net::Network;

use crate::{
    ResourcePool,
    producer::{ProtocolCollection, ProtocolProducer},
    protocol::EvalError,
    strategy::BatchEvaluationStrategy,
};

/// Default number of native protocols per batch.
pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Repeatedly pulls a bounded batch of ready leaf protocols from a producer
/// tree and hands it to the configured strategy. A batch is fully evaluated
/// before the next one is requested, which keeps all parties in the same
/// logical batch at the same time.
pub struct ProtocolEvaluator<S> {
    strategy: S,
    batch_size: usize,
}

impl<S> ProtocolEvaluator<S> {
    /// Create an evaluator with the [`DEFAULT_BATCH_SIZE`].
    pub fn new(strategy: S) -> Self {
        Self {
            strategy,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Create an evaluator with a custom batch size.
    pub fn with_batch_size(strategy: S, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self {
            strategy,
            batch_size,
        }
    }

    /// Evaluate the whole producer tree to completion.
    pub fn eval<N: Network>(
        &self,
        producer: &mut dyn ProtocolProducer<N>,
        pool: &mut ResourcePool,
        net: &N,
    ) -> Result<(), EvalError>
    where
        S: BatchEvaluationStrategy<N>,
    {
        let mut batches = 0usize;
        while !producer.is_finished() {
            let mut batch = ProtocolCollection::with_capacity(self.batch_size);
            producer.fill_batch(&mut batch);
            if batch.is_empty() {
                // an unfinished producer that yields nothing would spin us
                // forever; treat it as a bug and stop
                tracing::warn!("unfinished producer yielded an empty batch, stopping evaluation");
                break;
            }
            tracing::trace!("evaluating batch {batches} with {} protocol(s)", batch.len());
            self.strategy.process_batch(batch, pool, net)?;
            batches += 1;
        }
        tracing::debug!("party {}: evaluation finished after {batches} batch(es)", pool.my_id());
        Ok(())
    }
}
