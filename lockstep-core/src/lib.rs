//! Round-synchronized evaluation engine for secret-sharing MPC protocols.
//!
//! Applications compose [`NativeProtocol`]s into trees of sequential and
//! parallel [`ProtocolProducer`]s. The [`ProtocolEvaluator`] walks the tree
//! batch by batch and hands each batch to a [`BatchEvaluationStrategy`],
//! which drives every protocol in the batch through its rounds and flushes
//! the network between rounds. Because every party walks an identical tree
//! deterministically, all parties sit in the same logical round at the same
//! time even though the transport gives no cross-peer ordering guarantee.
#![warn(missing_docs)]

pub mod evaluator;
pub mod pool;
pub mod producer;
pub mod protocol;
pub mod strategy;

pub use evaluator::{DEFAULT_BATCH_SIZE, ProtocolEvaluator};
pub use pool::ResourcePool;
pub use producer::{
    BoxedProtocol, ParallelProducer, ProtocolCollection, ProtocolProducer, SequentialProducer,
    SingleProducer,
};
pub use protocol::{EvalError, EvaluationStatus, NativeProtocol, SharedOutput};
pub use strategy::{
    BatchEvaluationStrategy, BatchedStrategy, DualBatchedStrategy, SequentialStrategy,
};

pub(crate) type RngType = rand_chacha::ChaCha12Rng;
