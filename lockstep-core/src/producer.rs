//! Composition of native protocols into sequential/parallel trees.
//!
//! A producer tree is walked batch by batch: the evaluator repeatedly asks
//! the root producer to fill a bounded [`ProtocolCollection`] with ready leaf
//! protocols and fully evaluates that batch before asking again. Sequencing
//! falls out of that contract: whatever a producer hands out in one fill is
//! done by the time of the next fill.

use std::collections::VecDeque;

use lockstep_net::Network;

use crate::protocol::NativeProtocol;

/// A boxed native protocol, as stored in batches.
pub type BoxedProtocol<N> = Box<dyn NativeProtocol<N>>;

/// A capacity-bounded batch of native protocols ready to evaluate.
pub struct ProtocolCollection<N: Network> {
    capacity: usize,
    protocols: Vec<BoxedProtocol<N>>,
}

impl<N: Network> ProtocolCollection<N> {
    /// Create an empty collection holding at most `capacity` protocols.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            protocols: Vec::new(),
        }
    }

    /// True while the collection can take another protocol.
    pub fn has_capacity(&self) -> bool {
        self.protocols.len() < self.capacity
    }

    /// Add a protocol. Capacity is the producer's contract; pushing past it
    /// is a bug in the producer.
    ///
    /// # Panics
    /// Panics if the collection is already at capacity.
    pub fn push(&mut self, protocol: BoxedProtocol<N>) {
        assert!(self.has_capacity(), "batch is at capacity");
        self.protocols.push(protocol);
    }

    /// The number of protocols currently in the batch.
    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    /// True if the batch holds no protocols.
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Consume the batch.
    pub fn into_protocols(self) -> Vec<BoxedProtocol<N>> {
        self.protocols
    }
}

/// Produces ready batches by walking a protocol composition tree.
pub trait ProtocolProducer<N: Network>: Send {
    /// Move ready protocols into `batch`, bounded by the batch's remaining
    /// capacity.
    fn fill_batch(&mut self, batch: &mut ProtocolCollection<N>);

    /// True once this producer will never yield another protocol.
    fn is_finished(&self) -> bool;
}

/// A producer wrapping a single native protocol, handed out once.
pub struct SingleProducer<N: Network> {
    protocol: Option<BoxedProtocol<N>>,
}

impl<N: Network> SingleProducer<N> {
    /// Wrap `protocol`.
    pub fn new(protocol: impl NativeProtocol<N> + 'static) -> Self {
        Self {
            protocol: Some(Box::new(protocol)),
        }
    }

    /// Wrap an already boxed protocol.
    pub fn from_boxed(protocol: BoxedProtocol<N>) -> Self {
        Self {
            protocol: Some(protocol),
        }
    }
}

impl<N: Network> ProtocolProducer<N> for SingleProducer<N> {
    fn fill_batch(&mut self, batch: &mut ProtocolCollection<N>) {
        if batch.has_capacity() {
            if let Some(protocol) = self.protocol.take() {
                batch.push(protocol);
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.protocol.is_none()
    }
}

/// Runs its children strictly one after another: a child only starts
/// producing once everything the previous child produced has been fully
/// evaluated.
pub struct SequentialProducer<N: Network> {
    children: VecDeque<Box<dyn ProtocolProducer<N>>>,
}

impl<N: Network> Default for SequentialProducer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Network> SequentialProducer<N> {
    /// Create an empty sequence.
    pub fn new() -> Self {
        Self {
            children: VecDeque::new(),
        }
    }

    /// Append a child producer to the sequence.
    pub fn push(&mut self, child: impl ProtocolProducer<N> + 'static) {
        self.children.push_back(Box::new(child));
    }

    /// Append a single protocol to the sequence.
    pub fn push_protocol(&mut self, protocol: impl NativeProtocol<N> + 'static)
    where
        N: 'static,
    {
        self.push(SingleProducer::new(protocol));
    }
}

impl<N: Network> ProtocolProducer<N> for SequentialProducer<N> {
    fn fill_batch(&mut self, batch: &mut ProtocolCollection<N>) {
        while let Some(current) = self.children.front_mut() {
            if current.is_finished() {
                self.children.pop_front();
                continue;
            }
            // draw from one child only, so a later child never shares a
            // batch with (and thus never runs interleaved with) this one
            current.fill_batch(batch);
            return;
        }
    }

    fn is_finished(&self) -> bool {
        self.children.iter().all(|c| c.is_finished())
    }
}

/// Exposes all children to the evaluator at once; each child advances
/// through its own rounds independently, sharing only the ambient round
/// counter of the driving strategy.
pub struct ParallelProducer<N: Network> {
    children: Vec<Box<dyn ProtocolProducer<N>>>,
}

impl<N: Network> Default for ParallelProducer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Network> ParallelProducer<N> {
    /// Create an empty parallel composition.
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
        }
    }

    /// Add a child producer.
    pub fn push(&mut self, child: impl ProtocolProducer<N> + 'static) {
        self.children.push(Box::new(child));
    }

    /// Add a single protocol.
    pub fn push_protocol(&mut self, protocol: impl NativeProtocol<N> + 'static)
    where
        N: 'static,
    {
        self.push(SingleProducer::new(protocol));
    }
}

impl<N: Network> ProtocolProducer<N> for ParallelProducer<N> {
    fn fill_batch(&mut self, batch: &mut ProtocolCollection<N>) {
        for child in &mut self.children {
            if !batch.has_capacity() {
                break;
            }
            if !child.is_finished() {
                child.fill_batch(batch);
            }
        }
        self.children.retain(|c| !c.is_finished());
    }

    fn is_finished(&self) -> bool {
        self.children.iter().all(|c| c.is_finished())
    }
}
