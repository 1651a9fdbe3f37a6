use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use itertools::izip;
use lockstep_core::{
    BatchEvaluationStrategy, BatchedStrategy, DualBatchedStrategy, EvalError, EvaluationStatus,
    NativeProtocol, ParallelProducer, ProtocolCollection, ProtocolEvaluator, ProtocolProducer,
    ResourcePool, SequentialProducer, SequentialStrategy, SharedOutput, SingleProducer,
};
use lockstep_net::{ConnectionStats, Network, NetworkError, local::LocalNetwork};
use parking_lot::Mutex;

/// A network stub that only counts flushes; the scripted protocols below
/// never touch the wire.
struct CountingNetwork {
    flushes: AtomicUsize,
}

impl CountingNetwork {
    fn new() -> Self {
        Self {
            flushes: AtomicUsize::new(0),
        }
    }

    fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Network for CountingNetwork {
    fn id(&self) -> usize {
        1
    }

    fn num_parties(&self) -> usize {
        1
    }

    fn send(&self, _to: usize, _data: &[u8]) -> Result<(), NetworkError> {
        Ok(())
    }

    fn recv(&self, _from: usize) -> Result<Vec<u8>, NetworkError> {
        panic!("scripted protocols do not receive")
    }

    fn flush(&self) -> Result<(), NetworkError> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {}

    fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            my_id: 1,
            stats: Default::default(),
        }
    }
}

type Log = Arc<Mutex<Vec<String>>>;

enum ScriptState {
    InProgress { next_round: usize },
    Done,
}

/// Runs for a fixed number of rounds and records every evaluation.
struct ScriptedProtocol {
    label: &'static str,
    total_rounds: usize,
    state: ScriptState,
    log: Log,
}

impl ScriptedProtocol {
    fn new(label: &'static str, total_rounds: usize, log: Log) -> Self {
        assert!(total_rounds > 0);
        Self {
            label,
            total_rounds,
            state: ScriptState::InProgress { next_round: 0 },
            log,
        }
    }
}

impl<N: Network> NativeProtocol<N> for ScriptedProtocol {
    fn evaluate(
        &mut self,
        round: usize,
        _pool: &mut ResourcePool,
        _net: &N,
    ) -> Result<EvaluationStatus, EvalError> {
        match self.state {
            ScriptState::Done => Err(EvalError::AlreadyDone { round }),
            ScriptState::InProgress { next_round } => {
                assert_eq!(round, next_round, "rounds must arrive in order");
                self.log.lock().push(format!("{}:{round}", self.label));
                if round + 1 == self.total_rounds {
                    self.state = ScriptState::Done;
                    Ok(EvaluationStatus::IsDone)
                } else {
                    self.state = ScriptState::InProgress {
                        next_round: round + 1,
                    };
                    Ok(EvaluationStatus::HasMoreRounds)
                }
            }
        }
    }
}

fn scripted_batch(
    specs: &[(&'static str, usize)],
    log: &Log,
) -> ProtocolCollection<CountingNetwork> {
    let mut batch = ProtocolCollection::with_capacity(specs.len());
    for &(label, rounds) in specs {
        batch.push(Box::new(ScriptedProtocol::new(label, rounds, log.clone())));
    }
    batch
}

#[test]
fn sequential_strategy_flushes_every_round() {
    let net = CountingNetwork::new();
    let mut pool = ResourcePool::from_seed(1, 1, 0);
    let log = Log::default();
    SequentialStrategy
        .process_batch(scripted_batch(&[("a", 2)], &log), &mut pool, &net)
        .unwrap();
    assert_eq!(net.flushes(), 2);

    // two more 2-round protocols pay 4 more flushes
    SequentialStrategy
        .process_batch(scripted_batch(&[("b", 2), ("c", 2)], &log), &mut pool, &net)
        .unwrap();
    assert_eq!(net.flushes(), 6);
}

#[test]
fn batched_strategy_amortizes_flushes() {
    let net = CountingNetwork::new();
    let mut pool = ResourcePool::from_seed(1, 1, 0);
    let log = Log::default();
    // five 2-round protocols share one flush per round: 2 flushes, not 10
    let specs: Vec<_> = [("a", 2), ("b", 2), ("c", 2), ("d", 2), ("e", 2)].into();
    BatchedStrategy
        .process_batch(scripted_batch(&specs, &log), &mut pool, &net)
        .unwrap();
    assert_eq!(net.flushes(), 2);
    assert_eq!(log.lock().len(), 10);
}

#[test]
fn batched_strategy_drops_finished_protocols() {
    let net = CountingNetwork::new();
    let mut pool = ResourcePool::from_seed(1, 1, 0);
    let log = Log::default();
    BatchedStrategy
        .process_batch(
            scripted_batch(&[("a", 1), ("b", 3), ("c", 2)], &log),
            &mut pool,
            &net,
        )
        .unwrap();
    // rounds go as far as the longest protocol
    assert_eq!(net.flushes(), 3);
    assert_eq!(
        *log.lock(),
        vec!["a:0", "b:0", "c:0", "b:1", "c:1", "b:2"]
    );
}

#[test]
#[should_panic(expected = "batch is at capacity")]
fn overfilling_a_batch_panics() {
    let log = Log::default();
    let mut batch: ProtocolCollection<CountingNetwork> = ProtocolCollection::with_capacity(1);
    batch.push(Box::new(ScriptedProtocol::new("a", 1, log.clone())));
    batch.push(Box::new(ScriptedProtocol::new("b", 1, log)));
}

#[test]
fn evaluating_past_done_fails_loudly() {
    let net = CountingNetwork::new();
    let mut pool = ResourcePool::from_seed(1, 1, 0);
    let log = Log::default();
    let mut protocol = ScriptedProtocol::new("a", 1, log);
    assert_eq!(
        protocol.evaluate(0, &mut pool, &net).unwrap(),
        EvaluationStatus::IsDone
    );
    assert!(matches!(
        protocol.evaluate(1, &mut pool, &net),
        Err(EvalError::AlreadyDone { round: 1 })
    ));
}

#[test]
fn sequential_composition_never_interleaves() {
    let net = CountingNetwork::new();
    let mut pool = ResourcePool::from_seed(1, 1, 0);
    let log = Log::default();
    let mut producer = SequentialProducer::new();
    producer.push_protocol(ScriptedProtocol::new("a", 2, log.clone()));
    producer.push_protocol(ScriptedProtocol::new("b", 2, log.clone()));
    ProtocolEvaluator::new(BatchedStrategy)
        .eval(&mut producer, &mut pool, &net)
        .unwrap();
    // b only starts after a is done
    assert_eq!(*log.lock(), vec!["a:0", "a:1", "b:0", "b:1"]);
}

#[test]
fn parallel_composition_interleaves_rounds() {
    let net = CountingNetwork::new();
    let mut pool = ResourcePool::from_seed(1, 1, 0);
    let log = Log::default();
    let mut producer = ParallelProducer::new();
    producer.push_protocol(ScriptedProtocol::new("a", 2, log.clone()));
    producer.push_protocol(ScriptedProtocol::new("b", 2, log.clone()));
    ProtocolEvaluator::new(BatchedStrategy)
        .eval(&mut producer, &mut pool, &net)
        .unwrap();
    assert_eq!(*log.lock(), vec!["a:0", "b:0", "a:1", "b:1"]);
    assert_eq!(net.flushes(), 2);
}

#[test]
fn evaluator_respects_the_batch_size() {
    let net = CountingNetwork::new();
    let mut pool = ResourcePool::from_seed(1, 1, 0);
    let log = Log::default();
    let mut producer = ParallelProducer::new();
    for label in ["a", "b", "c", "d", "e"] {
        producer.push_protocol(ScriptedProtocol::new(label, 1, log.clone()));
    }
    ProtocolEvaluator::with_batch_size(BatchedStrategy, 2)
        .eval(&mut producer, &mut pool, &net)
        .unwrap();
    // batches of 2, 2 and 1, each one round long
    assert_eq!(log.lock().len(), 5);
    assert_eq!(net.flushes(), 3);
}

#[test]
fn evaluator_stops_on_a_stuck_producer() {
    struct StuckProducer;
    impl<N: Network> ProtocolProducer<N> for StuckProducer {
        fn fill_batch(&mut self, _batch: &mut ProtocolCollection<N>) {}
        fn is_finished(&self) -> bool {
            false
        }
    }

    let net = CountingNetwork::new();
    let mut pool = ResourcePool::from_seed(1, 1, 0);
    ProtocolEvaluator::new(BatchedStrategy)
        .eval(&mut StuckProducer, &mut pool, &net)
        .unwrap();
    assert_eq!(net.flushes(), 0);
}

#[test]
fn dual_batches_advance_in_lockstep() {
    let net = CountingNetwork::new();
    let mut pool_p = ResourcePool::from_seed(1, 1, 0);
    let mut pool_q = ResourcePool::from_seed(1, 1, 1);
    let log = Log::default();
    DualBatchedStrategy
        .process_batches(
            scripted_batch(&[("p", 2)], &log),
            &mut pool_p,
            scripted_batch(&[("q", 3)], &log),
            &mut pool_q,
            &net,
        )
        .unwrap();
    // one shared flush per round, as many rounds as the longer half
    assert_eq!(net.flushes(), 3);
    assert_eq!(*log.lock(), vec!["p:0", "q:0", "p:1", "q:1", "q:2"]);
}

/// Every party broadcasts a secret in round 0 and sums all shares in round
/// 1, so everyone ends up with the same total without revealing inputs
/// directly to the evaluation layer.
enum SumState {
    NotStarted,
    AwaitingShares,
    Done,
}

struct SumProtocol {
    secret: u64,
    state: SumState,
    output: SharedOutput<u64>,
}

impl SumProtocol {
    fn new(secret: u64, output: SharedOutput<u64>) -> Self {
        Self {
            secret,
            state: SumState::NotStarted,
            output,
        }
    }
}

impl<N: Network> NativeProtocol<N> for SumProtocol {
    fn evaluate(
        &mut self,
        round: usize,
        pool: &mut ResourcePool,
        net: &N,
    ) -> Result<EvaluationStatus, EvalError> {
        match self.state {
            SumState::NotStarted => {
                for to in 1..=pool.num_parties() {
                    net.send(to, &self.secret.to_be_bytes())?;
                }
                self.state = SumState::AwaitingShares;
                Ok(EvaluationStatus::HasMoreRounds)
            }
            SumState::AwaitingShares => {
                let mut sum = 0u64;
                for from in 1..=pool.num_parties() {
                    let buf = net.recv(from)?;
                    let share = u64::from_be_bytes(
                        buf.try_into()
                            .map_err(|_| EvalError::Protocol("malformed share".to_string()))?,
                    );
                    sum = sum.wrapping_add(share);
                }
                self.output.set(sum);
                self.state = SumState::Done;
                Ok(EvaluationStatus::IsDone)
            }
            SumState::Done => Err(EvalError::AlreadyDone { round }),
        }
    }
}

#[test]
fn parties_agree_on_the_sum() {
    let secrets = [17u64, 4, 21];
    let expected: u64 = secrets.iter().sum();
    let nets = LocalNetwork::new(3);
    let outputs: Vec<SharedOutput<u64>> = (0..3).map(|_| SharedOutput::new()).collect();

    let handles = izip!(nets, secrets, outputs.clone())
        .enumerate()
        .map(|(i, (net, secret, output))| {
            std::thread::spawn(move || {
                let mut pool = ResourcePool::new(i + 1, 3);
                let mut producer = SingleProducer::new(SumProtocol::new(secret, output));
                ProtocolEvaluator::new(BatchedStrategy)
                    .eval(&mut producer, &mut pool, &net)
                    .unwrap();
                net.close();
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    for output in outputs {
        assert_eq!(output.take(), Some(expected));
    }
}

#[test]
fn sequential_sums_run_back_to_back() {
    let nets = LocalNetwork::new(2);
    let outputs: Vec<[SharedOutput<u64>; 2]> = (0..2)
        .map(|_| [SharedOutput::new(), SharedOutput::new()])
        .collect();

    let handles = izip!(nets, outputs.clone())
        .enumerate()
        .map(|(i, (net, [first, second]))| {
            std::thread::spawn(move || {
                let my_id = i as u64 + 1;
                let mut pool = ResourcePool::new(i + 1, 2);
                let mut producer = SequentialProducer::new();
                producer.push_protocol(SumProtocol::new(my_id * 10, first));
                producer.push_protocol(SumProtocol::new(my_id * 100, second));
                ProtocolEvaluator::new(BatchedStrategy)
                    .eval(&mut producer, &mut pool, &net)
                    .unwrap();
                net.close();
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    for [first, second] in outputs {
        assert_eq!(first.take(), Some(30));
        assert_eq!(second.take(), Some(300));
    }
}
