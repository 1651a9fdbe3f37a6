//! In-process MPC network backed by channels. Used for tests and examples.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use intmap::IntMap;

use crate::{ConnectionStats, DEFAULT_CONNECTION_TIMEOUT, Network, NetworkError};

const QUEUE_CAPACITY: usize = 1024;
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_millis(500);

enum Packet {
    Data(Vec<u8>),
    Closed,
}

/// A MPC network using channels instead of sockets. One instance per party,
/// all wired up pairwise (self loops included) by [`LocalNetwork::new`].
pub struct LocalNetwork {
    id: usize,
    num_parties: usize,
    timeout: Duration,
    closed: AtomicBool,
    send: IntMap<usize, (Sender<Packet>, AtomicUsize)>,
    recv: IntMap<usize, (Receiver<Packet>, AtomicUsize)>,
    /// Senders into our own inbound queues, used to wake blocked receivers
    /// on close.
    wakers: IntMap<usize, Sender<Packet>>,
}

impl LocalNetwork {
    /// Create new [`LocalNetwork`]s for `num_parties` parties with ids
    /// `1..=num_parties`.
    pub fn new(num_parties: usize) -> Vec<Self> {
        Self::new_with_timeout(num_parties, DEFAULT_CONNECTION_TIMEOUT)
    }

    /// Create new [`LocalNetwork`]s for `num_parties` parties, setting the
    /// receive timeout.
    pub fn new_with_timeout(num_parties: usize, timeout: Duration) -> Vec<Self> {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        let mut wakers = Vec::new();
        for _ in 0..num_parties {
            senders.push(IntMap::new());
            receivers.push(IntMap::new());
            wakers.push(IntMap::new());
        }

        for i in 1..=num_parties {
            for j in 1..=num_parties {
                let (tx, rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
                senders[i - 1].insert(j, (tx.clone(), AtomicUsize::default()));
                receivers[j - 1].insert(i, (rx, AtomicUsize::default()));
                wakers[j - 1].insert(i, tx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .zip(wakers)
            .enumerate()
            .map(|(id, ((send, recv), wakers))| LocalNetwork {
                id: id + 1,
                num_parties,
                timeout,
                closed: AtomicBool::new(false),
                send,
                recv,
                wakers,
            })
            .collect()
    }

    /// Create new [`LocalNetwork`]s for 3 parties.
    pub fn new_3_parties() -> [Self; 3] {
        Self::new(3).try_into().expect("correct len")
    }
}

impl Network for LocalNetwork {
    fn id(&self) -> usize {
        self.id
    }

    fn num_parties(&self) -> usize {
        self.num_parties
    }

    fn send(&self, to: usize, data: &[u8]) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed);
        }
        let (sender, sent_bytes) = self.send.get(to).ok_or(NetworkError::UnknownParty(to))?;
        sent_bytes.fetch_add(data.len(), Ordering::Relaxed);
        sender
            .send_timeout(Packet::Data(data.to_owned()), self.timeout)
            .map_err(|_| NetworkError::Closed)
    }

    fn recv(&self, from: usize) -> Result<Vec<u8>, NetworkError> {
        let (receiver, recv_bytes) = self.recv.get(from).ok_or(NetworkError::UnknownParty(from))?;
        match receiver.recv_timeout(self.timeout) {
            Ok(Packet::Data(data)) => {
                recv_bytes.fetch_add(data.len(), Ordering::Relaxed);
                Ok(data)
            }
            Ok(Packet::Closed) => {
                // keep the marker in the queue for other blocked receivers
                if let Some(waker) = self.wakers.get(from) {
                    let _ = waker.try_send(Packet::Closed);
                }
                Err(NetworkError::Closed)
            }
            Err(RecvTimeoutError::Disconnected) => Err(NetworkError::Closed),
            Err(RecvTimeoutError::Timeout) => {
                if self.closed.load(Ordering::Acquire) {
                    Err(NetworkError::Closed)
                } else {
                    Err(NetworkError::RecvTimeout(from))
                }
            }
        }
    }

    fn flush(&self) -> Result<(), NetworkError> {
        // channel sends are already visible to the receiver
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("party {}: closing local network", self.id);
        for (_, waker) in self.wakers.iter() {
            let _ = waker.send_timeout(Packet::Closed, CLOSE_NOTIFY_TIMEOUT);
        }
    }

    fn connection_stats(&self) -> ConnectionStats {
        let mut stats = std::collections::BTreeMap::new();
        for (id, (_, sent_bytes)) in self.send.iter() {
            let recv_bytes = &self.recv.get(id).expect("was in send so must be in recv").1;
            stats.insert(
                id,
                (
                    sent_bytes.load(Ordering::Relaxed),
                    recv_bytes.load(Ordering::Relaxed),
                ),
            );
        }
        ConnectionStats {
            my_id: self.id,
            stats,
        }
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("id", &self.id)
            .field("num_parties", &self.num_parties)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn delivers_byte_identical_messages() {
        let [n1, n2, _n3] = LocalNetwork::new_3_parties();
        n1.send(2, b"hello").unwrap();
        n1.send(2, b"").unwrap();
        assert_eq!(n1.num_parties(), 3);
        assert_eq!(n2.recv(1).unwrap(), b"hello");
        assert_eq!(n2.recv(1).unwrap(), b"");
    }

    #[test]
    fn preserves_order_per_sender() {
        let nets = LocalNetwork::new(2);
        for i in 0..100u8 {
            nets[0].send(2, &[i]).unwrap();
        }
        for i in 0..100u8 {
            assert_eq!(nets[1].recv(1).unwrap(), vec![i]);
        }
    }

    #[test]
    fn self_loop_works_without_peers() {
        let nets = LocalNetwork::new(1);
        nets[0].send(1, b"to myself").unwrap();
        assert_eq!(nets[0].recv(1).unwrap(), b"to myself");
    }

    #[test]
    fn unknown_party_is_rejected() {
        let nets = LocalNetwork::new(2);
        assert!(matches!(
            nets[0].send(3, b"x"),
            Err(NetworkError::UnknownParty(3))
        ));
        assert!(matches!(
            nets[0].recv(0),
            Err(NetworkError::UnknownParty(0))
        ));
    }

    #[test]
    fn close_unblocks_receiver() {
        let mut nets = LocalNetwork::new_with_timeout(2, Duration::from_secs(30));
        let n1 = Arc::new(nets.remove(0));
        let blocked = {
            let n1 = Arc::clone(&n1);
            std::thread::spawn(move || n1.recv(2))
        };
        std::thread::sleep(Duration::from_millis(100));
        n1.close();
        assert!(matches!(blocked.join().unwrap(), Err(NetworkError::Closed)));
        assert!(matches!(n1.send(2, b"x"), Err(NetworkError::Closed)));
        // closing again is a no-op
        n1.close();
    }

    #[test]
    fn tracks_connection_stats() {
        let nets = LocalNetwork::new(2);
        nets[0].send(2, &[0; 64]).unwrap();
        nets[1].recv(1).unwrap();
        let stats = nets[0].connection_stats();
        assert_eq!(stats.stats[&2].0, 64);
        let stats = nets[1].connection_stats();
        assert_eq!(stats.stats[&1].1, 64);
    }
}
