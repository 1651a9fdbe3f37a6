//! TCP MPC network.
//!
//! Every pair of parties is connected twice: each party dials every other
//! party (that stream carries our outgoing frames) and accepts one inbound
//! stream from every other party (that stream carries their frames to us).
//! The inbound side learns who it is talking to from a 1-byte party id sent
//! right after connecting. The handshake is deliberately not authenticated;
//! a peer claiming a foreign id can only be ruled out by an authenticated
//! channel at a higher layer.

use std::{
    collections::BTreeSet,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use intmap::IntMap;
use parking_lot::Mutex;
use socket2::{Domain, Socket, TcpKeepalive, Type};

use crate::{
    ConnectionStats, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_MAX_FRAME_LENGTH, Network, NetworkError,
    config::NetworkConfig,
};

/// Spacing between outbound connection attempts during setup.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
/// How long queued writes may keep draining after [`Network::close`].
const CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(500);
/// Receive queue depth per peer; a full queue stalls that peer's receiver
/// thread as a backpressure valve.
const QUEUE_CAPACITY: usize = 1024;

enum SendJob {
    Frame(Vec<u8>),
    Flush(Sender<io::Result<()>>),
    Shutdown,
}

/// The write side of one connection: a worker thread owns the stream and
/// serializes all writes to this destination.
struct SendHandle {
    jobs: Sender<SendJob>,
    /// Disconnects once the worker exits.
    done: Receiver<()>,
    /// Clone of the worker's stream, kept to force a shutdown.
    stream: TcpStream,
    sent: AtomicUsize,
}

/// The read side of one connection. `stream` is `None` for the self queue.
struct RecvHandle {
    queue: Receiver<io::Result<Vec<u8>>>,
    stream: Option<TcpStream>,
    received: AtomicUsize,
}

/// A MPC network using [TcpStream]s.
pub struct TcpNetwork {
    id: usize,
    num_parties: usize,
    send: IntMap<usize, SendHandle>,
    recv: IntMap<usize, RecvHandle>,
    self_send: Mutex<Option<Sender<io::Result<Vec<u8>>>>>,
    closed: AtomicBool,
    timeout: Duration,
    max_frame_length: usize,
}

impl TcpNetwork {
    /// Establish connections to all parties in `config` and perform the
    /// identity handshake.
    ///
    /// Dials every other party with `max(1, timeout / 500ms)` attempts spaced
    /// 500 ms apart, then writes our own id byte on every outbound stream
    /// while a dedicated thread accepts the N-1 inbound connections and reads
    /// their id bytes. Any failure tears down everything opened so far, so
    /// the bind address is immediately reusable.
    pub fn new(config: NetworkConfig) -> Result<Self, NetworkError> {
        config.check()?;
        let id = config.my_id;
        let num_parties = config.parties.len();
        let timeout = config.timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        let max_frame_length = config.max_frame_length.unwrap_or(DEFAULT_MAX_FRAME_LENGTH);

        let listener = bind_listener(config.bind_addr, timeout)?;
        let expected = config
            .parties
            .iter()
            .map(|p| p.id)
            .filter(|&p| p != id)
            .collect::<BTreeSet<_>>();
        let acceptor = std::thread::spawn(move || accept_inbound(listener, expected, timeout));

        let outbound = match Self::connect_outbound(&config, timeout) {
            Ok(outbound) => outbound,
            Err(err) => {
                // wait for the acceptor so the listener is released before
                // we report the failure
                let _ = acceptor.join();
                return Err(err);
            }
        };
        let (outbound, inbound) = Self::handshake(id, outbound, acceptor)?;
        tracing::debug!("party {id}: handshake with {num_parties} parties complete");
        Self::start(id, num_parties, outbound, inbound, timeout, max_frame_length)
    }

    /// Dial every other party, in id order.
    fn connect_outbound(
        config: &NetworkConfig,
        timeout: Duration,
    ) -> Result<Vec<(usize, TcpStream)>, NetworkError> {
        let attempts = (timeout.as_millis() / CONNECT_RETRY_INTERVAL.as_millis()).max(1) as usize;
        let mut outbound = Vec::with_capacity(config.parties.len().saturating_sub(1));
        for party in &config.parties {
            if party.id == config.my_id {
                continue;
            }
            let addr = party
                .address
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| NetworkError::Resolve(party.address.to_string()))?;
            let mut stream = None;
            for attempt in 1..=attempts {
                let start = Instant::now();
                match TcpStream::connect_timeout(&addr, CONNECT_RETRY_INTERVAL) {
                    Ok(s) => {
                        stream = Some(s);
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(
                            "party {}: connect attempt {attempt}/{attempts} to party {} failed: {err}",
                            config.my_id,
                            party.id
                        );
                        if attempt < attempts {
                            if let Some(rest) = CONNECT_RETRY_INTERVAL.checked_sub(start.elapsed())
                            {
                                std::thread::sleep(rest);
                            }
                        }
                    }
                }
            }
            let stream = stream.ok_or(NetworkError::ConnectTimeout {
                party: party.id,
                addr,
                attempts,
            })?;
            // disable packet buffering, important for latency of small frames
            stream
                .set_nodelay(true)
                .and_then(|()| stream.set_write_timeout(Some(timeout)))
                .map_err(|source| NetworkError::Io {
                    party: party.id,
                    source,
                })?;
            outbound.push((party.id, stream));
        }
        Ok(outbound)
    }

    /// Identify ourselves on every outbound stream and collect the inbound
    /// streams gathered by the acceptor thread.
    #[expect(clippy::type_complexity)]
    fn handshake(
        id: usize,
        mut outbound: Vec<(usize, TcpStream)>,
        acceptor: JoinHandle<Result<Vec<(usize, TcpStream)>, NetworkError>>,
    ) -> Result<(Vec<(usize, TcpStream)>, Vec<(usize, TcpStream)>), NetworkError> {
        let mut write_err = None;
        for (party, stream) in outbound.iter_mut() {
            if let Err(err) = stream.write_u8(id as u8) {
                write_err = Some(NetworkError::Handshake(format!(
                    "writing own id to party {party}: {err}"
                )));
                break;
            }
        }
        let inbound = match acceptor.join() {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Handshake(
                "accept thread panicked".to_string(),
            )),
        };
        if let Some(err) = write_err {
            return Err(err);
        }
        Ok((outbound, inbound?))
    }

    /// Spawn the per-connection worker threads and assemble the network.
    fn start(
        id: usize,
        num_parties: usize,
        outbound: Vec<(usize, TcpStream)>,
        inbound: Vec<(usize, TcpStream)>,
        timeout: Duration,
        max_frame_length: usize,
    ) -> Result<Self, NetworkError> {
        let mut send = IntMap::new();
        let mut recv = IntMap::new();

        for (party, stream) in outbound {
            let clone = stream
                .try_clone()
                .map_err(|source| NetworkError::Io { party, source })?;
            send.insert(party, spawn_sender(party, stream, clone));
        }
        for (party, stream) in inbound {
            let clone = stream
                .try_clone()
                .map_err(|source| NetworkError::Io { party, source })?;
            recv.insert(party, spawn_receiver(party, stream, clone, max_frame_length));
        }

        // the self queue never touches the wire
        let (self_tx, self_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        recv.insert(
            id,
            RecvHandle {
                queue: self_rx,
                stream: None,
                received: AtomicUsize::default(),
            },
        );

        Ok(Self {
            id,
            num_parties,
            send,
            recv,
            self_send: Mutex::new(Some(self_tx)),
            closed: AtomicBool::new(false),
            timeout,
            max_frame_length,
        })
    }
}

impl Network for TcpNetwork {
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
        if data.len() > self.max_frame_length {
            return Err(NetworkError::FrameTooLarge {
                len: data.len(),
                max: self.max_frame_length,
            });
        }
        if to == self.id {
            let guard = self.self_send.lock();
            let tx = guard.as_ref().ok_or(NetworkError::Closed)?;
            return tx
                .send(Ok(data.to_vec()))
                .map_err(|_| NetworkError::Closed);
        }
        let handle = self.send.get(to).ok_or(NetworkError::UnknownParty(to))?;
        handle.sent.fetch_add(data.len(), Ordering::Relaxed);
        handle
            .jobs
            .send(SendJob::Frame(data.to_vec()))
            .map_err(|_| NetworkError::Closed)
    }

    fn recv(&self, from: usize) -> Result<Vec<u8>, NetworkError> {
        let handle = self.recv.get(from).ok_or(NetworkError::UnknownParty(from))?;
        match handle.queue.recv_timeout(self.timeout) {
            Ok(Ok(data)) => {
                handle.received.fetch_add(data.len(), Ordering::Relaxed);
                Ok(data)
            }
            Ok(Err(source)) => {
                if self.closed.load(Ordering::Acquire) {
                    Err(NetworkError::Closed)
                } else {
                    Err(NetworkError::Io {
                        party: from,
                        source,
                    })
                }
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
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed);
        }
        // post a flush job to every worker first, then collect the acks, so
        // the flushes overlap
        let mut acks = Vec::new();
        for (party, handle) in self.send.iter() {
            let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
            handle
                .jobs
                .send(SendJob::Flush(ack_tx))
                .map_err(|_| NetworkError::Closed)?;
            acks.push((party, ack_rx));
        }
        for (party, ack) in acks {
            match ack.recv_timeout(self.timeout) {
                Ok(Ok(())) => {}
                Ok(Err(source)) => return Err(NetworkError::Io { party, source }),
                Err(_) => {
                    return if self.closed.load(Ordering::Acquire) {
                        Err(NetworkError::Closed)
                    } else {
                        Err(NetworkError::Io {
                            party,
                            source: io::Error::new(io::ErrorKind::TimedOut, "flush timed out"),
                        })
                    };
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("party {}: closing network", self.id);
        // wake local receivers of the self queue
        self.self_send.lock().take();
        // queued writes drain in order before the worker sees the shutdown
        for (_, handle) in self.send.iter() {
            let _ = handle.jobs.send(SendJob::Shutdown);
        }
        // one grace period shared by all workers, not one per worker
        let deadline = Instant::now() + CLOSE_GRACE_PERIOD;
        for (party, handle) in self.send.iter() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(RecvTimeoutError::Timeout) = handle.done.recv_timeout(remaining) {
                tracing::warn!(
                    "party {}: sender to party {party} did not drain in time",
                    self.id
                );
            }
            let _ = handle.stream.shutdown(Shutdown::Both);
        }
        // kills the receiver threads, which wakes anyone blocked in recv
        for (_, handle) in self.recv.iter() {
            if let Some(stream) = &handle.stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    fn connection_stats(&self) -> ConnectionStats {
        let mut stats = std::collections::BTreeMap::new();
        for (id, handle) in self.send.iter() {
            let received = &self.recv.get(id).expect("was in send so must be in recv").received;
            stats.insert(
                id,
                (
                    handle.sent.load(Ordering::Relaxed),
                    received.load(Ordering::Relaxed),
                ),
            );
        }
        ConnectionStats {
            my_id: self.id,
            stats,
        }
    }
}

impl Drop for TcpNetwork {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpNetwork")
            .field("id", &self.id)
            .field("num_parties", &self.num_parties)
            .finish_non_exhaustive()
    }
}

fn bind_listener(bind_addr: SocketAddr, timeout: Duration) -> Result<TcpListener, NetworkError> {
    let bind = |addr: SocketAddr| -> io::Result<TcpListener> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        // set read_timeout to get a timeout in accept if a party never connects
        socket.set_read_timeout(Some(timeout))?;
        let keepalive = TcpKeepalive::new().with_interval(Duration::from_secs(1));
        socket.set_tcp_keepalive(&keepalive)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        Ok(TcpListener::from(socket))
    };
    bind(bind_addr).map_err(|source| NetworkError::Bind {
        addr: bind_addr,
        source,
    })
}

/// Accept one inbound connection per expected party and read the 1-byte id
/// each peer announces. The sender id is trusted as announced.
fn accept_inbound(
    listener: TcpListener,
    mut expected: BTreeSet<usize>,
    timeout: Duration,
) -> Result<Vec<(usize, TcpStream)>, NetworkError> {
    let mut inbound = Vec::with_capacity(expected.len());
    while !expected.is_empty() {
        let (mut stream, peer_addr) = listener
            .accept()
            .map_err(|err| NetworkError::Handshake(format!("accepting inbound: {err}")))?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|err| {
                NetworkError::Handshake(format!("configuring inbound from {peer_addr}: {err}"))
            })?;
        let party = stream.read_u8().map_err(|err| {
            NetworkError::Handshake(format!("reading id from {peer_addr}: {err}"))
        })? as usize;
        if !expected.remove(&party) {
            return Err(NetworkError::Handshake(format!(
                "unexpected party id {party} from {peer_addr}"
            )));
        }
        // the timeout was only for the handshake byte, receiver threads
        // block indefinitely
        stream.set_read_timeout(None).map_err(|err| {
            NetworkError::Handshake(format!("configuring inbound from {peer_addr}: {err}"))
        })?;
        tracing::trace!("accepted inbound connection from party {party} at {peer_addr}");
        inbound.push((party, stream));
    }
    Ok(inbound)
}

/// Spawn the worker that owns the write half towards `party`. All sends to
/// this destination funnel through its job queue and hit the wire in order.
fn spawn_sender(party: usize, mut stream: TcpStream, clone: TcpStream) -> SendHandle {
    let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<SendJob>();
    let (exit_tx, exit_rx) = crossbeam_channel::bounded::<()>(1);
    std::thread::spawn(move || {
        let mut failure: Option<io::Error> = None;
        for job in jobs_rx.iter() {
            match job {
                SendJob::Frame(data) => {
                    if failure.is_some() {
                        continue;
                    }
                    let res = stream
                        .write_u32::<BigEndian>(data.len() as u32)
                        .and_then(|()| stream.write_all(&data));
                    if let Err(err) = res {
                        tracing::warn!("write to party {party} failed: {err}");
                        failure = Some(err);
                    }
                }
                SendJob::Flush(ack) => {
                    let res = match failure.take() {
                        Some(err) => Err(err),
                        None => stream.flush(),
                    };
                    let _ = ack.send(res);
                }
                SendJob::Shutdown => break,
            }
        }
        let _ = stream.flush();
        drop(exit_tx);
    });
    SendHandle {
        jobs: jobs_tx,
        done: exit_rx,
        stream: clone,
        sent: AtomicUsize::default(),
    }
}

/// Spawn the thread that reads frames from `party` into its receive queue.
/// Exits on the first IO error, which it forwards as the final queue item.
fn spawn_receiver(
    party: usize,
    mut stream: TcpStream,
    clone: TcpStream,
    max_frame_length: usize,
) -> RecvHandle {
    let (tx, rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
    std::thread::spawn(move || {
        loop {
            let frame = read_frame(&mut stream, max_frame_length);
            let failed = frame.is_err();
            if tx.send(frame).is_err() || failed {
                break;
            }
        }
        tracing::trace!("receiver for party {party} exited");
    });
    RecvHandle {
        queue: rx,
        stream: Some(clone),
        received: AtomicUsize::default(),
    }
}

fn read_frame(stream: &mut TcpStream, max_frame_length: usize) -> io::Result<Vec<u8>> {
    let len = stream.read_u32::<BigEndian>()? as usize;
    if len > max_frame_length {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum {max_frame_length}"),
        ));
    }
    let mut data = vec![0; len];
    // read_exact loops over partial reads for us
    stream.read_exact(&mut data)?;
    Ok(data)
}
