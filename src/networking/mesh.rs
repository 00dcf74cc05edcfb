/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A [`Network`] over plain TCP.
//!
//! A `PeerMesh` listens for inbound connections and keeps dialing its seed peers until a session with
//! them is live, in either direction. Every session is authenticated by the [handshake](super::handshake)
//! and then served by two threads: a reader that decodes frames into [`PeerEvent`]s, and a writer that
//! drains the session's bounded send queue. Sends never block: when a queue is full the message is
//! dropped, and the voting protocols recover through their retries.
//!
//! There is at most one session per peer. A reconnect from the same direction replaces the old session.
//! If both sides dial each other at once, both keep the session dialed by the side with the smaller
//! public hash.

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::types::basic::{Address, ChainID, PublicHash};
use crate::types::crypto_primitives::Keypair;

use super::codec::{encode_frame, read_frame, CodecError};
use super::handshake::{self, HandshakeError};
use super::messages::Message;
use super::network::{FanoutCursor, Network, PeerEvent, PeerID};

/// Decides who may connect to a mesh, and as what. Receives the public hash proven by the handshake and
/// the address the client claims to act for.
pub type Authorizer = Arc<dyn Fn(&PublicHash, Option<&Address>) -> Option<PeerID> + Send + Sync>;

/// Accept anyone, as a [`PeerID::Node`].
pub fn allow_nodes() -> Authorizer {
    Arc::new(|public_hash, _| Some(PeerID::Node(*public_hash)))
}

/// Accept only the given observers.
pub fn allow_observers(observers: impl IntoIterator<Item = PublicHash>) -> Authorizer {
    let observers: HashSet<PublicHash> = observers.into_iter().collect();
    Arc::new(move |public_hash, _| {
        observers
            .contains(public_hash)
            .then_some(PeerID::Observer(*public_hash))
    })
}

#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [MeshConfiguration]. On the builder call the following methods to
    construct a valid [MeshConfiguration].

    Required:
    - `.me(...)`
    - `.chain_id(...)`
"))]
pub struct MeshConfiguration {
    #[builder(setter(doc = "Set the key this node authenticates with. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the chain ID of the blockchain. Required."))]
    pub chain_id: ChainID,
    #[builder(default, setter(strip_option, doc = "Set the address to accept connections on."))]
    pub listen: Option<SocketAddr>,
    #[builder(default, setter(doc = "Set the peers to keep dialing, and where to reach them."))]
    pub seeds: Vec<(PeerID, SocketAddr)>,
    #[builder(default, setter(strip_option, doc = "Set the formulator address to present when dialing observers."))]
    pub address: Option<Address>,
    #[builder(default = allow_nodes())]
    pub authorizer: Authorizer,
    #[builder(default = Duration::from_secs(1))]
    pub reconnect_interval: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub connect_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub handshake_timeout: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub max_timestamp_skew: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub write_timeout: Duration,
    #[builder(default = 1024)]
    pub send_queue_capacity: usize,
}

struct Session {
    id: u64,
    outbound: bool,
    sender: SyncSender<Arc<Vec<u8>>>,
    stream: TcpStream,
}

#[derive(Default)]
struct MeshState {
    sessions: HashMap<PeerID, Session>,
    banned: HashSet<PeerID>,
    next_session_id: u64,
    cursor: FanoutCursor,
}

struct MeshInner {
    config: MeshConfiguration,
    keypair: Keypair,
    state: Mutex<MeshState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    close: AtomicBool,
}

impl MeshInner {
    fn state(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, thread: JoinHandle<()>) {
        let mut threads = self.threads.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        threads.retain(|thread| !thread.is_finished());
        threads.push(thread);
    }

    fn is_closed(&self) -> bool {
        self.close.load(Ordering::Acquire)
    }
}

/// Handle to a running TCP mesh. Clones share the same sessions.
#[derive(Clone)]
pub struct PeerMesh {
    inner: Arc<MeshInner>,
    events: Arc<Mutex<Receiver<PeerEvent>>>,
    local_address: Option<SocketAddr>,
}

impl PeerMesh {
    /// Bind the listener (if configured) and start the listener and dialer threads.
    pub fn start(config: MeshConfiguration) -> io::Result<PeerMesh> {
        let keypair = Keypair::new(config.me.clone());
        let listener = match config.listen {
            Some(listen) => {
                let listener = TcpListener::bind(listen)?;
                listener.set_nonblocking(true)?;
                Some(listener)
            }
            None => None,
        };
        let local_address = listener
            .as_ref()
            .map(|listener| listener.local_addr())
            .transpose()?;

        let inner = Arc::new(MeshInner {
            config,
            keypair,
            state: Mutex::new(MeshState::default()),
            threads: Mutex::new(Vec::new()),
            close: AtomicBool::new(false),
        });
        let (to_events, events) = mpsc::channel();

        if let Some(listener) = listener {
            let listener_thread = start_listener(inner.clone(), listener, to_events.clone());
            inner.track(listener_thread);
        }
        let dialer_thread = start_dialer(inner.clone(), to_events);
        inner.track(dialer_thread);

        Ok(PeerMesh {
            inner,
            events: Arc::new(Mutex::new(events)),
            local_address,
        })
    }

    /// The address the listener is bound to, if any.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    pub fn public_hash(&self) -> PublicHash {
        self.inner.keypair.public_hash()
    }

    /// Close every session and join every thread of the mesh.
    pub fn shutdown(&self) {
        self.inner.close.store(true, Ordering::Release);
        let sessions: Vec<Session> = self.inner.state().sessions.drain().map(|(_, session)| session).collect();
        for session in sessions {
            let _ = session.stream.shutdown(Shutdown::Both);
        }

        let threads: Vec<JoinHandle<()>> = self
            .inner
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for thread in threads {
            let _ = thread.join();
        }
    }

    fn send_frame(&self, peers: &[PeerID], message: &Message) {
        let frame = match encode_frame(message) {
            Ok(frame) => Arc::new(frame),
            Err(error) => {
                log::warn!("dropping {}: {}", message.name(), error);
                return;
            }
        };

        let state = self.inner.state();
        for peer in peers {
            if let Some(session) = state.sessions.get(peer) {
                match session.sender.try_send(frame.clone()) {
                    Ok(()) => (),
                    Err(TrySendError::Full(_)) => {
                        log::warn!("send queue to {} is full, dropping {}", peer, message.name())
                    }
                    Err(TrySendError::Disconnected(_)) => (),
                }
            }
        }
    }
}

impl Network for PeerMesh {
    fn send(&mut self, peer: PeerID, message: Message) {
        self.send_frame(&[peer], &message)
    }

    fn broadcast(&mut self, message: Message) {
        let peers = self.peers();
        self.send_frame(&peers, &message)
    }

    fn except_cast_limit(&mut self, except: Option<PeerID>, message: Message, limit: usize) {
        let targets = {
            let mut state = self.inner.state();
            let peers: Vec<PeerID> = state.sessions.keys().copied().collect();
            state.cursor.select(&peers, except.as_ref(), limit)
        };
        self.send_frame(&targets, &message)
    }

    fn remove_peer(&mut self, peer: PeerID) {
        let removed = self.inner.state().sessions.remove(&peer);
        if let Some(session) = removed {
            let _ = session.stream.shutdown(Shutdown::Both);
            log::info!("removed peer {}", peer);
        }
    }

    fn peers(&self) -> Vec<PeerID> {
        self.inner.state().sessions.keys().copied().collect()
    }

    fn recv(&mut self) -> Option<PeerEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .try_recv()
            .ok()
    }
}

fn start_listener(
    inner: Arc<MeshInner>,
    listener: TcpListener,
    to_events: Sender<PeerEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !inner.is_closed() {
            match listener.accept() {
                Ok((stream, remote_address)) => {
                    // The handshake may block for up to `handshake_timeout`, so it runs off the accept loop.
                    let handshake_inner = inner.clone();
                    let to_events = to_events.clone();
                    let handshake_thread = thread::spawn(move || {
                        if let Err(error) = accept_inbound(&handshake_inner, stream, &to_events) {
                            log::debug!("refused connection from {}: {}", remote_address, error);
                        }
                    });
                    inner.track(handshake_thread);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20))
                }
                Err(error) => {
                    log::warn!("accept failed: {}", error);
                    thread::sleep(Duration::from_millis(100))
                }
            }
        }
    })
}

fn accept_inbound(
    inner: &Arc<MeshInner>,
    mut stream: TcpStream,
    to_events: &Sender<PeerEvent>,
) -> Result<(), HandshakeError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(inner.config.handshake_timeout))?;
    stream.set_write_timeout(Some(inner.config.handshake_timeout))?;

    let mut remote = None;
    let peer = handshake::accept(
        &mut stream,
        &inner.keypair,
        inner.config.chain_id,
        inner.config.max_timestamp_skew,
        |public_hash, address| {
            remote = Some(*public_hash);
            (inner.config.authorizer)(public_hash, address)
        },
    )?;
    let remote = remote.ok_or_else(|| HandshakeError::InvalidHandshake("no client key".to_string()))?;
    register(inner, peer, remote, false, stream, to_events)?;
    Ok(())
}

fn start_dialer(inner: Arc<MeshInner>, to_events: Sender<PeerEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !inner.is_closed() {
            for (peer, address) in inner.config.seeds.clone() {
                if inner.is_closed() {
                    return;
                }
                let skip = {
                    let state = inner.state();
                    state.sessions.contains_key(&peer) || state.banned.contains(&peer)
                };
                if skip {
                    continue;
                }

                match dial(&inner, peer, address, &to_events) {
                    Ok(()) => log::info!("connected to {} at {}", peer, address),
                    Err(HandshakeError::SelfConnection) => {
                        log::warn!("seed {} at {} is this node, not dialing it again", peer, address);
                        inner.state().banned.insert(peer);
                    }
                    Err(error) => log::debug!("dialing {} at {} failed: {}", peer, address, error),
                }
            }

            let wake_up = Instant::now() + inner.config.reconnect_interval;
            while !inner.is_closed() && Instant::now() < wake_up {
                thread::sleep(Duration::from_millis(20));
            }
        }
    })
}

fn dial(
    inner: &Arc<MeshInner>,
    peer: PeerID,
    address: SocketAddr,
    to_events: &Sender<PeerEvent>,
) -> Result<(), HandshakeError> {
    let mut stream = TcpStream::connect_timeout(&address, inner.config.connect_timeout)?;
    stream.set_read_timeout(Some(inner.config.handshake_timeout))?;
    stream.set_write_timeout(Some(inner.config.handshake_timeout))?;

    let remote = handshake::connect(
        &mut stream,
        &inner.keypair,
        inner.config.chain_id,
        inner.config.max_timestamp_skew,
        inner.config.address,
    )?;
    let expected = match peer {
        PeerID::Observer(public_hash) | PeerID::Node(public_hash) => public_hash == remote,
        PeerID::Formulator(address) => {
            (inner.config.authorizer)(&remote, Some(&address)) == Some(peer)
        }
    };
    if !expected {
        return Err(HandshakeError::InvalidPeerKey(remote));
    }
    register(inner, peer, remote, true, stream, to_events)?;
    Ok(())
}

/// Install a session for an authenticated stream and start its reader and writer.
fn register(
    inner: &Arc<MeshInner>,
    peer: PeerID,
    remote: PublicHash,
    outbound: bool,
    stream: TcpStream,
    to_events: &Sender<PeerEvent>,
) -> io::Result<()> {
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(Some(inner.config.write_timeout))?;
    stream.set_nodelay(true)?;
    let reader_stream = stream.try_clone()?;
    let writer_stream = stream.try_clone()?;

    let mut state = inner.state();
    let replaced = match state.sessions.get(&peer) {
        Some(existing) => {
            if existing.outbound != outbound {
                // Simultaneous dials: keep the session dialed by the smaller public hash.
                let keep_outbound = inner.keypair.public_hash() < remote;
                if existing.outbound == keep_outbound {
                    let _ = stream.shutdown(Shutdown::Both);
                    return Ok(());
                }
            }
            true
        }
        None => false,
    };

    let id = state.next_session_id;
    state.next_session_id += 1;
    let (sender, receiver) = mpsc::sync_channel(inner.config.send_queue_capacity);
    let session = Session {
        id,
        outbound,
        sender,
        stream,
    };
    if let Some(old) = state.sessions.insert(peer, session) {
        let _ = old.stream.shutdown(Shutdown::Both);
    }
    drop(state);

    inner.track(start_writer(writer_stream, receiver));
    inner.track(start_reader(
        inner.clone(),
        peer,
        id,
        reader_stream,
        to_events.clone(),
    ));
    if !replaced {
        let _ = to_events.send(PeerEvent::Connected(peer));
    }
    Ok(())
}

fn start_writer(mut stream: TcpStream, frames: Receiver<Arc<Vec<u8>>>) -> JoinHandle<()> {
    thread::spawn(move || {
        // Ends when the session is dropped from the mesh.
        for frame in frames {
            if let Err(error) = stream.write_all(&frame).and_then(|_| stream.flush()) {
                log::debug!("write failed: {}", error);
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        }
    })
}

fn start_reader(
    inner: Arc<MeshInner>,
    peer: PeerID,
    session_id: u64,
    mut stream: TcpStream,
    to_events: Sender<PeerEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            match read_frame(&mut stream) {
                Ok(message) => {
                    if to_events.send(PeerEvent::Message(peer, message)).is_err() {
                        break;
                    }
                }
                Err(CodecError::Io(_)) => break,
                Err(error) => {
                    log::warn!("closing session with {}: {}", peer, error);
                    break;
                }
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        let mut state = inner.state();
        let current = state
            .sessions
            .get(&peer)
            .map_or(false, |session| session.id == session_id);
        if current {
            state.sessions.remove(&peer);
            drop(state);
            let _ = to_events.send(PeerEvent::Disconnected(peer));
        }
    })
}
