use std::{
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use pof_rs::{
    networking::{FanoutCursor, Message, Network, PeerEvent, PeerID},
    types::basic::{Address, PublicHash},
};

/// The part a node plays on the mock network, which decides how other nodes see it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Observer,
    Formulator(Address),
    Node,
}

#[derive(Clone)]
struct Endpoint {
    public_hash: PublicHash,
    role: Role,
    inbox: Sender<PeerEvent>,
}

/// A mock network stub which passes messages from and to threads using channels.
///
/// Observers see each other as [`PeerID::Observer`], and formulators as [`PeerID::Formulator`]. Every
/// other pair of nodes sees each other as [`PeerID::Node`]. Observers are not connected to plain nodes.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: usize,
    endpoints: Arc<Vec<Endpoint>>,
    inbox: Arc<Mutex<Receiver<PeerEvent>>>,
    cursor: Arc<Mutex<FanoutCursor>>,
    removed: Arc<Mutex<Vec<PeerID>>>,
}

/// How a node playing `viewer` sees `target`, or `None` if the two are not connected.
fn view(viewer: Role, target: &Endpoint) -> Option<PeerID> {
    match (viewer, target.role) {
        (_, Role::Observer) => Some(PeerID::Observer(target.public_hash)),
        (Role::Observer, Role::Formulator(address)) => Some(PeerID::Formulator(address)),
        (Role::Observer, Role::Node) => None,
        (_, _) => Some(PeerID::Node(target.public_hash)),
    }
}

impl NetworkStub {
    fn my_role(&self) -> Role {
        self.endpoints[self.me].role
    }

    fn deliver(&self, target: &Endpoint, message: Message) {
        if let Some(origin) = view(target.role, &self.endpoints[self.me]) {
            let _ = target.inbox.send(PeerEvent::Message(origin, message));
        }
    }

    fn endpoint_of(&self, peer: PeerID) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != self.me)
            .map(|(_, endpoint)| endpoint)
            .find(|endpoint| view(self.my_role(), endpoint) == Some(peer))
    }

    /// Peers this stub was asked to disconnect, in order.
    pub(crate) fn removed_peers(&self) -> Vec<PeerID> {
        self.removed.lock().unwrap().clone()
    }

    /// How other nodes playing `viewer` see this stub's node.
    pub(crate) fn seen_by(&self, viewer: Role) -> PeerID {
        view(viewer, &self.endpoints[self.me]).unwrap()
    }
}

impl Network for NetworkStub {
    fn send(&mut self, peer: PeerID, message: Message) {
        if let Some(target) = self.endpoint_of(peer) {
            self.deliver(target, message);
        }
    }

    fn broadcast(&mut self, message: Message) {
        for peer in self.peers() {
            self.send(peer, message.clone());
        }
    }

    fn except_cast_limit(&mut self, except: Option<PeerID>, message: Message, limit: usize) {
        let targets = self
            .cursor
            .lock()
            .unwrap()
            .select(&self.peers(), except.as_ref(), limit);
        for peer in targets {
            self.send(peer, message.clone());
        }
    }

    fn remove_peer(&mut self, peer: PeerID) {
        self.removed.lock().unwrap().push(peer);
    }

    fn peers(&self) -> Vec<PeerID> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != self.me)
            .filter_map(|(_, endpoint)| view(self.my_role(), endpoint))
            .collect()
    }

    fn recv(&mut self) -> Option<PeerEvent> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

/// Connect every pair of `peers`. Each stub starts with a [`PeerEvent::Connected`] for each of its peers
/// in its inbox.
pub(crate) fn mock_network(peers: impl Iterator<Item = (PublicHash, Role)>) -> Vec<NetworkStub> {
    let (endpoints, inboxes): (Vec<Endpoint>, Vec<Receiver<PeerEvent>>) = peers
        .map(|(public_hash, role)| {
            let (sender, receiver) = mpsc::channel();
            (
                Endpoint {
                    public_hash,
                    role,
                    inbox: sender,
                },
                receiver,
            )
        })
        .unzip();
    let endpoints = Arc::new(endpoints);

    inboxes
        .into_iter()
        .enumerate()
        .map(|(me, inbox)| {
            let stub = NetworkStub {
                me,
                endpoints: endpoints.clone(),
                inbox: Arc::new(Mutex::new(inbox)),
                cursor: Arc::new(Mutex::new(FanoutCursor::new())),
                removed: Arc::new(Mutex::new(Vec::new())),
            };
            for peer in stub.peers() {
                let _ = endpoints[me].inbox.send(PeerEvent::Connected(peer));
            }
            stub
        })
        .collect()
}
